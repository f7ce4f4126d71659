//! Pre-auth admission control: caps concurrent not-yet-identified
//! connections per source IP and globally, so an unauthenticated flood
//! can't pin down handshake resources before IDENTIFY ever runs.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

pub struct AdmissionControl {
    global: AtomicU32,
    per_ip: Mutex<HashMap<IpAddr, u32>>,
    max_global: u32,
    max_per_ip: u32,
}

/// Held for the lifetime of the pre-auth handshake. Dropping it (handshake
/// succeeded or failed) returns the slot to both budgets.
pub struct AdmissionPermit {
    control: Arc<AdmissionControl>,
    ip: IpAddr,
}

impl AdmissionControl {
    pub fn new(max_per_ip: u32, max_global: u32) -> Arc<Self> {
        Arc::new(Self {
            global: AtomicU32::new(0),
            per_ip: Mutex::new(HashMap::new()),
            max_global,
            max_per_ip,
        })
    }

    /// Returns `None` if either budget is already exhausted for `ip`.
    pub async fn try_admit(self: &Arc<Self>, ip: IpAddr) -> Option<AdmissionPermit> {
        if self.global.load(Ordering::SeqCst) >= self.max_global {
            return None;
        }

        let mut per_ip = self.per_ip.lock().await;
        let count = per_ip.entry(ip).or_insert(0);
        if *count >= self.max_per_ip {
            return None;
        }
        *count += 1;
        drop(per_ip);

        self.global.fetch_add(1, Ordering::SeqCst);
        Some(AdmissionPermit { control: self.clone(), ip })
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.control.global.fetch_sub(1, Ordering::SeqCst);
        let control = self.control.clone();
        let ip = self.ip;
        tokio::spawn(async move {
            let mut per_ip = control.per_ip.lock().await;
            if let Some(count) = per_ip.get_mut(&ip) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    per_ip.remove(&ip);
                }
            }
        });
    }
}

/// Exact match, or a single trailing-wildcard prefix (`app://*`). Loopback
/// origins are always allowed regardless of the configured allowlist.
pub fn origin_allowed(allowed: &[String], origin: Option<&str>) -> bool {
    let Some(origin) = origin else {
        // Non-browser clients (native desktop app) send no Origin header.
        return true;
    };

    if is_loopback_origin(origin) {
        return true;
    }

    allowed.iter().any(|pattern| match pattern.strip_suffix('*') {
        Some(prefix) => origin.starts_with(prefix),
        None => origin == pattern,
    })
}

fn is_loopback_origin(origin: &str) -> bool {
    let without_scheme = origin.split("://").nth(1).unwrap_or(origin);
    let host = without_scheme.split(['/', ':']).next().unwrap_or(without_scheme);
    host == "localhost" || host == "127.0.0.1" || host == "::1"
}

/// Resolves the client IP, honoring `X-Forwarded-For` only when the
/// directly-connecting peer is a trusted reverse proxy.
pub fn resolve_client_ip(peer: IpAddr, trusted_proxy_cidrs: &[String], forwarded_for: Option<&str>) -> IpAddr {
    if !trusted_proxy_cidrs.iter().any(|cidr| cidr_contains(cidr, peer)) {
        return peer;
    }
    let Some(header) = forwarded_for else { return peer };
    header
        .split(',')
        .next()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(peer)
}

/// Minimal IPv4 CIDR containment check (`a.b.c.d/n`); non-IPv4 or
/// unparsable patterns fall back to exact address match.
fn cidr_contains(cidr: &str, addr: IpAddr) -> bool {
    let IpAddr::V4(addr) = addr else {
        return cidr.trim_end_matches("/32") == addr.to_string();
    };

    let Some((base, bits)) = cidr.split_once('/') else {
        return cidr.parse::<std::net::Ipv4Addr>().map(|b| b == addr) == Ok(true);
    };
    let Ok(base) = base.parse::<std::net::Ipv4Addr>() else { return false };
    let Ok(bits) = bits.parse::<u32>() else { return false };
    if bits > 32 {
        return false;
    }
    let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
    u32::from(base) & mask == u32::from(addr) & mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn per_ip_budget_rejects_past_limit() {
        let control = AdmissionControl::new(1, 100);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let first = control.try_admit(ip).await;
        assert!(first.is_some());
        assert!(control.try_admit(ip).await.is_none());
    }

    #[tokio::test]
    async fn dropping_a_permit_frees_the_slot() {
        let control = AdmissionControl::new(1, 100);
        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        {
            let _permit = control.try_admit(ip).await.unwrap();
            assert!(control.try_admit(ip).await.is_none());
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(control.try_admit(ip).await.is_some());
    }

    #[tokio::test]
    async fn global_budget_is_shared_across_ips() {
        let control = AdmissionControl::new(10, 1);
        let a: IpAddr = "10.0.0.3".parse().unwrap();
        let b: IpAddr = "10.0.0.4".parse().unwrap();
        let _first = control.try_admit(a).await.unwrap();
        assert!(control.try_admit(b).await.is_none());
    }

    #[test]
    fn loopback_origin_always_allowed() {
        assert!(origin_allowed(&[], Some("http://localhost:5173")));
        assert!(origin_allowed(&[], Some("app://127.0.0.1")));
    }

    #[test]
    fn wildcard_suffix_matches_prefix() {
        let allowed = vec!["app://*".to_string()];
        assert!(origin_allowed(&allowed, Some("app://desktop-client")));
        assert!(!origin_allowed(&allowed, Some("https://evil.example")));
    }

    #[test]
    fn exact_match_required_without_wildcard() {
        let allowed = vec!["https://chat.example.com".to_string()];
        assert!(origin_allowed(&allowed, Some("https://chat.example.com")));
        assert!(!origin_allowed(&allowed, Some("https://chat.example.com.evil.com")));
    }

    #[test]
    fn cidr_containment_matches_subnet() {
        assert!(cidr_contains("10.0.0.0/8", "10.1.2.3".parse().unwrap()));
        assert!(!cidr_contains("10.0.0.0/8", "11.1.2.3".parse().unwrap()));
    }
}
