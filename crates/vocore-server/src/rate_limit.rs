//! Sliding-window rate limiting and cooldown-gated action buckets, keyed
//! per identity (IP for pre-auth admission, user id for signaling verbs).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Fixed-capacity sliding window over recent event timestamps.
struct Window {
    events: Vec<Instant>,
    capacity: usize,
    period: Duration,
}

impl Window {
    fn new(capacity: usize, period: Duration) -> Self {
        Self { events: Vec::new(), capacity, period }
    }

    fn try_record(&mut self, now: Instant) -> bool {
        self.events.retain(|&t| now.duration_since(t) < self.period);
        if self.events.len() >= self.capacity {
            return false;
        }
        self.events.push(now);
        true
    }
}

/// A single earliest-next-allowed timestamp for a cooldown-gated action.
struct Cooldown {
    next_allowed_at: Instant,
    interval: Duration,
}

/// Per-identity sliding-window limiter for a single action kind.
pub struct SlidingWindowLimiter<K> {
    windows: Mutex<HashMap<K, Window>>,
    capacity: usize,
    period: Duration,
}

impl<K: std::hash::Hash + Eq + Clone> SlidingWindowLimiter<K> {
    pub fn new(capacity: usize, period: Duration) -> Self {
        Self { windows: Mutex::new(HashMap::new()), capacity, period }
    }

    /// Returns `true` if the action is allowed (and counts it), `false` if
    /// the identity is currently over budget.
    pub async fn check(&self, key: K) -> bool {
        let mut windows = self.windows.lock().await;
        let window = windows
            .entry(key)
            .or_insert_with(|| Window::new(self.capacity, self.period));
        window.try_record(Instant::now())
    }

    /// Drops entries whose window has gone fully idle, bounding memory use
    /// for identities that connect once and never return.
    pub async fn evict_idle(&self) {
        let now = Instant::now();
        let period = self.period;
        self.windows
            .lock()
            .await
            .retain(|_, w| w.events.iter().any(|&t| now.duration_since(t) < period));
    }
}

/// Per-identity cooldown gate: an action is allowed once, then blocked until
/// `interval` has elapsed, returning the remaining wait in milliseconds.
pub struct CooldownGate<K> {
    entries: Mutex<HashMap<K, Cooldown>>,
    interval: Duration,
}

impl<K: std::hash::Hash + Eq + Clone> CooldownGate<K> {
    pub fn new(interval: Duration) -> Self {
        Self { entries: Mutex::new(HashMap::new()), interval }
    }

    /// `Ok(())` if allowed (cooldown reset); `Err(retry_after_ms)` otherwise.
    pub async fn check(&self, key: K) -> Result<(), u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get(&key) {
            if now < entry.next_allowed_at {
                return Err((entry.next_allowed_at - now).as_millis() as u64);
            }
        }

        entries.insert(key, Cooldown { next_allowed_at: now + self.interval, interval: self.interval });
        Ok(())
    }

    pub async fn evict_idle(&self) {
        let now = Instant::now();
        self.entries.lock().await.retain(|_, c| now < c.next_allowed_at + c.interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sliding_window_rejects_over_capacity() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.check("a").await);
        assert!(limiter.check("a").await);
        assert!(!limiter.check("a").await);
    }

    #[tokio::test]
    async fn sliding_window_is_per_identity() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("a").await);
        assert!(limiter.check("b").await);
    }

    #[tokio::test]
    async fn cooldown_blocks_until_interval_elapses() {
        let gate = CooldownGate::new(Duration::from_millis(50));
        assert!(gate.check("user").await.is_ok());
        let err = gate.check("user").await.unwrap_err();
        assert!(err > 0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(gate.check("user").await.is_ok());
    }
}
