//! Server configuration, loaded from the environment (`.env` via `dotenvy`).
//!
//! Follows the same env-var-override-with-defaults shape the rest of the
//! pack uses, but unlike a dev-only default secret, the JWT signing key is
//! required and validated: a server that can't be reached safely should
//! refuse to start rather than run insecurely.

use std::time::Duration;

use anyhow::{bail, Context, Result};

#[derive(Clone)]
pub struct Config {
    pub bind_address: String,

    /// HMAC signing secret for access tokens. Required, >= 32 bytes.
    pub jwt_secret: String,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub magic_code_ttl: Duration,

    pub stun_servers: Vec<String>,
    pub turn_host: Option<String>,
    pub turn_port: u16,
    pub turn_secret: Option<String>,
    pub turn_credential_ttl: Duration,

    pub sfu_udp_port_min: u16,
    pub sfu_udp_port_max: u16,
    pub sfu_public_ip: Option<String>,

    /// Exact-match or single-trailing-wildcard (`app://*`) origin patterns.
    /// Loopback origins are always allowed regardless of this list.
    pub ws_allowed_origins: Vec<String>,
    pub trusted_proxy_cidrs: Vec<String>,

    pub max_unauth_per_ip: u32,
    pub max_unauth_global: u32,
    pub unauth_timeout: Duration,

    pub upload_max_bytes: u64,

    pub voice_join_cooldown: Duration,
    pub voice_state_cooldown: Duration,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v.split(',').map(|s| s.trim().to_string()).collect(),
        _ => default.iter().map(|s| s.to_string()).collect(),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn load() -> Result<Self> {
        let jwt_secret = std::env::var("JWT_SECRET")
            .context("JWT_SECRET must be set — refusing to start with an insecure default")?;
        if jwt_secret.len() < 32 {
            bail!("JWT_SECRET must be at least 32 characters long");
        }

        let bind_address = env_or("BIND_ADDRESS", "0.0.0.0:8080");

        let stun_servers = env_list("STUN_SERVERS", &["stun:stun.l.google.com:19302"]);
        let turn_host = std::env::var("TURN_HOST").ok();
        let turn_port = env_parse("TURN_PORT", 3478u16);
        let turn_secret = std::env::var("TURN_SECRET").ok();
        let turn_credential_ttl = Duration::from_secs(env_parse("TURN_CREDENTIAL_TTL_SECS", 86400));

        let sfu_udp_port_min = env_parse("SFU_UDP_PORT_MIN", 50000u16);
        let sfu_udp_port_max = env_parse("SFU_UDP_PORT_MAX", 50100u16);
        let sfu_public_ip = std::env::var("SFU_PUBLIC_IP").ok();

        let ws_allowed_origins = env_list("WS_ALLOWED_ORIGINS", &[]);
        let trusted_proxy_cidrs = env_list("TRUSTED_PROXY_CIDRS", &[]);

        let max_unauth_per_ip = env_parse("MAX_UNAUTH_PER_IP", 20);
        let max_unauth_global = env_parse("MAX_UNAUTH_GLOBAL", 200);
        let unauth_timeout = Duration::from_secs(env_parse("UNAUTH_TIMEOUT_SECS", 10));

        let upload_max_bytes = env_parse("UPLOAD_MAX_BYTES", 10 * 1024 * 1024u64);

        let voice_join_cooldown = Duration::from_millis(env_parse("VOICE_JOIN_COOLDOWN_MS", 15_000));
        let voice_state_cooldown = Duration::from_millis(env_parse("VOICE_STATE_COOLDOWN_MS", 10_000));

        Ok(Config {
            bind_address,
            jwt_secret,
            access_token_ttl: Duration::from_secs(15 * 60),
            refresh_token_ttl: Duration::from_secs(30 * 24 * 3600),
            magic_code_ttl: Duration::from_secs(10 * 60),
            stun_servers,
            turn_host,
            turn_port,
            turn_secret,
            turn_credential_ttl,
            sfu_udp_port_min,
            sfu_udp_port_max,
            sfu_public_ip,
            ws_allowed_origins,
            trusted_proxy_cidrs,
            max_unauth_per_ip,
            max_unauth_global,
            unauth_timeout,
            upload_max_bytes,
            voice_join_cooldown,
            voice_state_cooldown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn short_jwt_secret_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("JWT_SECRET", "too-short");
        let result = Config::load();
        std::env::remove_var("JWT_SECRET");
        assert!(result.is_err());
    }

    #[test]
    fn missing_jwt_secret_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("JWT_SECRET");
        assert!(Config::load().is_err());
    }

    #[test]
    fn valid_secret_loads_with_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("JWT_SECRET", "x".repeat(32));
        let config = Config::load().unwrap();
        std::env::remove_var("JWT_SECRET");
        assert_eq!(config.max_unauth_per_ip, 20);
        assert_eq!(config.voice_join_cooldown, Duration::from_secs(15));
    }
}
