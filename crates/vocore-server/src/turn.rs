//! Ephemeral TURN credential minting (the long-term-credential mechanism
//! coturn and friends expect): `username = "<expiry-unix>:<user_id>"`,
//! `credential = base64(HMAC-SHA1(secret, username))`.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use uuid::Uuid;

use crate::config::Config;

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnCredential {
    pub username: String,
    pub credential: String,
}

/// Mints a time-limited TURN credential for `user_id`, valid for
/// `config.turn_credential_ttl`. Returns `None` if no TURN secret is
/// configured (STUN-only deployments never mint one).
pub fn mint_credential(config: &Config, user_id: Uuid) -> Option<TurnCredential> {
    let secret = config.turn_secret.as_ref()?;
    let expiry = Utc::now().timestamp() + config.turn_credential_ttl.as_secs() as i64;
    let username = format!("{expiry}:{user_id}");

    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(username.as_bytes());
    let credential = STANDARD.encode(mac.finalize().into_bytes());

    Some(TurnCredential { username, credential })
}

/// Same server list, as the type the SFU's `RTCConfiguration` expects.
pub fn webrtc_ice_servers(config: &Config, user_id: Uuid) -> Vec<webrtc::ice_transport::ice_server::RTCIceServer> {
    ice_servers(config, user_id)
        .into_iter()
        .map(|s| webrtc::ice_transport::ice_server::RTCIceServer {
            urls: s.urls,
            username: s.username.unwrap_or_default(),
            credential: s.credential.unwrap_or_default(),
        })
        .collect()
}

pub fn ice_servers(config: &Config, user_id: Uuid) -> Vec<vocore_protocol::IceServer> {
    let mut servers: Vec<vocore_protocol::IceServer> = config
        .stun_servers
        .iter()
        .map(|url| vocore_protocol::IceServer {
            urls: vec![url.clone()],
            username: None,
            credential: None,
        })
        .collect();

    if let (Some(host), Some(turn_cred)) = (&config.turn_host, mint_credential(config, user_id)) {
        servers.push(vocore_protocol::IceServer {
            urls: vec![format!("turn:{host}:{}", config.turn_port)],
            username: Some(turn_cred.username),
            credential: Some(turn_cred.credential),
        });
    }

    servers
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> Config {
        Config {
            bind_address: "127.0.0.1:0".into(),
            jwt_secret: "x".repeat(32),
            access_token_ttl: Duration::from_secs(900),
            refresh_token_ttl: Duration::from_secs(2_592_000),
            magic_code_ttl: Duration::from_secs(600),
            stun_servers: vec!["stun:stun.example.com:3478".into()],
            turn_host: Some("turn.example.com".into()),
            turn_port: 3478,
            turn_secret: Some("turn-shared-secret".into()),
            turn_credential_ttl: Duration::from_secs(86400),
            sfu_udp_port_min: 50000,
            sfu_udp_port_max: 50100,
            sfu_public_ip: None,
            ws_allowed_origins: vec![],
            trusted_proxy_cidrs: vec![],
            max_unauth_per_ip: 20,
            max_unauth_global: 200,
            unauth_timeout: Duration::from_secs(10),
            upload_max_bytes: 10 * 1024 * 1024,
            voice_join_cooldown: Duration::from_secs(15),
            voice_state_cooldown: Duration::from_secs(10),
        }
    }

    #[test]
    fn mints_username_with_expiry_prefix() {
        let config = test_config();
        let user_id = Uuid::new_v4();
        let cred = mint_credential(&config, user_id).unwrap();
        assert!(cred.username.ends_with(&user_id.to_string()));
        assert!(!cred.credential.is_empty());
    }

    #[test]
    fn same_inputs_yield_same_credential() {
        let config = test_config();
        let user_id = Uuid::new_v4();
        // mint twice within the same second; username (and hence credential)
        // should be identical since expiry granularity is seconds.
        let a = mint_credential(&config, user_id).unwrap();
        let b = mint_credential(&config, user_id).unwrap();
        if a.username == b.username {
            assert_eq!(a.credential, b.credential);
        }
    }

    #[test]
    fn no_turn_secret_means_no_turn_server() {
        let mut config = test_config();
        config.turn_secret = None;
        let servers = ice_servers(&config, Uuid::new_v4());
        assert!(servers.iter().all(|s| !s.urls[0].starts_with("turn:")));
    }
}
