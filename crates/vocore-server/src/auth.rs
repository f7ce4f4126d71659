//! Session verification boundary.
//!
//! Account creation, refresh tokens, and password/magic-link flows live
//! outside this repository. What lives here is the narrow interface the hub
//! needs at IDENTIFY time: decode the access token, and compare its
//! `session_version` against whatever the external auth service currently
//! considers valid for that user (so revoking a session invalidates any
//! token minted before the bump).

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::HubError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: Uuid,
    pub session_version: u32,
    pub exp: i64,
    pub iat: i64,
}

/// Decodes and validates an access token's signature and expiry. Does not
/// by itself check `session_version` — that's [`CurrentSessionVersion`]'s job,
/// since only the external auth collaborator knows the live value.
pub fn verify_access_token(token: &str, secret: &str) -> Result<Claims, HubError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| HubError::AuthFailed)?;

    if data.claims.exp < Utc::now().timestamp() {
        return Err(HubError::AuthExpired);
    }

    Ok(data.claims)
}

/// Verifies an access token belongs to a live session. Implemented by the
/// external auth/account service; this repository only ever calls it.
#[async_trait]
pub trait SessionVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Claims, HubError>;
}

/// The session-version-bumping authority. IDENTIFY compares the token's
/// `session_version` against this; a mismatch means the token was issued
/// before a logout-everywhere / password change and must be rejected.
#[async_trait]
pub trait CurrentSessionVersion: Send + Sync {
    async fn current_version(&self, user_id: Uuid) -> Option<u32>;
}

/// Supplies the member roster shown in READY (usernames, avatars, presence).
/// Voice/mute/deafen fields are owned by this core, not the roster source.
#[async_trait]
pub trait RosterSource: Send + Sync {
    async fn username(&self, user_id: Uuid) -> Option<String>;
    async fn avatar_url(&self, user_id: Uuid) -> Option<String>;
}

/// A [`SessionVerifier`] that decodes tokens with a static secret and treats
/// every session_version as current. Useful for tests and for standalone
/// deployments with no external session-revocation authority wired in.
pub struct StaticSecretVerifier {
    secret: String,
}

impl StaticSecretVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }
}

#[async_trait]
impl SessionVerifier for StaticSecretVerifier {
    async fn verify(&self, token: &str) -> Result<Claims, HubError> {
        verify_access_token(token, &self.secret)
    }
}

#[async_trait]
impl CurrentSessionVersion for StaticSecretVerifier {
    async fn current_version(&self, _user_id: Uuid) -> Option<u32> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token_with(secret: &str, exp_offset_secs: i64) -> String {
        let claims = Claims {
            user_id: Uuid::new_v4(),
            session_version: 1,
            exp: Utc::now().timestamp() + exp_offset_secs,
            iat: Utc::now().timestamp(),
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn valid_token_round_trips() {
        let token = token_with("super-secret-test-key-0123456789", 3600);
        let claims = verify_access_token(&token, "super-secret-test-key-0123456789").unwrap();
        assert_eq!(claims.session_version, 1);
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = token_with("super-secret-test-key-0123456789", -10);
        let err = verify_access_token(&token, "super-secret-test-key-0123456789").unwrap_err();
        assert!(matches!(err, HubError::AuthExpired));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = token_with("super-secret-test-key-0123456789", 3600);
        let err = verify_access_token(&token, "a-totally-different-secret-here").unwrap_err();
        assert!(matches!(err, HubError::AuthFailed));
    }
}
