use serde::{Deserialize, Serialize};

/// Stable error codes carried in `SERVER_ERROR` payloads. The UI reacts to
/// these codes, never to the human-readable message string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthFailed,
    AuthExpired,
    RateLimited,
    VoiceJoinCooldown,
    VoiceStateCooldown,
    VoiceJoinFailed,
    VoiceStateInvalidTransition,
    VoiceNegotiationInvalidState,
    VoiceNegotiationFailed,
    VoiceNegotiationTimeout,
    SignalingRateLimited,
    AttachmentInvalid,
    PayloadTooLarge,
    InvalidRequest,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failed_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::AuthFailed).unwrap();
        assert_eq!(json, r#""AUTH_FAILED""#);
    }
}
