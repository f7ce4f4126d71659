//! Domain error types for the SFU and voice hub.
//!
//! Mirrors the spec's error classification: SFU operations classify as
//! Fatal / Transient / PeerClosed, the hub maps everything onto a
//! [`vocore_protocol::ErrorCode`] the client reacts to by code, never by
//! message string.

use vocore_protocol::ErrorCode;

/// How an SFU-level failure should be handled by its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The operation failed but the peer and session are still usable.
    Transient,
    /// The peer (or the whole SFU) cannot continue; caller should tear down.
    Fatal,
    /// The peer involved was already closed; the operation is a no-op.
    PeerClosed,
}

#[derive(Debug, thiserror::Error)]
pub enum SfuError {
    #[error("peer {0} not found")]
    PeerNotFound(uuid::Uuid),

    #[error("peer {0} is not active")]
    PeerNotActive(uuid::Uuid),

    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),
}

impl SfuError {
    pub fn severity(&self) -> Severity {
        match self {
            SfuError::PeerNotFound(_) => Severity::PeerClosed,
            SfuError::PeerNotActive(_) => Severity::PeerClosed,
            SfuError::WebRtc(_) => Severity::Transient,
            SfuError::Negotiation(_) => Severity::Transient,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("no signaling callback registered for peer")]
    NoSignalingChannel,

    #[error("peer already has an offer in flight")]
    AlreadyNegotiating,

    #[error("failed to create offer: {0}")]
    CreateOffer(webrtc::Error),

    #[error("failed to set local description: {0}")]
    SetLocalDescription(webrtc::Error),

    #[error("failed to set remote description: {0}")]
    SetRemoteDescription(webrtc::Error),

    #[error("rollback failed: {0}")]
    Rollback(webrtc::Error),
}

/// Errors surfaced by the voice hub over the WebSocket, mapped 1:1 onto a
/// [`vocore_protocol::ErrorCode`] sent back to the client.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("authentication failed")]
    AuthFailed,

    #[error("session expired")]
    AuthExpired,

    #[error("rate limited")]
    RateLimited { retry_after_ms: u64 },

    #[error("voice join is on cooldown")]
    VoiceJoinCooldown { retry_after_ms: u64 },

    #[error("voice state change is on cooldown")]
    VoiceStateCooldown { retry_after_ms: u64 },

    #[error("voice join failed: {0}")]
    VoiceJoinFailed(#[from] SfuError),

    #[error("invalid voice state transition")]
    VoiceStateInvalidTransition,

    #[error("negotiation is in an invalid state")]
    VoiceNegotiationInvalidState,

    #[error("negotiation failed: {0}")]
    VoiceNegotiationFailed(NegotiationError),

    #[error("negotiation timed out")]
    VoiceNegotiationTimeout,

    #[error("signaling rate limited")]
    SignalingRateLimited { retry_after_ms: u64 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl HubError {
    pub fn code(&self) -> ErrorCode {
        match self {
            HubError::AuthFailed => ErrorCode::AuthFailed,
            HubError::AuthExpired => ErrorCode::AuthExpired,
            HubError::RateLimited { .. } => ErrorCode::RateLimited,
            HubError::VoiceJoinCooldown { .. } => ErrorCode::VoiceJoinCooldown,
            HubError::VoiceStateCooldown { .. } => ErrorCode::VoiceStateCooldown,
            HubError::VoiceJoinFailed(_) => ErrorCode::VoiceJoinFailed,
            HubError::VoiceStateInvalidTransition => ErrorCode::VoiceStateInvalidTransition,
            HubError::VoiceNegotiationInvalidState => ErrorCode::VoiceNegotiationInvalidState,
            HubError::VoiceNegotiationFailed(_) => ErrorCode::VoiceNegotiationFailed,
            HubError::VoiceNegotiationTimeout => ErrorCode::VoiceNegotiationTimeout,
            HubError::SignalingRateLimited { .. } => ErrorCode::SignalingRateLimited,
            HubError::InvalidRequest(_) => ErrorCode::InvalidRequest,
        }
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            HubError::RateLimited { retry_after_ms }
            | HubError::VoiceJoinCooldown { retry_after_ms }
            | HubError::VoiceStateCooldown { retry_after_ms }
            | HubError::SignalingRateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SfuError>;
