//! Client-side error classification. The UI reacts to [`ClientError`]
//! variants (or the [`vocore_protocol::ErrorCode`] it wraps), never to
//! message strings, mirroring the server's `SfuError`/`HubError` split.

use vocore_protocol::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("microphone permission denied")]
    MicPermissionDenied,

    #[error("no input audio device available")]
    MicDeviceAbsent,

    #[error("input audio device is already in use")]
    MicDeviceInUse,

    #[error("websocket connection failed: {0}")]
    Connect(String),

    #[error("server closed the connection before IDENTIFY completed")]
    IdentifyFailed,

    #[error("no active voice session to attach screen-share to")]
    NoActiveVoiceSession,

    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("initial offer was not answered within the timeout")]
    OfferTimeout,

    #[error("ICE restart attempts exhausted")]
    IceRestartExhausted,

    #[error("server rejected the request: {code:?} {message}")]
    ServerError { code: ErrorCode, message: String, retry_after_ms: Option<u64> },
}

impl ClientError {
    /// A stable, UI-facing code distinct from [`vocore_protocol::ErrorCode`]
    /// for errors that never reach the wire (media/device/local negotiation
    /// failures the server never sees).
    pub fn local_code(&self) -> &'static str {
        match self {
            ClientError::MicPermissionDenied => "mic_permission_denied",
            ClientError::MicDeviceAbsent => "mic_device_absent",
            ClientError::MicDeviceInUse => "mic_device_in_use",
            ClientError::Connect(_) => "connect_failed",
            ClientError::IdentifyFailed => "identify_failed",
            ClientError::NoActiveVoiceSession => "no_active_voice_session",
            ClientError::WebRtc(_) => "webrtc_error",
            ClientError::OfferTimeout => "offer_timeout",
            ClientError::IceRestartExhausted => "ice_restart_exhausted",
            ClientError::ServerError { .. } => "server_error",
        }
    }
}
