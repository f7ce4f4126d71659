use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error_code::ErrorCode;
use crate::types::{IceServer, PresenceStatus, RelayedMessage, RosterEntry, VoiceState};

/// Events carried from client to server inside a [`ClientMessage`] envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientEvent {
    /// Must be the first message on a new connection; carries the access token.
    Identify { token: String },

    Ping,

    SetPresence { status: PresenceStatus },

    TypingStart,

    MessageSend {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        nonce: Option<String>,
        #[serde(default)]
        attachment_ids: Vec<Uuid>,
    },

    /// Join the single global voice room with the given initial flags.
    VoiceJoin { muted: bool, deafened: bool },

    VoiceLeave,

    /// Toggle mute/deafen. Omitted fields leave that flag unchanged.
    VoiceState {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        muted: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        deafened: Option<bool>,
    },

    VoiceSpeaking { speaking: bool },

    RtcOffer { sdp: String },
    RtcAnswer { sdp: String },
    RtcIceCandidate {
        candidate: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        sdp_mid: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        sdp_mline_index: Option<u16>,
    },

    ScreenshareStart,
    ScreenshareStop,
    ScreenshareSubscribe { streamer_id: Uuid },
    ScreenshareUnsubscribe,
}

/// The full wire message from client to server: the tagged event plus an
/// optional correlation nonce, per the `{type, payload, nonce?}` framing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(flatten)]
    pub event: ClientEvent,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub nonce: Option<String>,
}

/// Events carried from server to client inside a [`ServerMessage`] envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerEvent {
    Hello,

    Ready { members: Vec<RosterEntry> },

    Pong,

    PresenceUpdate { user_id: Uuid, status: PresenceStatus },

    UserJoined { user: RosterEntry },
    UserLeft { user_id: Uuid },
    UserUpdate { user: RosterEntry },

    TypingStart {
        user_id: Uuid,
        username: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    MessageCreate { message: RelayedMessage },

    VoiceStateUpdate { user_id: Uuid, state: VoiceState },
    VoiceSpeaking { user_id: Uuid, speaking: bool },

    /// Sent once VOICE_JOIN is accepted, before the initial SDP offer.
    RtcReady { ice_servers: Vec<IceServer> },

    RtcOffer { sdp: String },
    RtcAnswer { sdp: String },
    RtcIceCandidate {
        candidate: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        sdp_mid: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        sdp_mline_index: Option<u16>,
    },

    ScreenShareUpdate { user_id: Uuid, streaming: bool },

    ServerUpdate { reason: String },

    ServerError {
        code: ErrorCode,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        nonce: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        retry_after_ms: Option<u64>,
    },
}

/// The full wire message from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(flatten)]
    pub event: ServerEvent,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub nonce: Option<String>,
}

impl ServerMessage {
    pub fn new(event: ServerEvent) -> Self {
        Self { event, nonce: None }
    }

    pub fn with_nonce(event: ServerEvent, nonce: impl Into<String>) -> Self {
        Self {
            event,
            nonce: Some(nonce.into()),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(ServerEvent::ServerError {
            code,
            message: message.into(),
            nonce: None,
            retry_after_ms: None,
        })
    }
}

impl ClientMessage {
    pub fn event(event: ClientEvent) -> Self {
        Self { event, nonce: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_envelope_uses_type_payload_framing() {
        let msg = ClientMessage::event(ClientEvent::Identify {
            token: "abc".to_string(),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "IDENTIFY");
        assert_eq!(json["payload"]["token"], "abc");
    }

    #[test]
    fn voice_state_omits_unset_fields() {
        let msg = ClientMessage::event(ClientEvent::VoiceState {
            muted: Some(true),
            deafened: None,
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["payload"]["muted"], true);
        assert!(json["payload"].get("deafened").is_none());
    }

    #[test]
    fn server_error_carries_retry_after_ms() {
        let msg = ServerMessage::new(ServerEvent::ServerError {
            code: ErrorCode::VoiceJoinCooldown,
            message: "try again later".to_string(),
            nonce: None,
            retry_after_ms: Some(4200),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "SERVER_ERROR");
        assert_eq!(json["payload"]["retry_after_ms"], 4200);
    }
}
