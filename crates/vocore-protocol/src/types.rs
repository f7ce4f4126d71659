use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Presence status as carried in SET_PRESENCE and PRESENCE_UPDATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Idle,
    #[serde(rename = "dnd")]
    Dnd,
    Offline,
}

/// A single member of the roster sent in the READY payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterEntry {
    pub user_id: Uuid,
    pub username: String,
    pub avatar_url: Option<String>,
    pub status: PresenceStatus,
    pub in_voice: bool,
    pub muted: bool,
    pub deafened: bool,
    pub created_at: DateTime<Utc>,
}

/// Per-user voice state. `deafened` implies `muted`; `speaking` is only
/// meaningful while `in_voice`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceState {
    pub in_voice: bool,
    pub muted: bool,
    pub deafened: bool,
    pub speaking: bool,
}

impl VoiceState {
    pub const fn not_in_voice() -> Self {
        Self {
            in_voice: false,
            muted: false,
            deafened: false,
            speaking: false,
        }
    }

    /// Applies the deafened-implies-muted invariant, returning the corrected state.
    pub fn normalized(mut self) -> Self {
        if self.deafened {
            self.muted = true;
        }
        if !self.in_voice {
            self.speaking = false;
        }
        self
    }
}

/// The kind of media a track carries. Audio is always the voice call;
/// Video is always screen-share (there is no webcam video in this core).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

/// ICE server descriptor handed to the client in RTC_READY.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// The minimal message shape relayed by the hub. Persistence, attachments and
/// author profile data are owned by the out-of-scope message subsystem; the
/// hub only fans this out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayedMessage {
    pub message_id: Uuid,
    pub author_id: Uuid,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deafened_implies_muted_after_normalization() {
        let state = VoiceState {
            in_voice: true,
            muted: false,
            deafened: true,
            speaking: true,
        }
        .normalized();
        assert!(state.muted);
    }

    #[test]
    fn speaking_forced_false_outside_voice() {
        let state = VoiceState {
            in_voice: false,
            muted: false,
            deafened: false,
            speaking: true,
        }
        .normalized();
        assert!(!state.speaking);
    }

    #[test]
    fn presence_status_dnd_serializes_literally() {
        let json = serde_json::to_string(&PresenceStatus::Dnd).unwrap();
        assert_eq!(json, r#""dnd""#);
    }
}
