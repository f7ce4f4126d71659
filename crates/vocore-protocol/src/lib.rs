//! Wire types for the WebSocket signaling/presence protocol shared by the
//! server hub and the client negotiator.

mod error_code;
mod messages;
mod types;

pub use error_code::ErrorCode;
pub use messages::{ClientEvent, ClientMessage, ServerEvent, ServerMessage};
pub use types::{IceServer, PresenceStatus, RelayedMessage, RosterEntry, TrackKind, VoiceState};
