//! The client's side of the WebSocket signaling connection: the
//! HELLO/IDENTIFY/READY handshake, a writer task draining an outbound
//! channel, and a reader task fanning [`ServerEvent`]s out to the caller.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use vocore_protocol::{ClientEvent, ClientMessage, ServerEvent, ServerMessage};

use crate::error::ClientError;

/// How long to wait for HELLO/READY during the handshake before giving up.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A live, identified WebSocket connection. Cheap to clone (the sender side
/// of an unbounded channel); every clone writes through the same socket.
#[derive(Clone)]
pub struct WsConnection {
    outbound: mpsc::UnboundedSender<ClientMessage>,
}

impl WsConnection {
    /// Connects, performs HELLO -> IDENTIFY -> READY, and spawns the
    /// reader/writer tasks. Returns the connection handle, the initial
    /// roster from READY, and the channel the caller drains for every
    /// subsequent server event.
    pub async fn connect(
        url: &str,
        token: &str,
    ) -> Result<(Self, Vec<vocore_protocol::RosterEntry>, mpsc::UnboundedReceiver<ServerEvent>), ClientError> {
        let (stream, _) = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| ClientError::Connect("timed out connecting".into()))?
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        let (mut write, mut read) = stream.split();

        match tokio::time::timeout(HANDSHAKE_TIMEOUT, read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage { event: ServerEvent::Hello, .. }) => {}
                _ => return Err(ClientError::IdentifyFailed),
            },
            _ => return Err(ClientError::IdentifyFailed),
        }

        let identify = ClientMessage::event(ClientEvent::Identify { token: token.to_string() });
        write
            .send(Message::Text(serde_json::to_string(&identify).unwrap_or_default().into()))
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        let roster = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage { event: ServerEvent::Ready { members }, .. }) => members,
                Ok(ServerMessage { event: ServerEvent::ServerError { message, .. }, .. }) => {
                    return Err(ClientError::Connect(message))
                }
                _ => return Err(ClientError::IdentifyFailed),
            },
            _ => return Err(ClientError::IdentifyFailed),
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<ClientMessage>();

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let Ok(json) = serde_json::to_string(&msg) else { continue };
                if write.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        });

        let (event_tx, event_rx) = mpsc::unbounded_channel::<ServerEvent>();
        tokio::spawn(async move {
            loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(msg) = serde_json::from_str::<ServerMessage>(&text) {
                            if event_tx.send(msg.event).is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("websocket read error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok((Self { outbound: tx }, roster, event_rx))
    }

    fn send(&self, event: ClientEvent) {
        let _ = self.outbound.send(ClientMessage::event(event));
    }

    pub fn set_presence(&self, status: vocore_protocol::PresenceStatus) {
        self.send(ClientEvent::SetPresence { status });
    }

    pub fn typing_start(&self) {
        self.send(ClientEvent::TypingStart);
    }

    pub fn voice_join(&self, muted: bool, deafened: bool) {
        self.send(ClientEvent::VoiceJoin { muted, deafened });
    }

    pub fn voice_leave(&self) {
        self.send(ClientEvent::VoiceLeave);
    }

    pub fn voice_state(&self, muted: Option<bool>, deafened: Option<bool>) {
        self.send(ClientEvent::VoiceState { muted, deafened });
    }

    pub fn voice_speaking(&self, speaking: bool) {
        self.send(ClientEvent::VoiceSpeaking { speaking });
    }

    pub fn rtc_offer(&self, sdp: String) {
        self.send(ClientEvent::RtcOffer { sdp });
    }

    pub fn rtc_answer(&self, sdp: String) {
        self.send(ClientEvent::RtcAnswer { sdp });
    }

    pub fn rtc_ice_candidate(&self, candidate: String, sdp_mid: Option<String>, sdp_mline_index: Option<u16>) {
        self.send(ClientEvent::RtcIceCandidate { candidate, sdp_mid, sdp_mline_index });
    }

    pub fn screenshare_start(&self) {
        self.send(ClientEvent::ScreenshareStart);
    }

    pub fn screenshare_stop(&self) {
        self.send(ClientEvent::ScreenshareStop);
    }

    pub fn screenshare_subscribe(&self, streamer_id: Uuid) {
        self.send(ClientEvent::ScreenshareSubscribe { streamer_id });
    }

    pub fn screenshare_unsubscribe(&self) {
        self.send(ClientEvent::ScreenshareUnsubscribe);
    }
}

#[async_trait::async_trait]
impl crate::negotiator::SignalingSink for WsConnection {
    async fn send_offer(&self, sdp: String) {
        self.rtc_offer(sdp);
    }

    async fn send_answer(&self, sdp: String) {
        self.rtc_answer(sdp);
    }

    async fn send_ice_candidate(&self, candidate: String, sdp_mid: Option<String>, sdp_mline_index: Option<u16>) {
        self.rtc_ice_candidate(candidate, sdp_mid, sdp_mline_index);
    }

    async fn send_voice_leave(&self) {
        self.voice_leave();
    }
}
