//! Voice Hub: the WebSocket broker. One identified connection per user,
//! presence and voice-state fanout, the IDENTIFY/READY handshake, and
//! dispatch of every client-originated event onto the SFU core and
//! screen-share manager.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio::task::AbortHandle;
use uuid::Uuid;

use vocore_protocol::{
    ClientEvent, ClientMessage, ErrorCode, PresenceStatus, RelayedMessage, RosterEntry,
    ServerEvent, ServerMessage, VoiceState,
};

use crate::admission::AdmissionPermit;
use crate::auth::{CurrentSessionVersion, RosterSource, SessionVerifier};
use crate::config::Config;
use crate::error::{HubError, SfuError};
use crate::rate_limit::{CooldownGate, SlidingWindowLimiter};
use crate::screen_share::ScreenShareBroadcast;
use crate::sfu::{SfuCore, SignalingChannel};
use crate::turn;

/// How many signaling verbs (offer/answer/ICE/screen-share requests) a
/// single user may send in the sliding window below.
const SIGNALING_RATE_CAPACITY: usize = 50;
const SIGNALING_RATE_PERIOD: Duration = Duration::from_secs(10);

struct ClientHandle {
    connection_id: Uuid,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    abort: AbortHandle,
}

/// External collaborators the hub is constructed with. None of these are
/// implemented in this repository (persistence/auth are out of scope); the
/// hub only ever calls through the trait objects.
pub struct HubDeps {
    pub config: Arc<Config>,
    pub sfu: Arc<SfuCore>,
    pub session_verifier: Arc<dyn SessionVerifier>,
    pub current_session_version: Arc<dyn CurrentSessionVersion>,
    pub roster_source: Arc<dyn RosterSource>,
}

pub struct Hub {
    config: Arc<Config>,
    sfu: Arc<SfuCore>,
    session_verifier: Arc<dyn SessionVerifier>,
    current_session_version: Arc<dyn CurrentSessionVersion>,
    roster_source: Arc<dyn RosterSource>,

    clients: RwLock<HashMap<Uuid, ClientHandle>>,
    voice_states: RwLock<HashMap<Uuid, VoiceState>>,
    presence: RwLock<HashMap<Uuid, PresenceStatus>>,

    voice_join_cooldown: CooldownGate<Uuid>,
    voice_state_cooldown: CooldownGate<Uuid>,
    signaling_rate: SlidingWindowLimiter<Uuid>,
}

impl Hub {
    /// Builds the hub and wires it into its own SFU core and screen-share
    /// manager as their signaling/broadcast collaborator. Async because that
    /// wiring needs the fully-constructed `Arc<Hub>` to exist first.
    pub async fn new(deps: HubDeps) -> Arc<Self> {
        let voice_join_cooldown = CooldownGate::new(deps.config.voice_join_cooldown);
        let voice_state_cooldown = CooldownGate::new(deps.config.voice_state_cooldown);

        let hub = Arc::new(Self {
            config: deps.config,
            sfu: deps.sfu,
            session_verifier: deps.session_verifier,
            current_session_version: deps.current_session_version,
            roster_source: deps.roster_source,
            clients: RwLock::new(HashMap::new()),
            voice_states: RwLock::new(HashMap::new()),
            presence: RwLock::new(HashMap::new()),
            voice_join_cooldown,
            voice_state_cooldown,
            signaling_rate: SlidingWindowLimiter::new(SIGNALING_RATE_CAPACITY, SIGNALING_RATE_PERIOD),
        });

        let signaling: Arc<dyn SignalingChannel> = hub.clone();
        let broadcast: Arc<dyn ScreenShareBroadcast> = hub.clone();
        hub.sfu.set_signaling_channel(signaling).await;
        hub.sfu.screen_share.set_sfu(Arc::downgrade(&hub.sfu)).await;
        hub.sfu.screen_share.set_broadcast(broadcast).await;

        hub
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn voice_state_of(&self, states: &HashMap<Uuid, VoiceState>, user_id: Uuid) -> VoiceState {
        states.get(&user_id).copied().unwrap_or_else(VoiceState::not_in_voice)
    }

    async fn send_to(&self, user_id: Uuid, event: ServerEvent) {
        if let Some(client) = self.clients.read().await.get(&user_id) {
            let _ = client.outbound.send(ServerMessage::new(event));
        }
    }

    async fn send_error(&self, user_id: Uuid, err: &HubError, nonce: Option<String>) {
        self.send_to(
            user_id,
            ServerEvent::ServerError {
                code: err.code(),
                message: err.to_string(),
                nonce,
                retry_after_ms: err.retry_after_ms(),
            },
        )
        .await;
    }

    async fn broadcast(&self, event: ServerEvent) {
        for client in self.clients.read().await.values() {
            let _ = client.outbound.send(ServerMessage::new(event.clone()));
        }
    }

    async fn roster(&self) -> Vec<RosterEntry> {
        let voice_states = self.voice_states.read().await;
        let presence = self.presence.read().await;
        let mut entries = Vec::new();
        for &user_id in self.clients.read().await.keys() {
            let username = self
                .roster_source
                .username(user_id)
                .await
                .unwrap_or_else(|| user_id.to_string());
            let avatar_url = self.roster_source.avatar_url(user_id).await;
            let status = presence.get(&user_id).copied().unwrap_or(PresenceStatus::Online);
            let state = self.voice_state_of(&voice_states, user_id);
            entries.push(RosterEntry {
                user_id,
                username,
                avatar_url,
                status,
                in_voice: state.in_voice,
                muted: state.muted,
                deafened: state.deafened,
                created_at: Utc::now(),
            });
        }
        entries
    }

    /// Spawns the connection's lifetime as its own task and returns
    /// immediately; this is the entry point the WebSocket upgrade handler
    /// calls. The task needs an [`AbortHandle`] to itself (so a later
    /// IDENTIFY for the same user can evict it), which only exists once
    /// `tokio::spawn` has returned a `JoinHandle` — so the handle is threaded
    /// back in over a oneshot rather than looked up from within the task.
    pub fn spawn_connection(self: Arc<Self>, socket: WebSocket, ip: IpAddr, permit: AdmissionPermit) {
        let (abort_tx, abort_rx) = tokio::sync::oneshot::channel::<AbortHandle>();
        let join = tokio::spawn(async move {
            let Ok(abort) = abort_rx.await else { return };
            self.run_connection(socket, ip, abort, permit).await;
        });
        let _ = abort_tx.send(join.abort_handle());
    }

    /// Runs one WebSocket connection end to end: HELLO, the bounded wait
    /// for IDENTIFY, then (once identified) the dispatch loop. `ip` is only
    /// used to log. `permit` is the pre-auth admission slot; it's released
    /// as soon as IDENTIFY succeeds or fails, not held for the connection's
    /// whole lifetime.
    async fn run_connection(self: Arc<Self>, mut socket: WebSocket, ip: IpAddr, abort: AbortHandle, permit: AdmissionPermit) {
        if socket
            .send(to_ws_message(&ServerMessage::new(ServerEvent::Hello)))
            .await
            .is_err()
        {
            return;
        }

        let identified = self.await_identify(&mut socket).await;
        drop(permit);
        let (user_id, connection_id) = match identified {
            Some(pair) => pair,
            None => return,
        };
        tracing::debug!("{} identified from {}", user_id, ip);

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let was_new = self.register_client(user_id, connection_id, outbound_tx, abort).await;

        let ready = ServerMessage::new(ServerEvent::Ready { members: self.roster().await });
        if socket.send(to_ws_message(&ready)).await.is_err() {
            self.handle_disconnect(user_id, connection_id).await;
            return;
        }

        if was_new {
            if let Some(entry) = self.roster().await.into_iter().find(|m| m.user_id == user_id) {
                self.broadcast(ServerEvent::UserJoined { user: entry }).await;
            }
        }

        loop {
            tokio::select! {
                incoming = socket.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ClientMessage>(&text) {
                                Ok(msg) => self.dispatch(user_id, msg).await,
                                Err(e) => tracing::debug!("malformed message from {}: {}", user_id, e),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::debug!("websocket error for {}: {}", user_id, e);
                            break;
                        }
                    }
                }
                outgoing = outbound_rx.recv() => {
                    match outgoing {
                        Some(msg) => {
                            if socket.send(to_ws_message(&msg)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        self.handle_disconnect(user_id, connection_id).await;
    }

    /// Waits up to `unauth_timeout` for a well-formed IDENTIFY, validating
    /// the token and session_version. Returns `None` (connection already
    /// closed) on timeout, protocol error, or auth failure.
    async fn await_identify(&self, socket: &mut WebSocket) -> Option<(Uuid, Uuid)> {
        let wait = tokio::time::timeout(self.config.unauth_timeout, socket.next());
        let frame = match wait.await {
            Ok(frame) => frame,
            Err(_) => {
                tracing::debug!("client failed to IDENTIFY within the unauthenticated timeout");
                let _ = socket.send(Message::Close(None)).await;
                return None;
            }
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            _ => return None,
        };

        let parsed: Result<ClientMessage, _> = serde_json::from_str(&text);
        let token = match parsed {
            Ok(ClientMessage { event: ClientEvent::Identify { token }, .. }) => token,
            _ => {
                let _ = socket
                    .send(to_ws_message(&ServerMessage::error(ErrorCode::InvalidRequest, "first message must be IDENTIFY")))
                    .await;
                let _ = socket.send(Message::Close(None)).await;
                return None;
            }
        };

        let claims = match self.session_verifier.verify(&token).await {
            Ok(claims) => claims,
            Err(err) => {
                let _ = socket.send(to_ws_message(&ServerMessage::error(err.code(), err.to_string()))).await;
                let _ = socket.send(Message::Close(None)).await;
                return None;
            }
        };

        if let Some(current) = self.current_session_version.current_version(claims.user_id).await {
            if current != claims.session_version {
                let _ = socket
                    .send(to_ws_message(&ServerMessage::error(ErrorCode::AuthFailed, "session has been invalidated")))
                    .await;
                let _ = socket.send(Message::Close(None)).await;
                return None;
            }
        }

        Some((claims.user_id, Uuid::new_v4()))
    }

    /// Registers the new connection, evicting any existing one for the
    /// same user. Returns `true` if the user had no prior connection (so
    /// the caller should broadcast USER_JOINED).
    async fn register_client(
        &self,
        user_id: Uuid,
        connection_id: Uuid,
        outbound: mpsc::UnboundedSender<ServerMessage>,
        abort: AbortHandle,
    ) -> bool {
        let mut clients = self.clients.write().await;
        let was_new = !clients.contains_key(&user_id);
        if let Some(previous) = clients.remove(&user_id) {
            previous.abort.abort();
        }
        clients.insert(user_id, ClientHandle { connection_id, outbound, abort });
        was_new
    }

    /// Tears down state for a connection that just ended, but only if it
    /// is still the current connection for `user_id` (a connection evicted
    /// by a newer IDENTIFY must not tear down the replacement's state).
    async fn handle_disconnect(&self, user_id: Uuid, connection_id: Uuid) {
        {
            let mut clients = self.clients.write().await;
            match clients.get(&user_id) {
                Some(client) if client.connection_id == connection_id => {
                    clients.remove(&user_id);
                }
                _ => return,
            }
        }

        let was_in_voice = self.voice_state_of(&*self.voice_states.read().await, user_id).in_voice;
        if was_in_voice {
            self.leave_voice(user_id).await;
        }

        self.presence.write().await.remove(&user_id);
        self.voice_states.write().await.remove(&user_id);
        self.broadcast(ServerEvent::UserLeft { user_id }).await;
    }

    async fn dispatch(&self, user_id: Uuid, msg: ClientMessage) {
        let nonce = msg.nonce.clone();
        match msg.event {
            ClientEvent::Identify { .. } => {}
            ClientEvent::Ping => self.send_to(user_id, ServerEvent::Pong).await,
            ClientEvent::SetPresence { status } => self.set_presence(user_id, status).await,
            ClientEvent::TypingStart => self.typing_start(user_id).await,
            ClientEvent::MessageSend { content, nonce: msg_nonce, attachment_ids: _ } => {
                self.message_send(user_id, content, msg_nonce).await
            }
            ClientEvent::VoiceJoin { muted, deafened } => self.voice_join(user_id, muted, deafened, nonce).await,
            ClientEvent::VoiceLeave => self.leave_voice(user_id).await,
            ClientEvent::VoiceState { muted, deafened } => self.voice_state(user_id, muted, deafened, nonce).await,
            ClientEvent::VoiceSpeaking { speaking } => self.voice_speaking(user_id, speaking).await,
            ClientEvent::RtcOffer { sdp } => self.rtc_offer(user_id, sdp, nonce).await,
            ClientEvent::RtcAnswer { sdp } => self.rtc_answer(user_id, sdp, nonce).await,
            ClientEvent::RtcIceCandidate { candidate, sdp_mid, sdp_mline_index } => {
                self.rtc_ice_candidate(user_id, candidate, sdp_mid, sdp_mline_index).await
            }
            ClientEvent::ScreenshareStart => self.sfu.screen_share.start_share(user_id).await,
            ClientEvent::ScreenshareStop => self.sfu.screen_share.stop_share(user_id).await,
            ClientEvent::ScreenshareSubscribe { streamer_id } => {
                self.sfu.screen_share.subscribe(user_id, streamer_id).await
            }
            ClientEvent::ScreenshareUnsubscribe => self.sfu.screen_share.unsubscribe(user_id).await,
        }
    }

    async fn set_presence(&self, user_id: Uuid, status: PresenceStatus) {
        self.presence.write().await.insert(user_id, status);
        self.broadcast(ServerEvent::PresenceUpdate { user_id, status }).await;
    }

    async fn typing_start(&self, user_id: Uuid) {
        let username = self
            .roster_source
            .username(user_id)
            .await
            .unwrap_or_else(|| user_id.to_string());
        self.broadcast(ServerEvent::TypingStart { user_id, username, timestamp: Utc::now() }).await;
    }

    async fn message_send(&self, user_id: Uuid, content: String, nonce: Option<String>) {
        let message = RelayedMessage {
            message_id: Uuid::new_v4(),
            author_id: user_id,
            content,
            nonce,
            created_at: Utc::now(),
        };
        self.broadcast(ServerEvent::MessageCreate { message }).await;
    }

    /// Cooldown-gated. On success: allocate the SFU peer, set voice state,
    /// broadcast it, send RTC_READY with TURN-minted ICE servers, then have
    /// the SFU send the initial offer (the server is always the ICE
    /// controlling agent).
    async fn voice_join(&self, user_id: Uuid, muted: bool, deafened: bool, nonce: Option<String>) {
        if let Err(retry_after_ms) = self.voice_join_cooldown.check(user_id).await {
            self.send_error(user_id, &HubError::VoiceJoinCooldown { retry_after_ms }, nonce).await;
            return;
        }

        let ice_servers = turn::webrtc_ice_servers(&self.config, user_id);
        if let Err(e) = self.sfu.add_peer(user_id, ice_servers).await {
            self.send_error(user_id, &HubError::VoiceJoinFailed(e), nonce).await;
            return;
        }

        let state = VoiceState { in_voice: true, muted, deafened, speaking: false }.normalized();
        self.voice_states.write().await.insert(user_id, state);
        self.broadcast(ServerEvent::VoiceStateUpdate { user_id, state }).await;

        self.send_to(user_id, ServerEvent::RtcReady { ice_servers: turn::ice_servers(&self.config, user_id) })
            .await;
        self.sfu.send_initial_offer(user_id).await;
    }

    /// Idempotent: a second VOICE_LEAVE while already out of voice is a
    /// no-op, so a rapid burst of VOICE_LEAVE collapses to one transition.
    /// `SfuCore::remove_peer` already tears down any screen share the user
    /// had running or was subscribed to.
    async fn leave_voice(&self, user_id: Uuid) {
        let was_in_voice = self.voice_state_of(&*self.voice_states.read().await, user_id).in_voice;
        if !was_in_voice {
            return;
        }

        self.voice_states.write().await.insert(user_id, VoiceState::not_in_voice());
        self.sfu.remove_peer(user_id).await;
        self.broadcast(ServerEvent::VoiceStateUpdate { user_id, state: VoiceState::not_in_voice() }).await;
    }

    /// Cooldown-gated toggle. Mutations require the user already be in
    /// voice (the join transition is the sole exception, handled above).
    async fn voice_state(&self, user_id: Uuid, muted: Option<bool>, deafened: Option<bool>, nonce: Option<String>) {
        let current = self.voice_state_of(&*self.voice_states.read().await, user_id);
        if !current.in_voice {
            self.send_error(user_id, &HubError::VoiceStateInvalidTransition, nonce).await;
            return;
        }

        if let Err(retry_after_ms) = self.voice_state_cooldown.check(user_id).await {
            self.send_error(user_id, &HubError::VoiceStateCooldown { retry_after_ms }, nonce).await;
            return;
        }

        let updated = VoiceState {
            in_voice: true,
            muted: muted.unwrap_or(current.muted),
            deafened: deafened.unwrap_or(current.deafened),
            speaking: current.speaking,
        }
        .normalized();

        self.voice_states.write().await.insert(user_id, updated);
        self.broadcast(ServerEvent::VoiceStateUpdate { user_id, state: updated }).await;
    }

    async fn voice_speaking(&self, user_id: Uuid, speaking: bool) {
        let mut states = self.voice_states.write().await;
        let Some(state) = states.get_mut(&user_id) else { return };
        if !state.in_voice {
            return;
        }
        state.speaking = speaking;
        drop(states);
        self.broadcast(ServerEvent::VoiceSpeaking { user_id, speaking }).await;
    }

    async fn rtc_offer(&self, user_id: Uuid, sdp: String, nonce: Option<String>) {
        if !self.signaling_rate.check(user_id).await {
            self.send_error(user_id, &HubError::SignalingRateLimited { retry_after_ms: SIGNALING_RATE_PERIOD.as_millis() as u64 }, nonce).await;
            return;
        }
        if let Err(e) = self.sfu.handle_offer(user_id, sdp).await {
            self.send_error(user_id, &negotiation_hub_error(e), nonce).await;
        }
    }

    async fn rtc_answer(&self, user_id: Uuid, sdp: String, nonce: Option<String>) {
        if !self.signaling_rate.check(user_id).await {
            self.send_error(user_id, &HubError::SignalingRateLimited { retry_after_ms: SIGNALING_RATE_PERIOD.as_millis() as u64 }, nonce).await;
            return;
        }
        if let Err(e) = self.sfu.handle_answer(user_id, sdp).await {
            self.send_error(user_id, &negotiation_hub_error(e), nonce).await;
            return;
        }
        self.sfu.screen_share.on_renegotiation_complete(user_id).await;
    }

    async fn rtc_ice_candidate(&self, user_id: Uuid, candidate: String, sdp_mid: Option<String>, sdp_mline_index: Option<u16>) {
        if !self.signaling_rate.check(user_id).await {
            return;
        }
        if let Err(e) = self.sfu.handle_ice_candidate(user_id, candidate, sdp_mid, sdp_mline_index).await {
            tracing::debug!("ice candidate from {} dropped: {}", user_id, e);
        }
    }

    /// Periodic housekeeping: evicts idle rate-limit/cooldown entries.
    /// Intended to be driven by a background interval in `main`.
    pub async fn evict_idle_buckets(&self) {
        self.voice_join_cooldown.evict_idle().await;
        self.voice_state_cooldown.evict_idle().await;
        self.signaling_rate.evict_idle().await;
    }
}

fn negotiation_hub_error(e: SfuError) -> HubError {
    match e {
        SfuError::Negotiation(inner) => HubError::VoiceNegotiationFailed(inner),
        other => HubError::VoiceJoinFailed(other),
    }
}

fn to_ws_message(msg: &ServerMessage) -> Message {
    Message::Text(serde_json::to_string(msg).unwrap_or_default().into())
}

#[async_trait]
impl SignalingChannel for Hub {
    async fn send_offer(&self, user_id: Uuid, sdp: String) {
        self.send_to(user_id, ServerEvent::RtcOffer { sdp }).await;
    }

    async fn send_answer(&self, user_id: Uuid, sdp: String) {
        self.send_to(user_id, ServerEvent::RtcAnswer { sdp }).await;
    }

    async fn send_ice_candidate(&self, user_id: Uuid, candidate: String, sdp_mid: Option<String>, sdp_mline_index: Option<u16>) {
        self.send_to(user_id, ServerEvent::RtcIceCandidate { candidate, sdp_mid, sdp_mline_index }).await;
    }
}

#[async_trait]
impl ScreenShareBroadcast for Hub {
    async fn broadcast_streaming(&self, user_id: Uuid, streaming: bool) {
        self.broadcast(ServerEvent::ScreenShareUpdate { user_id, streaming }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticSecretVerifier;
    use std::time::Duration as StdDuration;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            bind_address: "127.0.0.1:0".into(),
            jwt_secret: "x".repeat(32),
            access_token_ttl: StdDuration::from_secs(900),
            refresh_token_ttl: StdDuration::from_secs(2_592_000),
            magic_code_ttl: StdDuration::from_secs(600),
            stun_servers: vec![],
            turn_host: None,
            turn_port: 3478,
            turn_secret: None,
            turn_credential_ttl: StdDuration::from_secs(86400),
            sfu_udp_port_min: 50000,
            sfu_udp_port_max: 50100,
            sfu_public_ip: None,
            ws_allowed_origins: vec![],
            trusted_proxy_cidrs: vec![],
            max_unauth_per_ip: 20,
            max_unauth_global: 200,
            unauth_timeout: StdDuration::from_millis(200),
            upload_max_bytes: 1024,
            voice_join_cooldown: StdDuration::from_millis(50),
            voice_state_cooldown: StdDuration::from_millis(50),
        })
    }

    async fn test_hub() -> Arc<Hub> {
        let config = test_config();
        let sfu = SfuCore::new(&config).unwrap();
        let verifier = Arc::new(StaticSecretVerifier::new(config.jwt_secret.clone()));
        Hub::new(HubDeps {
            config,
            sfu,
            session_verifier: verifier.clone(),
            current_session_version: verifier,
            roster_source: Arc::new(NullRoster),
        })
        .await
    }

    struct NullRoster;
    #[async_trait]
    impl RosterSource for NullRoster {
        async fn username(&self, _user_id: Uuid) -> Option<String> {
            None
        }
        async fn avatar_url(&self, _user_id: Uuid) -> Option<String> {
            None
        }
    }

    #[tokio::test]
    async fn leave_voice_without_prior_join_is_a_no_op() {
        let hub = test_hub().await;
        hub.leave_voice(Uuid::new_v4()).await;
    }

    #[tokio::test]
    async fn voice_state_toggle_requires_being_in_voice() {
        let hub = test_hub().await;
        let user = Uuid::new_v4();
        hub.voice_state(user, Some(true), None, None).await;
        assert!(!hub.voice_state_of(&*hub.voice_states.read().await, user).muted);
    }

    #[tokio::test]
    async fn deafened_implies_muted_in_stored_state() {
        let hub = test_hub().await;
        let user = Uuid::new_v4();
        hub.voice_states.write().await.insert(user, VoiceState { in_voice: true, muted: false, deafened: false, speaking: false });
        hub.voice_state(user, None, Some(true), None).await;
        let state = hub.voice_state_of(&*hub.voice_states.read().await, user);
        assert!(state.deafened);
        assert!(state.muted);
    }
}
