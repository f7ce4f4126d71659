//! Wires [`WsConnection`], [`Negotiator`], [`LifecycleController`] and the
//! capture/playback pipeline into the end-to-end voice session from
//! sections 4.6-4.7. One [`VoiceSession`] instance owns one WebSocket
//! connection's lifetime; [`LifecycleController`] is supplied by the caller
//! so it survives across the reconnects that create a fresh session.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use vocore_media::codec;
use vocore_media::dsp::PipelineConfig;
use vocore_protocol::{ErrorCode, RosterEntry, ServerEvent, TrackKind};

use crate::audio::{AudioCapture, AudioPlayback};
use crate::error::ClientError;
use crate::lifecycle::{LifecycleController, VoiceFlags, VoiceLifecycle};
use crate::negotiator::{Negotiator, NegotiatorEvent};
use crate::websocket::WsConnection;

/// What a UI layer reacts to; the session never touches UI code directly.
pub enum SessionEvent {
    /// Every non-voice server event (presence, messages, roster deltas) is
    /// forwarded unopinionated; the session only interprets voice/RTC ones.
    Forwarded(ServerEvent),
    Negotiation(NegotiatorEvent),
    LifecycleChanged(VoiceLifecycle),
    /// The `Joining -> Active` transition just completed and no join sound
    /// has played yet for this join (deduped across the VOICE_STATE_UPDATE
    /// and RTC_READY paths, and suppressed on a reconnect-triggered rejoin).
    PlayJoinSound,
    /// Unmuting while deafened also undeafens (section 4.6).
    PlayUndeafenSound,
    /// A voice-state change was optimistic and got rejected; flags have
    /// already been reverted locally by the time this fires.
    VoiceStateReverted,
    Error(ClientError),
}

pub struct VoiceSession {
    ws: WsConnection,
    lifecycle: Arc<LifecycleController>,
    negotiator: Mutex<Option<Arc<Negotiator>>>,
    capture: Mutex<Option<AudioCapture>>,
    playback: Mutex<Option<AudioPlayback>>,
    pipeline_config: Mutex<PipelineConfig>,
    flags: Mutex<VoiceFlags>,
    pending_revert: Mutex<Option<VoiceFlags>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl VoiceSession {
    /// Connects, performs the HELLO/IDENTIFY/READY handshake, and - if
    /// `lifecycle` remembers a voice session from before a drop - rejoins
    /// voice with the saved flags and no join sound.
    pub async fn connect(
        url: &str,
        token: &str,
        lifecycle: Arc<LifecycleController>,
    ) -> Result<(Arc<Self>, Vec<RosterEntry>, mpsc::UnboundedReceiver<SessionEvent>), ClientError> {
        let (ws, roster, server_rx) = WsConnection::connect(url, token).await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let session = Arc::new(Self {
            ws,
            lifecycle,
            negotiator: Mutex::new(None),
            capture: Mutex::new(None),
            playback: Mutex::new(None),
            pipeline_config: Mutex::new(PipelineConfig::default()),
            flags: Mutex::new(VoiceFlags::default()),
            pending_revert: Mutex::new(None),
            events: events_tx,
        });

        let dispatch = session.clone();
        tokio::spawn(async move { dispatch.run(server_rx).await });

        if let Some(flags) = session.lifecycle.take_rejoin_flags() {
            session.lifecycle.transition(VoiceLifecycle::Joining);
            session.lifecycle.suppress_join_sound();
            *session.flags.lock().await = flags;
            session.ws.voice_join(flags.muted, flags.deafened);
        }

        Ok((session, roster, events_rx))
    }

    async fn run(self: Arc<Self>, mut server_rx: mpsc::UnboundedReceiver<ServerEvent>) {
        while let Some(event) = server_rx.recv().await {
            if let Err(e) = self.handle_server_event(event).await {
                let _ = self.events.send(SessionEvent::Error(e));
            }
        }

        let flags = *self.flags.lock().await;
        self.lifecycle.on_disconnect(flags);
        let _ = self.events.send(SessionEvent::LifecycleChanged(self.lifecycle.state()));
        self.teardown_voice().await;
    }

    async fn handle_server_event(self: &Arc<Self>, event: ServerEvent) -> Result<(), ClientError> {
        match event {
            ServerEvent::RtcReady { ice_servers } => {
                self.start_voice(ice_servers).await?;
            }
            ServerEvent::RtcOffer { sdp } => {
                if let Some(negotiator) = self.negotiator.lock().await.clone() {
                    negotiator.handle_remote_offer(sdp).await?;
                }
            }
            ServerEvent::RtcAnswer { sdp } => {
                if let Some(negotiator) = self.negotiator.lock().await.clone() {
                    negotiator.handle_remote_answer(sdp).await?;
                }
            }
            ServerEvent::RtcIceCandidate { candidate, sdp_mid, sdp_mline_index } => {
                if let Some(negotiator) = self.negotiator.lock().await.clone() {
                    negotiator.handle_remote_ice_candidate(candidate, sdp_mid, sdp_mline_index).await?;
                }
            }
            ServerEvent::VoiceStateUpdate { user_id: _, state: _ } => {
                // Broadcast for any roster member; the session only tracks
                // its own optimistic flags, so this is forwarded as-is.
                let _ = self.events.send(SessionEvent::Forwarded(event));
            }
            ServerEvent::ServerError { code, message, retry_after_ms, nonce }
                if matches!(code, ErrorCode::VoiceStateCooldown | ErrorCode::VoiceStateInvalidTransition) =>
            {
                if let Some(previous) = self.pending_revert.lock().await.take() {
                    *self.flags.lock().await = previous;
                    if let Some(capture) = self.capture.lock().await.as_ref() {
                        capture.set_muted(previous.muted || previous.deafened);
                    }
                    let _ = self.events.send(SessionEvent::VoiceStateReverted);
                }
                let _ = self.events.send(SessionEvent::Error(ClientError::ServerError { code, message, retry_after_ms }));
                let _ = nonce;
            }
            ServerEvent::ServerError { code, message, retry_after_ms, .. } if code == ErrorCode::VoiceJoinCooldown => {
                self.lifecycle.transition(VoiceLifecycle::NotInVoice);
                let _ = self.events.send(SessionEvent::Error(ClientError::ServerError { code, message, retry_after_ms }));
            }
            other => {
                let _ = self.events.send(SessionEvent::Forwarded(other));
            }
        }
        Ok(())
    }

    async fn start_voice(self: &Arc<Self>, ice_servers: Vec<vocore_protocol::IceServer>) -> Result<(), ClientError> {
        let (negotiator, mut negotiation_events) = Negotiator::new(ice_servers, Arc::new(self.ws.clone())).await?;
        *self.negotiator.lock().await = Some(negotiator.clone());
        negotiator.arm_answer_timeout().await;

        let session = self.clone();
        tokio::spawn(async move {
            while let Some(event) = negotiation_events.recv().await {
                match &event {
                    NegotiatorEvent::Connected => {
                        if session.lifecycle.transition(VoiceLifecycle::Active) {
                            let _ = session.events.send(SessionEvent::LifecycleChanged(VoiceLifecycle::Active));
                            if session.lifecycle.should_play_join_sound() {
                                let _ = session.events.send(SessionEvent::PlayJoinSound);
                            }
                        }
                    }
                    NegotiatorEvent::IceRestartExhausted | NegotiatorEvent::OfferTimeout => {
                        session.ws.voice_leave();
                        session.lifecycle.transition(VoiceLifecycle::Leaving);
                        session.lifecycle.transition(VoiceLifecycle::NotInVoice);
                        session.teardown_voice().await;
                    }
                    NegotiatorEvent::RemoteTrack(TrackKind::Audio, track) => {
                        let mut playback = AudioPlayback::new();
                        if let Err(e) = playback.start(None, track.clone()) {
                            tracing::warn!("failed to start remote audio playback: {}", e);
                        } else {
                            *session.playback.lock().await = Some(playback);
                        }
                    }
                    NegotiatorEvent::RemoteTrack(TrackKind::Video, _) => {
                        // Screen-share viewing is driven by SCREENSHARE_SUBSCRIBE
                        // from the UI layer; forwarded for it to pick up the track.
                    }
                }
                let _ = session.events.send(SessionEvent::Negotiation(event));
            }
        });

        if let Err(e) = self.start_outbound_audio(negotiator).await {
            tracing::warn!("audio setup failed, leaving voice: {}", e);
            self.ws.voice_leave();
            self.lifecycle.transition(VoiceLifecycle::Leaving);
            self.teardown_voice().await;
            self.lifecycle.transition(VoiceLifecycle::NotInVoice);
            return Err(e);
        }
        Ok(())
    }

    async fn start_outbound_audio(&self, negotiator: Arc<Negotiator>) -> Result<(), ClientError> {
        let track = Arc::new(TrackLocalStaticSample::new(
            codec::audio_codec_parameters().capability,
            "audio".to_owned(),
            "vocore".to_owned(),
        ));

        let config = *self.pipeline_config.lock().await;
        let mut capture = AudioCapture::new();
        let current_flags = *self.flags.lock().await;
        let mut speaking_rx = capture.start(None, config, track.clone())?;
        capture.set_muted(current_flags.muted || current_flags.deafened);
        negotiator.set_audio_track(track);
        *self.capture.lock().await = Some(capture);

        let ws = self.ws.clone();
        tokio::spawn(async move {
            while let Some(speaking) = speaking_rx.recv().await {
                ws.voice_speaking(speaking);
            }
        });

        Ok(())
    }

    pub async fn join_voice(&self, muted: bool, deafened: bool) {
        if !self.lifecycle.transition(VoiceLifecycle::Joining) {
            return;
        }
        *self.flags.lock().await = VoiceFlags { muted, deafened };
        self.ws.voice_join(muted, deafened);
    }

    pub async fn leave_voice(&self) {
        self.lifecycle.transition(VoiceLifecycle::Leaving);
        self.ws.voice_leave();
        self.teardown_voice().await;
        self.lifecycle.transition(VoiceLifecycle::NotInVoice);
    }

    /// Mute toggles the outbound track and sends `VOICE_STATE`; unmuting
    /// while deafened also undeafens. Optimistic: reverted on
    /// `VOICE_STATE_COOLDOWN`.
    pub async fn set_muted(&self, muted: bool) {
        let previous = *self.flags.lock().await;
        let mut next = previous;
        next.muted = muted;
        if !muted {
            next.deafened = false;
        }
        if previous.deafened && !next.deafened {
            let _ = self.events.send(SessionEvent::PlayUndeafenSound);
        }
        self.apply_voice_state(previous, next).await;
    }

    /// Deafening also mutes the outbound track.
    pub async fn set_deafened(&self, deafened: bool) {
        let previous = *self.flags.lock().await;
        let mut next = previous;
        next.deafened = deafened;
        if deafened {
            next.muted = true;
        }
        self.apply_voice_state(previous, next).await;
    }

    async fn apply_voice_state(&self, previous: VoiceFlags, next: VoiceFlags) {
        *self.flags.lock().await = next;
        *self.pending_revert.lock().await = Some(previous);
        if let Some(capture) = self.capture.lock().await.as_ref() {
            capture.set_muted(next.muted || next.deafened);
        }
        self.ws.voice_state(Some(next.muted), Some(next.deafened));
    }

    /// Rebuilds the capture DSP graph in place (section 4.5): never
    /// restarts the audio stream.
    pub async fn reconfigure_pipeline(&self, config: PipelineConfig) {
        *self.pipeline_config.lock().await = config;
        if let Some(capture) = self.capture.lock().await.as_ref() {
            capture.reconfigure(config);
        }
    }

    pub async fn start_screen_share(&self, track: Arc<TrackLocalStaticSample>) -> Result<(), ClientError> {
        let negotiator = self.negotiator.lock().await.clone().ok_or(ClientError::NoActiveVoiceSession)?;
        self.ws.screenshare_start();
        negotiator.start_screen_share(track).await
    }

    pub async fn stop_screen_share(&self) -> Result<(), ClientError> {
        if let Some(negotiator) = self.negotiator.lock().await.clone() {
            negotiator.stop_screen_share().await?;
        }
        self.ws.screenshare_stop();
        Ok(())
    }

    async fn teardown_voice(&self) {
        if let Some(negotiator) = self.negotiator.lock().await.take() {
            negotiator.close().await;
        }
        if let Some(mut capture) = self.capture.lock().await.take() {
            capture.stop();
        }
        if let Some(mut playback) = self.playback.lock().await.take() {
            playback.stop();
        }
    }

    pub fn websocket(&self) -> &WsConnection {
        &self.ws
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleController> {
        &self.lifecycle
    }
}
