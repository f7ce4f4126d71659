//! The client's perfect-negotiation state machine: one peer connection to
//! the SFU, SDP offer/answer/ICE bookkeeping, ICE restart, the answer
//! timeout, and screen-share sender activation from section 4.6.
//!
//! The server is impolite (drops or rolls back colliding offers); this side
//! is polite, so every colliding remote offer wins and we roll back our own
//! outstanding one first.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify, RwLock};
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use vocore_media::codec;
use vocore_protocol::{IceServer, TrackKind};

use crate::error::ClientError;

/// `disconnected` -> restart after this delay.
const ICE_RESTART_DELAY: Duration = Duration::from_secs(2);
/// `failed` -> restart with no delay.
const ICE_RESTART_IMMEDIATE: Duration = Duration::from_secs(0);
const ICE_RESTART_MAX_ATTEMPTS: u32 = 3;
/// How long to wait for an answer to the initial, self-initiated offer.
const ANSWER_TIMEOUT: Duration = Duration::from_secs(10);

const AUDIO_MAX_BITRATE_BPS: u32 = 128_000;
const SCREEN_SHARE_MAX_BITRATE_BPS: u32 = 2_500_000;

/// Where the negotiator sends the signaling messages it originates.
/// Implemented by [`crate::websocket::WsConnection`].
#[async_trait]
pub trait SignalingSink: Send + Sync {
    async fn send_offer(&self, sdp: String);
    async fn send_answer(&self, sdp: String);
    async fn send_ice_candidate(&self, candidate: String, sdp_mid: Option<String>, sdp_mline_index: Option<u16>);
    async fn send_voice_leave(&self);
}

/// Events the negotiator surfaces to whatever wires it up; it never reaches
/// into UI/session code directly.
#[derive(Clone)]
pub enum NegotiatorEvent {
    /// A remote track arrived: the destination audio-playback path or the
    /// screen-share viewer, depending on kind.
    RemoteTrack(TrackKind, Arc<TrackRemote>),
    /// The underlying peer connection reached `Connected` for the first
    /// time (or again, after reconnecting via ICE restart). Drives the
    /// `Joining -> Active` voice lifecycle transition.
    Connected,
    /// `ICE_RESTART_MAX_ATTEMPTS` restarts all failed to recover the
    /// connection. The caller should tear down and surface the failure.
    IceRestartExhausted,
    /// The initial offer went unanswered for `ANSWER_TIMEOUT`.
    OfferTimeout,
}

fn build_api() -> Result<API, ClientError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_codec(codec::audio_codec_parameters(), RTPCodecType::Audio)
        .map_err(ClientError::WebRtc)?;
    media_engine
        .register_codec(codec::video_codec_parameters(), RTPCodecType::Video)
        .map_err(ClientError::WebRtc)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(ClientError::WebRtc)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_rtc_ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone().unwrap_or_default(),
            credential: s.credential.clone().unwrap_or_default(),
        })
        .collect()
}

/// Inserts (or replaces) a `b=AS:<kbps>` bandwidth line under the first
/// `m=<media>` section of `sdp`. Used to apply the post-negotiation encoding
/// hints from section 4.6 without a verified mutable `RTCRtpSender`
/// parameters setter in this webrtc-rs version.
fn apply_bandwidth_limit(sdp: &str, media: &str, bps: u32) -> String {
    let kbps = bps / 1000;
    let mut out = Vec::with_capacity(sdp.lines().count() + 1);
    let mut in_section = false;
    let mut inserted_in_section = false;

    for line in sdp.lines() {
        if line.starts_with("m=") {
            in_section = line.starts_with(&format!("m={media}"));
            inserted_in_section = false;
        }
        if in_section && line.starts_with("b=AS:") {
            out.push(format!("b=AS:{kbps}"));
            inserted_in_section = true;
            continue;
        }
        out.push(line.to_string());
        if in_section && !inserted_in_section && line.starts_with("c=") {
            out.push(format!("b=AS:{kbps}"));
            inserted_in_section = true;
        }
    }
    out.join("\r\n") + "\r\n"
}

pub struct Negotiator {
    pc: Arc<RTCPeerConnection>,
    signaling: Arc<dyn SignalingSink>,
    events: mpsc::UnboundedSender<NegotiatorEvent>,

    audio_ready: Notify,
    audio_track_ready: AtomicBool,
    pending_audio_track: std::sync::Mutex<Option<Arc<TrackLocalStaticSample>>>,
    audio_sender: RwLock<Option<Arc<RTCRtpSender>>>,
    video_sender: RwLock<Option<Arc<RTCRtpSender>>>,

    making_offer: AtomicBool,
    negotiated_once: AtomicBool,
    ice_restart_attempts: AtomicU32,
    answer_timeout_task: AsyncMutex<Option<JoinHandle<()>>>,
    ice_restart_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Negotiator {
    pub async fn new(
        ice_servers: Vec<IceServer>,
        signaling: Arc<dyn SignalingSink>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<NegotiatorEvent>), ClientError> {
        let api = build_api()?;
        let rtc_config = RTCConfiguration { ice_servers: to_rtc_ice_servers(&ice_servers), ..Default::default() };
        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(ClientError::WebRtc)?);

        let (events, event_rx) = mpsc::unbounded_channel();

        let this = Arc::new(Self {
            pc,
            signaling,
            events,
            audio_ready: Notify::new(),
            audio_track_ready: AtomicBool::new(false),
            pending_audio_track: std::sync::Mutex::new(None),
            audio_sender: RwLock::new(None),
            video_sender: RwLock::new(None),
            making_offer: AtomicBool::new(false),
            negotiated_once: AtomicBool::new(false),
            ice_restart_attempts: AtomicU32::new(0),
            answer_timeout_task: AsyncMutex::new(None),
            ice_restart_task: AsyncMutex::new(None),
        });

        this.wire_ice_candidate();
        this.wire_connection_state();
        this.wire_on_track();

        Ok((this, event_rx))
    }

    fn wire_ice_candidate(self: &Arc<Self>) {
        let this = self.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let this = this.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let Ok(init) = candidate.to_json() else { return };
                this.signaling
                    .send_ice_candidate(init.candidate, init.sdp_mid, init.sdp_mline_index)
                    .await;
            })
        }));
    }

    fn wire_connection_state(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.pc.on_peer_connection_state_change(Box::new(move |state| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(this) = weak.upgrade() else { return };
                match state {
                    RTCPeerConnectionState::Connected => {
                        this.ice_restart_attempts.store(0, Ordering::SeqCst);
                        this.cancel_ice_restart_task().await;
                        let _ = this.events.send(NegotiatorEvent::Connected);
                    }
                    RTCPeerConnectionState::Disconnected => {
                        this.schedule_ice_restart(ICE_RESTART_DELAY).await;
                    }
                    RTCPeerConnectionState::Failed => {
                        this.schedule_ice_restart(ICE_RESTART_IMMEDIATE).await;
                    }
                    _ => {}
                }
            })
        }));
    }

    fn wire_on_track(self: &Arc<Self>) {
        let this = self.clone();
        self.pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver| {
            let this = this.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    RTPCodecType::Unspecified => return,
                };
                let _ = this.events.send(NegotiatorEvent::RemoteTrack(kind, track));
            })
        }));
    }

    /// Called once mic capture and the DSP pipeline are up: unblocks any
    /// negotiation waiting on `wait_audio_ready`.
    pub fn set_audio_track(&self, track: Arc<TrackLocalStaticSample>) {
        *self.pending_audio_track.lock().unwrap() = Some(track);
        self.audio_track_ready.store(true, Ordering::SeqCst);
        self.audio_ready.notify_waiters();
    }

    async fn wait_audio_ready(&self) {
        if self.audio_track_ready.load(Ordering::SeqCst) {
            return;
        }
        self.audio_ready.notified().await;
    }

    /// Idempotent: the outbound audio sender attaches once, the first time
    /// a negotiation needs it.
    async fn ensure_audio_sender_attached(&self) -> Result<(), ClientError> {
        if self.audio_sender.read().await.is_some() {
            return Ok(());
        }
        self.wait_audio_ready().await;
        let track = self
            .pending_audio_track
            .lock()
            .unwrap()
            .clone()
            .expect("audio_track_ready implies a track has been set");
        let sender = self
            .pc
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(ClientError::WebRtc)?;
        *self.audio_sender.write().await = Some(sender);
        Ok(())
    }

    fn apply_encoding_hints(&self, sdp: String) -> String {
        if !self.negotiated_once.load(Ordering::SeqCst) {
            return sdp;
        }
        let sdp = apply_bandwidth_limit(&sdp, "audio", AUDIO_MAX_BITRATE_BPS);
        if self.video_sender.try_read().map(|g| g.is_some()).unwrap_or(false) {
            apply_bandwidth_limit(&sdp, "video", SCREEN_SHARE_MAX_BITRATE_BPS)
        } else {
            sdp
        }
    }

    /// Server always sends the first offer (section 4.3); this drives the
    /// response path for every offer, initial or renegotiated.
    pub async fn handle_remote_offer(self: &Arc<Self>, sdp: String) -> Result<(), ClientError> {
        self.cancel_answer_timeout().await;

        let offer = RTCSessionDescription::offer(sdp).map_err(ClientError::WebRtc)?;
        let collision = self.making_offer.load(Ordering::SeqCst) || self.pc.signaling_state() != RTCSignalingState::Stable;

        if collision {
            let rollback = RTCSessionDescription::rollback().map_err(ClientError::WebRtc)?;
            self.pc.set_local_description(rollback).await.map_err(ClientError::WebRtc)?;
        }

        self.pc.set_remote_description(offer).await.map_err(ClientError::WebRtc)?;
        self.ensure_audio_sender_attached().await?;

        let mut answer = self.pc.create_answer(None).await.map_err(ClientError::WebRtc)?;
        answer.sdp = self.apply_encoding_hints(answer.sdp);
        self.pc.set_local_description(answer.clone()).await.map_err(ClientError::WebRtc)?;
        self.signaling.send_answer(answer.sdp).await;
        self.negotiated_once.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// An answer to an offer this side sent (renegotiation we initiated, or
    /// an ICE restart).
    pub async fn handle_remote_answer(self: &Arc<Self>, sdp: String) -> Result<(), ClientError> {
        self.cancel_answer_timeout().await;
        self.making_offer.store(false, Ordering::SeqCst);
        let answer = RTCSessionDescription::answer(sdp).map_err(ClientError::WebRtc)?;
        self.pc.set_remote_description(answer).await.map_err(ClientError::WebRtc)?;
        self.negotiated_once.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn handle_remote_ice_candidate(
        &self,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> Result<(), ClientError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit { candidate, sdp_mid, sdp_mline_index, ..Default::default() })
            .await
            .map_err(ClientError::WebRtc)
    }

    /// Arms the `ANSWER_TIMEOUT` watchdog for a self-initiated offer. Call
    /// right after sending it; `handle_remote_answer`/`handle_remote_offer`
    /// cancel it on arrival of whatever comes back.
    pub async fn arm_answer_timeout(self: &Arc<Self>) {
        self.cancel_answer_timeout().await;
        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(ANSWER_TIMEOUT).await;
            let _ = this.events.send(NegotiatorEvent::OfferTimeout);
        });
        *self.answer_timeout_task.lock().await = Some(handle);
    }

    async fn cancel_answer_timeout(&self) {
        if let Some(handle) = self.answer_timeout_task.lock().await.take() {
            handle.abort();
        }
    }

    async fn schedule_ice_restart(self: &Arc<Self>, delay: Duration) {
        let mut slot = self.ice_restart_task.lock().await;
        if slot.is_some() {
            return;
        }
        let this = self.clone();
        *slot = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            this.attempt_ice_restart().await;
            *this.ice_restart_task.lock().await = None;
        }));
    }

    async fn cancel_ice_restart_task(&self) {
        if let Some(handle) = self.ice_restart_task.lock().await.take() {
            handle.abort();
        }
    }

    async fn attempt_ice_restart(self: &Arc<Self>) {
        let attempt = self.ice_restart_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > ICE_RESTART_MAX_ATTEMPTS {
            let _ = self.events.send(NegotiatorEvent::IceRestartExhausted);
            return;
        }

        let result: Result<(), ClientError> = async {
            self.making_offer.store(true, Ordering::SeqCst);
            let options = RTCOfferOptions { ice_restart: true, ..Default::default() };
            let offer = self.pc.create_offer(Some(options)).await.map_err(ClientError::WebRtc)?;
            self.pc.set_local_description(offer.clone()).await.map_err(ClientError::WebRtc)?;
            self.signaling.send_offer(offer.sdp).await;
            self.arm_answer_timeout().await;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            tracing::warn!("ICE restart attempt {} failed: {}", attempt, e);
            self.making_offer.store(false, Ordering::SeqCst);
        }
    }

    /// Ensures a send-only video transceiver exists, then attaches `track`
    /// to its sender. The first call triggers renegotiation (new m= line);
    /// later start/stop cycles in the same session just swap the sender's
    /// track via `replace_track`, with no renegotiation needed.
    pub async fn start_screen_share(self: &Arc<Self>, track: Arc<TrackLocalStaticSample>) -> Result<(), ClientError> {
        let sender = self.ensure_video_sender().await?;
        sender
            .replace_track(Some(track as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(ClientError::WebRtc)
    }

    pub async fn stop_screen_share(&self) -> Result<(), ClientError> {
        let sender = self.video_sender.read().await.clone();
        if let Some(sender) = sender {
            sender.replace_track(None).await.map_err(ClientError::WebRtc)?;
        }
        Ok(())
    }

    async fn ensure_video_sender(self: &Arc<Self>) -> Result<Arc<RTCRtpSender>, ClientError> {
        if let Some(sender) = self.video_sender.read().await.clone() {
            return Ok(sender);
        }

        let transceiver = self
            .pc
            .add_transceiver_from_kind(
                RTPCodecType::Video,
                Some(RTCRtpTransceiverInit { direction: RTCRtpTransceiverDirection::Sendonly, send_encodings: vec![] }),
            )
            .await
            .map_err(ClientError::WebRtc)?;
        let sender = transceiver.sender().await;
        *self.video_sender.write().await = Some(sender.clone());
        Ok(sender)
    }

    pub fn peer_connection(&self) -> Arc<RTCPeerConnection> {
        self.pc.clone()
    }

    pub async fn close(&self) {
        self.cancel_answer_timeout().await;
        self.cancel_ice_restart_task().await;
        if let Err(e) = self.pc.close().await {
            tracing::warn!("error closing peer connection: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bandwidth_hint_inserted_after_connection_line() {
        let sdp = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nc=IN IP4 0.0.0.0\r\na=mid:0\r\n";
        let out = apply_bandwidth_limit(sdp, "audio", 128_000);
        assert!(out.contains("c=IN IP4 0.0.0.0\r\nb=AS:128"));
    }

    #[test]
    fn bandwidth_hint_replaces_existing_line() {
        let sdp = "v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 98\r\nc=IN IP4 0.0.0.0\r\nb=AS:600\r\na=mid:1\r\n";
        let out = apply_bandwidth_limit(sdp, "video", 2_500_000);
        assert!(out.contains("b=AS:2500"));
        assert!(!out.contains("b=AS:600"));
    }

    #[test]
    fn bandwidth_hint_only_touches_matching_media_section() {
        let sdp = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nc=IN IP4 0.0.0.0\r\nm=video 9 UDP/TLS/RTP/SAVPF 98\r\nc=IN IP4 0.0.0.0\r\n";
        let out = apply_bandwidth_limit(sdp, "video", 2_500_000);
        let audio_section = out.split("m=video").next().unwrap();
        assert!(!audio_section.contains("b=AS:"));
        assert!(out.contains("b=AS:2500"));
    }
}
