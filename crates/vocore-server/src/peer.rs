//! A single participant's WebRTC connection: signaling operations, the
//! shared forwarding track built from whatever this peer publishes, and the
//! set of senders this peer receives other participants' tracks through.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

use vocore_protocol::TrackKind;
use vocore_media::codec;

use crate::error::{NegotiationError, Result, SfuError};

/// How long [`Peer::close`] waits for background tasks to notice the peer
/// connection is gone before abandoning them.
const PEER_CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Invoked once a peer's published track is ready to be distributed: audio
/// tracks fan out to every other active peer, video tracks hand off to the
/// screen-share manager. Owned by the SFU core, not the peer itself.
pub type TrackReadyCallback =
    Arc<dyn Fn(Uuid, TrackKind, Arc<TrackLocalStaticRTP>) + Send + Sync>;

pub struct Peer {
    pub user_id: Uuid,
    pc: Arc<RTCPeerConnection>,
    lifecycle: RwLock<Lifecycle>,
    local_audio_track: RwLock<Option<Arc<TrackLocalStaticRTP>>>,
    local_video_track: RwLock<Option<Arc<TrackLocalStaticRTP>>>,
    /// SSRC of this peer's *incoming* video track, so a PLI asking this
    /// peer's encoder for a keyframe targets the right media stream.
    remote_video_ssrc: RwLock<Option<u32>>,
    senders: RwLock<HashMap<(Uuid, TrackKind), Arc<RTCRtpSender>>>,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Peer {
    pub fn new(user_id: Uuid, pc: Arc<RTCPeerConnection>) -> Arc<Self> {
        Arc::new(Self {
            user_id,
            pc,
            lifecycle: RwLock::new(Lifecycle::Connecting),
            local_audio_track: RwLock::new(None),
            local_video_track: RwLock::new(None),
            remote_video_ssrc: RwLock::new(None),
            senders: RwLock::new(HashMap::new()),
            background_tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn peer_connection(&self) -> Arc<RTCPeerConnection> {
        self.pc.clone()
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read().await
    }

    pub async fn is_active(&self) -> bool {
        matches!(*self.lifecycle.read().await, Lifecycle::Active)
    }

    async fn ensure_active(&self) -> Result<()> {
        match *self.lifecycle.read().await {
            Lifecycle::Closing | Lifecycle::Closed => Err(SfuError::PeerNotActive(self.user_id)),
            Lifecycle::Connecting | Lifecycle::Active => Ok(()),
        }
    }

    pub async fn mark_active(&self) {
        let mut lifecycle = self.lifecycle.write().await;
        if *lifecycle == Lifecycle::Connecting {
            *lifecycle = Lifecycle::Active;
        }
    }

    /// Wires this peer's `on_track` handler to build the shared forwarding
    /// track for whatever this peer publishes and notify the SFU core.
    pub fn wire_on_track(self: &Arc<Self>, on_ready: TrackReadyCallback) {
        let peer = self.clone();
        self.pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver| {
            let peer = peer.clone();
            let on_ready = on_ready.clone();
            Box::pin(async move {
                peer.handle_incoming_track(track, on_ready).await;
            })
        }));
    }

    async fn handle_incoming_track(self: &Arc<Self>, remote: Arc<TrackRemote>, on_ready: TrackReadyCallback) {
        let kind = match remote.kind() {
            webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Audio => TrackKind::Audio,
            webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Video => TrackKind::Video,
            webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Unspecified => return,
        };

        let params = match kind {
            TrackKind::Audio => codec::audio_codec_parameters(),
            TrackKind::Video => codec::video_codec_parameters(),
        };

        let local_track = Arc::new(TrackLocalStaticRTP::new(
            params.capability,
            format!("{}-{:?}", self.user_id, kind),
            format!("source-{}", self.user_id),
        ));

        match kind {
            TrackKind::Audio => *self.local_audio_track.write().await = Some(local_track.clone()),
            TrackKind::Video => {
                *self.local_video_track.write().await = Some(local_track.clone());
                *self.remote_video_ssrc.write().await = Some(remote.ssrc());
            }
        }

        on_ready(self.user_id, kind, local_track.clone());

        let peer_id = self.user_id;
        let handle = tokio::spawn(async move {
            loop {
                match remote.read_rtp().await {
                    Ok((packet, _attributes)) => {
                        if let Err(e) = local_track.write_rtp(&packet).await {
                            tracing::warn!("forward write failed for {}: {}", peer_id, e);
                        }
                    }
                    Err(e) => {
                        let msg = e.to_string();
                        if msg.contains("closed") || msg.contains("eof") {
                            tracing::debug!("source track closed for {}", peer_id);
                            break;
                        }
                        tracing::warn!("error reading remote track for {}: {}", peer_id, e);
                        break;
                    }
                }
            }
        });

        self.background_tasks.lock().await.push(handle);
    }

    pub async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<()> {
        self.ensure_active().await?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| SfuError::Negotiation(NegotiationError::SetRemoteDescription(e)))
    }

    pub async fn create_answer(&self) -> Result<RTCSessionDescription> {
        self.ensure_active().await?;
        self.pc
            .create_answer(None)
            .await
            .map_err(|e| SfuError::Negotiation(NegotiationError::CreateOffer(e)))
    }

    pub async fn create_offer(&self) -> Result<RTCSessionDescription> {
        self.ensure_active().await?;
        self.pc
            .create_offer(None)
            .await
            .map_err(|e| SfuError::Negotiation(NegotiationError::CreateOffer(e)))
    }

    pub async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<()> {
        self.ensure_active().await?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| SfuError::Negotiation(NegotiationError::SetLocalDescription(e)))
    }

    pub async fn add_ice_candidate(&self, candidate: webrtc::ice_transport::ice_candidate::RTCIceCandidateInit) -> Result<()> {
        self.ensure_active().await?;
        self.pc.add_ice_candidate(candidate).await.map_err(SfuError::WebRtc)
    }

    pub fn signaling_state(&self) -> RTCSignalingState {
        self.pc.signaling_state()
    }

    /// Rolls back a local offer that lost a glare collision.
    pub async fn rollback(&self) -> Result<()> {
        self.ensure_active().await?;
        let rollback = RTCSessionDescription::rollback()
            .map_err(|e| SfuError::Negotiation(NegotiationError::Rollback(e)))?;
        self.pc
            .set_local_description(rollback)
            .await
            .map_err(|e| SfuError::Negotiation(NegotiationError::Rollback(e)))
    }

    /// Adds a sender for `track`, sourced from `source_user_id`, to this
    /// peer. Idempotent per (source_user_id, kind): a second call with the
    /// same source/kind is a no-op and returns `Ok(false)`.
    pub async fn add_track(
        &self,
        source_user_id: Uuid,
        kind: TrackKind,
        track: Arc<TrackLocalStaticRTP>,
    ) -> Result<bool> {
        self.ensure_active().await?;

        let key = (source_user_id, kind);
        if self.senders.read().await.contains_key(&key) {
            return Ok(false);
        }

        let sender = self.pc.add_track(track).await.map_err(SfuError::WebRtc)?;

        let peer_id = self.user_id;
        let sender_clone = sender.clone();
        let handle = tokio::spawn(async move {
            loop {
                match sender_clone.read_rtcp().await {
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!("rtcp drain stopped for {}: {}", peer_id, e);
                        break;
                    }
                }
            }
        });
        self.background_tasks.lock().await.push(handle);

        self.senders.write().await.insert(key, sender);
        Ok(true)
    }

    /// Removes every sender on this peer sourced from `source_user_id`.
    /// Idempotent: safe to call when there is nothing to remove.
    pub async fn remove_all_tracks_from(&self, source_user_id: Uuid) -> Result<usize> {
        let mut senders = self.senders.write().await;
        let matching: Vec<(Uuid, TrackKind)> = senders
            .keys()
            .filter(|(uid, _)| *uid == source_user_id)
            .copied()
            .collect();

        let mut removed = 0;
        for key in matching {
            if let Some(sender) = senders.remove(&key) {
                if let Err(e) = self.pc.remove_track(&sender).await {
                    tracing::warn!("failed to remove track from {}: {}", self.user_id, e);
                } else {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    pub async fn has_sender_from(&self, source_user_id: Uuid, kind: TrackKind) -> bool {
        self.senders.read().await.contains_key(&(source_user_id, kind))
    }

    /// Ensures this peer has a video transceiver to receive a screen-share
    /// track on, adding a recv-only one if none exists yet.
    pub async fn ensure_video_transceiver(&self) -> Result<()> {
        self.ensure_active().await?;
        let transceivers = self.pc.get_transceivers().await;
        let has_video = transceivers
            .iter()
            .any(|t| t.kind() == webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Video);

        if !has_video {
            self.pc
                .add_transceiver_from_kind(
                    webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Video,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(SfuError::WebRtc)?;
        }
        Ok(())
    }

    /// Sends a Picture Loss Indication to this peer, asking its encoder for
    /// a fresh keyframe. Used on the streamer's peer after a new viewer's
    /// renegotiation completes. No-op if this peer's incoming video track
    /// hasn't arrived yet (no SSRC to target).
    pub async fn request_keyframe(&self) -> Result<()> {
        self.ensure_active().await?;
        let Some(media_ssrc) = *self.remote_video_ssrc.read().await else {
            tracing::debug!("no video ssrc known yet for {}, dropping keyframe request", self.user_id);
            return Ok(());
        };
        self.pc
            .write_rtcp(&[Box::new(PictureLossIndication { sender_ssrc: 0, media_ssrc })])
            .await
            .map_err(SfuError::WebRtc)
    }

    pub async fn local_audio_track(&self) -> Option<Arc<TrackLocalStaticRTP>> {
        self.local_audio_track.read().await.clone()
    }

    pub async fn local_video_track(&self) -> Option<Arc<TrackLocalStaticRTP>> {
        self.local_video_track.read().await.clone()
    }

    /// Closing -> close the underlying connection -> wait up to
    /// [`PEER_CLOSE_TIMEOUT`] for background tasks to notice -> Closed.
    pub async fn close(&self) {
        {
            let mut lifecycle = self.lifecycle.write().await;
            if *lifecycle == Lifecycle::Closing || *lifecycle == Lifecycle::Closed {
                return;
            }
            *lifecycle = Lifecycle::Closing;
        }

        if let Err(e) = self.pc.close().await {
            tracing::warn!("error closing peer connection for {}: {}", self.user_id, e);
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background_tasks.lock().await);
        let drain = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(PEER_CLOSE_TIMEOUT, drain).await.is_err() {
            tracing::warn!("peer {} background tasks did not drain in time", self.user_id);
        }

        *self.lifecycle.write().await = Lifecycle::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_starts_connecting() {
        assert_eq!(Lifecycle::Connecting, Lifecycle::Connecting);
    }
}
