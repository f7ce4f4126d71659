//! SFU Core: peer registry, track distribution, and perfect-negotiation
//! bookkeeping for the single global voice room.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use vocore_media::codec;
use vocore_protocol::TrackKind;

use crate::config::Config;
use crate::error::{NegotiationError, Result, SfuError};
use crate::peer::Peer;
use crate::screen_share::ScreenShareManager;

/// Where the SFU core sends the signaling messages it originates
/// (server-initiated offers, ICE candidates gathered locally). Implemented
/// by the voice hub, which owns the WebSocket connections.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send_offer(&self, user_id: Uuid, sdp: String);
    async fn send_answer(&self, user_id: Uuid, sdp: String);
    async fn send_ice_candidate(
        &self,
        user_id: Uuid,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    );
}

#[derive(Default)]
struct NegotiationTable {
    negotiating: HashSet<Uuid>,
    pending: HashSet<Uuid>,
}

pub struct SfuCore {
    api: Arc<API>,
    peers: RwLock<HashMap<Uuid, Arc<Peer>>>,
    negotiation: Mutex<NegotiationTable>,
    signaling: RwLock<Option<Arc<dyn SignalingChannel>>>,
    pub screen_share: Arc<ScreenShareManager>,
}

impl SfuCore {
    pub fn new(config: &Config) -> Result<Arc<Self>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(codec::audio_codec_parameters(), RTPCodecType::Audio)
            .map_err(SfuError::WebRtc)?;
        media_engine
            .register_codec(codec::video_codec_parameters(), RTPCodecType::Video)
            .map_err(SfuError::WebRtc)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(SfuError::WebRtc)?;

        let mut setting_engine = SettingEngine::default();
        setting_engine
            .set_ephemeral_udp_port_range(config.sfu_udp_port_min, config.sfu_udp_port_max)
            .map_err(SfuError::WebRtc)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        Ok(Arc::new(Self {
            api: Arc::new(api),
            peers: RwLock::new(HashMap::new()),
            negotiation: Mutex::new(NegotiationTable::default()),
            signaling: RwLock::new(None),
            screen_share: ScreenShareManager::new(),
        }))
    }

    pub async fn set_signaling_channel(&self, channel: Arc<dyn SignalingChannel>) {
        *self.signaling.write().await = Some(channel);
    }

    async fn signaling(&self) -> Option<Arc<dyn SignalingChannel>> {
        self.signaling.read().await.clone()
    }

    async fn get_active_peer(&self, user_id: Uuid) -> Result<Arc<Peer>> {
        let peer = self
            .peers
            .read()
            .await
            .get(&user_id)
            .cloned()
            .ok_or(SfuError::PeerNotFound(user_id))?;
        if !peer.is_active().await {
            return Err(SfuError::PeerNotActive(user_id));
        }
        Ok(peer)
    }

    /// Replaces any existing peer for `user_id` and wires up lifecycle,
    /// track-ready, and ICE-candidate callbacks.
    pub async fn add_peer(self: &Arc<Self>, user_id: Uuid, ice_servers: Vec<RTCIceServer>) -> Result<Arc<Peer>> {
        if let Some(existing) = self.peers.write().await.remove(&user_id) {
            existing.close().await;
        }

        let rtc_config = RTCConfiguration { ice_servers, ..Default::default() };
        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(SfuError::WebRtc)?,
        );

        let peer = Peer::new(user_id, pc.clone());

        let weak_self = Arc::downgrade(self);
        let peer_for_state = peer.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let peer = peer_for_state.clone();
            let weak_self = weak_self.clone();
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Connected => peer.mark_active().await,
                    RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Closed
                    | RTCPeerConnectionState::Disconnected => {
                        if let Some(sfu) = weak_self.upgrade() {
                            sfu.remove_peer(user_id).await;
                        }
                    }
                    _ => {}
                }
            })
        }));

        let weak_self = Arc::downgrade(self);
        pc.on_ice_candidate(Box::new(move |candidate| {
            let weak_self = weak_self.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let Ok(init) = candidate.to_json() else { return };
                if let Some(sfu) = weak_self.upgrade() {
                    if let Some(signaling) = sfu.signaling().await {
                        signaling
                            .send_ice_candidate(user_id, init.candidate, init.sdp_mid, init.sdp_mline_index)
                            .await;
                    }
                }
            })
        }));

        let weak_self = Arc::downgrade(self);
        peer.wire_on_track(Arc::new(move |source_user_id, kind, track| {
            if let Some(sfu) = weak_self.upgrade() {
                tokio::spawn(async move {
                    sfu.handle_track_ready(source_user_id, kind, track).await;
                });
            }
        }));

        self.peers.write().await.insert(user_id, peer.clone());
        Ok(peer)
    }

    /// Closes the peer, removes every sender sourced from it on every other
    /// peer, and triggers renegotiation for those affected.
    pub async fn remove_peer(self: &Arc<Self>, user_id: Uuid) {
        let peer = self.peers.write().await.remove(&user_id);
        if let Some(peer) = peer {
            peer.close().await;
        }
        self.screen_share.remove_user(user_id).await;

        let peers: Vec<(Uuid, Arc<Peer>)> = self
            .peers
            .read()
            .await
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();

        for (other_id, other_peer) in peers {
            match other_peer.remove_all_tracks_from(user_id).await {
                Ok(n) if n > 0 => self.trigger_renegotiation(other_id).await,
                _ => {}
            }
        }

        let mut table = self.negotiation.lock().await;
        table.negotiating.remove(&user_id);
        table.pending.remove(&user_id);
    }

    pub async fn has_peer(&self, user_id: Uuid) -> bool {
        self.peers.read().await.contains_key(&user_id)
    }

    pub async fn peer_ids(&self) -> Vec<Uuid> {
        self.peers.read().await.keys().copied().collect()
    }

    /// Server always initiates the first offer (ICE-controlling agent).
    pub async fn send_initial_offer(self: &Arc<Self>, user_id: Uuid) {
        self.trigger_renegotiation(user_id).await;
    }

    /// Incoming offer from `user_id`. Server is the impolite party: an
    /// offer while not stable is dropped unless the user has a pending
    /// screen share, in which case the server rolls back its own offer.
    pub async fn handle_offer(self: &Arc<Self>, user_id: Uuid, sdp: String) -> Result<()> {
        let peer = self.get_active_peer(user_id).await?;

        if peer.signaling_state() != RTCSignalingState::Stable {
            if !self.screen_share.has_pending_share(user_id).await {
                tracing::debug!(
                    "dropping offer from {} while not stable (no pending screen share)",
                    user_id
                );
                return Ok(());
            }
            peer.rollback().await?;
            self.negotiation.lock().await.negotiating.remove(&user_id);
        }

        let offer = RTCSessionDescription::offer(sdp).map_err(SfuError::WebRtc)?;
        peer.set_remote_description(offer).await?;
        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;

        if let Some(signaling) = self.signaling().await {
            signaling.send_answer(user_id, answer.sdp).await;
        }
        Ok(())
    }

    /// Incoming answer from `user_id` for an offer the server sent.
    pub async fn handle_answer(self: &Arc<Self>, user_id: Uuid, sdp: String) -> Result<()> {
        let peer = self.get_active_peer(user_id).await?;
        let answer = RTCSessionDescription::answer(sdp).map_err(SfuError::WebRtc)?;
        peer.set_remote_description(answer).await?;

        let needs_more = {
            let mut table = self.negotiation.lock().await;
            table.negotiating.remove(&user_id);
            table.pending.remove(&user_id)
        };

        if needs_more {
            self.trigger_renegotiation(user_id).await;
        }
        Ok(())
    }

    pub async fn handle_ice_candidate(
        &self,
        user_id: Uuid,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> Result<()> {
        let peer = self.get_active_peer(user_id).await?;
        peer.add_ice_candidate(RTCIceCandidateInit {
            candidate,
            sdp_mid,
            sdp_mline_index,
            ..Default::default()
        })
        .await
    }

    /// No-op if no signaling channel or the peer is gone. Otherwise claims
    /// the negotiating slot atomically under the same lock as the
    /// stable-state check, then creates and sends an offer.
    pub async fn trigger_renegotiation(self: &Arc<Self>, user_id: Uuid) {
        let Some(signaling) = self.signaling().await else { return };
        let Some(peer) = self.peers.read().await.get(&user_id).cloned() else { return };
        if !peer.is_active().await {
            return;
        }

        {
            let mut table = self.negotiation.lock().await;
            if peer.signaling_state() != RTCSignalingState::Stable || table.negotiating.contains(&user_id) {
                table.pending.insert(user_id);
                return;
            }
            table.negotiating.insert(user_id);
            table.pending.remove(&user_id);
        }

        let result: Result<()> = async {
            let offer = peer.create_offer().await?;
            peer.set_local_description(offer.clone()).await?;
            signaling.send_offer(user_id, offer.sdp).await;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            tracing::warn!("renegotiation failed for {}: {}", user_id, e);
            self.negotiation.lock().await.negotiating.remove(&user_id);
        }
    }

    /// A peer's shared forwarding track became ready to distribute. Audio
    /// fans out to every other active peer (and every other peer's audio
    /// fans back to this one); video hands off to the screen-share manager.
    async fn handle_track_ready(self: Arc<Self>, source_user_id: Uuid, kind: TrackKind, track: Arc<TrackLocalStaticRTP>) {
        match kind {
            TrackKind::Audio => self.distribute_audio(source_user_id, track).await,
            TrackKind::Video => self.screen_share.on_video_track_ready(source_user_id, track).await,
        }
    }

    async fn distribute_audio(self: &Arc<Self>, source_user_id: Uuid, track: Arc<TrackLocalStaticRTP>) {
        let peers: Vec<(Uuid, Arc<Peer>)> = self
            .peers
            .read()
            .await
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();

        for (other_id, other_peer) in &peers {
            if *other_id == source_user_id || !other_peer.is_active().await {
                continue;
            }
            match other_peer.add_track(source_user_id, TrackKind::Audio, track.clone()).await {
                Ok(true) => self.trigger_renegotiation(*other_id).await,
                Ok(false) => {}
                Err(e) => tracing::warn!("failed to add audio track from {} to {}: {}", source_user_id, other_id, e),
            }
        }

        let Some(new_peer) = self.peers.read().await.get(&source_user_id).cloned() else { return };
        let mut added_any = false;
        for (other_id, other_peer) in &peers {
            if *other_id == source_user_id {
                continue;
            }
            if let Some(other_audio) = other_peer.local_audio_track().await {
                if new_peer
                    .add_track(*other_id, TrackKind::Audio, other_audio)
                    .await
                    .unwrap_or(false)
                {
                    added_any = true;
                }
            }
        }
        if added_any {
            self.trigger_renegotiation(source_user_id).await;
        }
    }

    pub async fn peer_for(&self, user_id: Uuid) -> Option<Arc<Peer>> {
        self.peers.read().await.get(&user_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> Config {
        Config {
            bind_address: "127.0.0.1:0".into(),
            jwt_secret: "x".repeat(32),
            access_token_ttl: Duration::from_secs(900),
            refresh_token_ttl: Duration::from_secs(2_592_000),
            magic_code_ttl: Duration::from_secs(600),
            stun_servers: vec![],
            turn_host: None,
            turn_port: 3478,
            turn_secret: None,
            turn_credential_ttl: Duration::from_secs(86400),
            sfu_udp_port_min: 50000,
            sfu_udp_port_max: 50100,
            sfu_public_ip: None,
            ws_allowed_origins: vec![],
            trusted_proxy_cidrs: vec![],
            max_unauth_per_ip: 20,
            max_unauth_global: 200,
            unauth_timeout: Duration::from_secs(10),
            upload_max_bytes: 1024,
            voice_join_cooldown: Duration::from_secs(15),
            voice_state_cooldown: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn new_sfu_core_starts_with_no_peers() {
        let sfu = SfuCore::new(&test_config()).unwrap();
        assert!(sfu.peer_ids().await.is_empty());
    }

    #[tokio::test]
    async fn remove_unknown_peer_is_a_no_op() {
        let sfu = SfuCore::new(&test_config()).unwrap();
        sfu.remove_peer(Uuid::new_v4()).await;
    }

    #[tokio::test]
    async fn renegotiation_without_signaling_channel_is_a_no_op() {
        let sfu = SfuCore::new(&test_config()).unwrap();
        sfu.trigger_renegotiation(Uuid::new_v4()).await;
    }
}
