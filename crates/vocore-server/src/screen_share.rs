//! Screen-Share Manager: pending-track activation, viewer subscriptions,
//! and keyframe pacing tied to renegotiation completion.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use vocore_protocol::TrackKind;

use crate::sfu::SfuCore;

/// Notifies the hub so it can fan a `SCREEN_SHARE_UPDATE` out to the room.
#[async_trait]
pub trait ScreenShareBroadcast: Send + Sync {
    async fn broadcast_streaming(&self, user_id: Uuid, streaming: bool);
}

struct ShareState {
    has_track: bool,
    track: Option<Arc<TrackLocalStaticRTP>>,
}

pub struct ScreenShareManager {
    active_streams: RwLock<HashMap<Uuid, ShareState>>,
    /// viewer_id -> streamer_id
    subscriptions: RwLock<HashMap<Uuid, Uuid>>,
    streamer_viewers: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
    /// viewer_id -> streamer_id, cleared and actioned on renegotiation complete
    pending_keyframes: RwLock<HashMap<Uuid, Uuid>>,
    sfu: RwLock<Option<Weak<SfuCore>>>,
    broadcast: RwLock<Option<Arc<dyn ScreenShareBroadcast>>>,
}

impl ScreenShareManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            active_streams: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            streamer_viewers: RwLock::new(HashMap::new()),
            pending_keyframes: RwLock::new(HashMap::new()),
            sfu: RwLock::new(None),
            broadcast: RwLock::new(None),
        })
    }

    pub async fn set_sfu(&self, sfu: Weak<SfuCore>) {
        *self.sfu.write().await = Some(sfu);
    }

    pub async fn set_broadcast(&self, broadcast: Arc<dyn ScreenShareBroadcast>) {
        *self.broadcast.write().await = Some(broadcast);
    }

    async fn sfu(&self) -> Option<Arc<SfuCore>> {
        self.sfu.read().await.as_ref()?.upgrade()
    }

    pub async fn has_pending_share(&self, streamer: Uuid) -> bool {
        matches!(self.active_streams.read().await.get(&streamer), Some(s) if !s.has_track)
    }

    /// Registers `streamer` as about to share. If a track from an earlier
    /// share this session was already cached (client did `replaceTrack`
    /// rather than full renegotiation), treats this as an immediate
    /// [`Self::on_video_track_ready`].
    pub async fn start_share(self: &Arc<Self>, streamer: Uuid) {
        if let Some(sfu) = self.sfu().await {
            if let Some(peer) = sfu.peer_for(streamer).await {
                if let Err(e) = peer.ensure_video_transceiver().await {
                    tracing::warn!("failed to ensure video transceiver for {}: {}", streamer, e);
                }
            }
        }

        let cached_track = {
            let streams = self.active_streams.read().await;
            streams.get(&streamer).and_then(|s| s.track.clone())
        };

        if let Some(track) = cached_track {
            self.on_video_track_ready(streamer, track).await;
            return;
        }

        self.active_streams
            .write()
            .await
            .insert(streamer, ShareState { has_track: false, track: None });
    }

    /// The streamer's video track arrived (or a cached one is being
    /// reactivated). Marks the stream live, broadcasts `streaming=true`,
    /// and attaches the track to every viewer already subscribed.
    pub async fn on_video_track_ready(self: &Arc<Self>, streamer: Uuid, track: Arc<TrackLocalStaticRTP>) {
        self.active_streams
            .write()
            .await
            .entry(streamer)
            .and_modify(|s| {
                s.has_track = true;
                s.track = Some(track.clone());
            })
            .or_insert_with(|| ShareState { has_track: true, track: Some(track.clone()) });

        if let Some(broadcast) = self.broadcast.read().await.clone() {
            broadcast.broadcast_streaming(streamer, true).await;
        }

        let viewers: Vec<Uuid> = self
            .streamer_viewers
            .read()
            .await
            .get(&streamer)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .collect();

        for viewer in viewers {
            self.add_video_track_to_viewer(viewer, streamer, track.clone()).await;
        }
    }

    /// Stops a share: clears state, detaches every viewer, and broadcasts
    /// `streaming=false` only if a track had ever actually arrived.
    pub async fn stop_share(self: &Arc<Self>, streamer: Uuid) {
        let state = self.active_streams.write().await.remove(&streamer);
        let had_track = state.map(|s| s.has_track).unwrap_or(false);

        let viewers: Vec<Uuid> = self
            .streamer_viewers
            .write()
            .await
            .remove(&streamer)
            .unwrap_or_default()
            .into_iter()
            .collect();

        for viewer in &viewers {
            self.subscriptions.write().await.remove(viewer);
            self.pending_keyframes.write().await.remove(viewer);
            self.remove_video_track_from_viewer(*viewer, streamer).await;
        }

        if had_track {
            if let Some(broadcast) = self.broadcast.read().await.clone() {
                broadcast.broadcast_streaming(streamer, false).await;
            }
        }
    }

    /// No-op if the streamer has no track yet. If the viewer was subscribed
    /// elsewhere, unsubscribes there first (triggering its own
    /// renegotiation), re-checks the streamer's track state after the
    /// relock, then records the new subscription.
    pub async fn subscribe(self: &Arc<Self>, viewer: Uuid, streamer: Uuid) {
        if !matches!(self.active_streams.read().await.get(&streamer), Some(s) if s.has_track) {
            return;
        }

        let previous = self.subscriptions.read().await.get(&viewer).copied();
        if let Some(previous_streamer) = previous {
            if previous_streamer != streamer {
                self.unsubscribe(viewer).await;
            } else {
                return;
            }
        }

        let Some(track) = self
            .active_streams
            .read()
            .await
            .get(&streamer)
            .filter(|s| s.has_track)
            .and_then(|s| s.track.clone())
        else {
            return;
        };

        self.subscriptions.write().await.insert(viewer, streamer);
        self.streamer_viewers
            .write()
            .await
            .entry(streamer)
            .or_default()
            .insert(viewer);

        self.add_video_track_to_viewer(viewer, streamer, track).await;
    }

    pub async fn unsubscribe(self: &Arc<Self>, viewer: Uuid) {
        let Some(streamer) = self.subscriptions.write().await.remove(&viewer) else { return };
        self.pending_keyframes.write().await.remove(&viewer);
        if let Some(viewers) = self.streamer_viewers.write().await.get_mut(&streamer) {
            viewers.remove(&viewer);
        }
        self.remove_video_track_from_viewer(viewer, streamer).await;
    }

    async fn add_video_track_to_viewer(self: &Arc<Self>, viewer: Uuid, streamer: Uuid, track: Arc<TrackLocalStaticRTP>) {
        let Some(sfu) = self.sfu().await else { return };
        let Some(peer) = sfu.peer_for(viewer).await else { return };

        match peer.add_track(streamer, TrackKind::Video, track).await {
            Ok(true) => {
                // Keyframe is requested only once this attach's renegotiation
                // completes, via `on_renegotiation_complete`.
                self.pending_keyframes.write().await.insert(viewer, streamer);
                sfu.trigger_renegotiation(viewer).await;
            }
            Ok(false) => {}
            Err(e) => tracing::warn!("failed to attach screen track to viewer {}: {}", viewer, e),
        }
    }

    async fn remove_video_track_from_viewer(self: &Arc<Self>, viewer: Uuid, streamer: Uuid) {
        let Some(sfu) = self.sfu().await else { return };
        let Some(peer) = sfu.peer_for(viewer).await else { return };
        if peer.remove_all_tracks_from(streamer).await.unwrap_or(0) > 0 {
            sfu.trigger_renegotiation(viewer).await;
        }
    }

    /// Called once the viewer's answer for the attach-triggered
    /// renegotiation lands. Looks up and clears the pending keyframe entry,
    /// then asks the streamer for a fresh one.
    pub async fn on_renegotiation_complete(self: &Arc<Self>, viewer: Uuid) {
        let Some(streamer) = self.pending_keyframes.write().await.remove(&viewer) else { return };
        let Some(sfu) = self.sfu().await else { return };
        let Some(streamer_peer) = sfu.peer_for(streamer).await else { return };
        if let Err(e) = streamer_peer.request_keyframe().await {
            tracing::warn!("failed to request keyframe from {}: {}", streamer, e);
        }
    }

    /// Called when a participant's peer is torn down: stops their own
    /// share (if any) and drops their subscription (if any).
    pub async fn remove_user(self: &Arc<Self>, user_id: Uuid) {
        if self.active_streams.read().await.contains_key(&user_id) {
            self.stop_share(user_id).await;
        }
        self.unsubscribe(user_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_without_track_is_a_no_op() {
        let manager = ScreenShareManager::new();
        let viewer = Uuid::new_v4();
        let streamer = Uuid::new_v4();
        manager.subscribe(viewer, streamer).await;
        assert!(manager.subscriptions.read().await.get(&viewer).is_none());
    }

    #[tokio::test]
    async fn start_share_registers_pending_without_track() {
        let manager = ScreenShareManager::new();
        let streamer = Uuid::new_v4();
        manager.start_share(streamer).await;
        assert!(manager.has_pending_share(streamer).await);
    }

    #[tokio::test]
    async fn stop_share_without_prior_track_does_not_panic() {
        let manager = ScreenShareManager::new();
        let streamer = Uuid::new_v4();
        manager.start_share(streamer).await;
        manager.stop_share(streamer).await;
        assert!(!manager.has_pending_share(streamer).await);
    }
}
