//! Fan-out registry
//!
//! The only cross-session shared state in the server: a three-level index
//! from `(key id, broadcast id, kind)` to the current fan-out track and the
//! set of subscriber peer connections demanding it. Writes are serialized by
//! one writer lock, and the binder runs while that lock is held, so a
//! subscriber registered concurrently with a track change ends up bound to
//! the current track exactly once.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use crate::types::{BroadcastId, KeyId, TrackKind};

#[derive(Default)]
struct Entry {
    track: Option<Arc<TrackLocalStaticRTP>>,
    subscribers: Vec<Arc<RTCPeerConnection>>,
}

impl Entry {
    fn is_empty(&self) -> bool {
        self.track.is_none() && self.subscribers.is_empty()
    }
}

type Index = HashMap<KeyId, HashMap<BroadcastId, HashMap<TrackKind, Entry>>>;

/// Makes `pc` send `track`, replacing any existing sender of the same kind.
///
/// Idempotent: a peer connection already carrying this track (matched by the
/// fan-out track id) is left alone, so a concurrent `set_track` plus
/// `add_subscriber` can never produce two senders of one kind. Adding a track
/// to a fresh subscriber triggers renegotiation on that peer connection.
pub async fn bind_track(
    pc: &Arc<RTCPeerConnection>,
    track: &Arc<TrackLocalStaticRTP>,
) -> crate::Result<()> {
    for sender in pc.get_senders().await {
        // Senders whose track was removed stay listed until renegotiation;
        // they no longer count as carrying a kind.
        let Some(existing) = sender.track().await else {
            continue;
        };
        if existing.kind() != track.kind() {
            continue;
        }
        if existing.id() == track.id() {
            return Ok(());
        }
        sender
            .replace_track(Some(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>))
            .await?;
        return Ok(());
    }

    pc.add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
        .await?;
    Ok(())
}

#[derive(Default)]
pub struct TrackRegistry {
    index: RwLock<Index>,
}

impl TrackRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the current track at `(key, broadcast, kind)` — the kind is
    /// the track's own — and binds it to every registered subscriber. A
    /// binder failure on one subscriber does not abort the walk.
    pub async fn set_track(
        &self,
        key: &KeyId,
        broadcast: &BroadcastId,
        track: Arc<TrackLocalStaticRTP>,
    ) {
        let kind = TrackKind::from(track.kind());
        let mut index = self.index.write().await;
        let entry = index
            .entry(key.clone())
            .or_default()
            .entry(broadcast.clone())
            .or_default()
            .entry(kind)
            .or_default();
        entry.track = Some(Arc::clone(&track));

        for pc in &entry.subscribers {
            if let Err(err) = bind_track(pc, &track).await {
                warn!(%key, %broadcast, %kind, %err, "failed to bind track to subscriber");
            }
        }
    }

    /// Clears the track at `(key, broadcast, kind)` and removes the sender
    /// that carried it from every subscriber. Subscribers stay registered,
    /// waiting for a future track.
    pub async fn remove_track(&self, key: &KeyId, broadcast: &BroadcastId, kind: TrackKind) {
        let mut index = self.index.write().await;
        let Some(entry) = lookup_mut(&mut index, key, broadcast, kind) else {
            return;
        };

        if let Some(track) = entry.track.take() {
            for pc in &entry.subscribers {
                remove_sender_for(pc, track.id()).await;
            }
        }

        prune(&mut index, key, broadcast, kind);
    }

    /// Registers a subscriber peer connection. If a track is already
    /// published in this slot the subscriber is bound to it immediately; the
    /// binder's own error is the only one surfaced to the caller.
    pub async fn add_subscriber(
        &self,
        key: &KeyId,
        broadcast: &BroadcastId,
        kind: TrackKind,
        pc: &Arc<RTCPeerConnection>,
    ) -> crate::Result<()> {
        let mut index = self.index.write().await;
        let entry = index
            .entry(key.clone())
            .or_default()
            .entry(broadcast.clone())
            .or_default()
            .entry(kind)
            .or_default();

        if !entry.subscribers.iter().any(|existing| Arc::ptr_eq(existing, pc)) {
            entry.subscribers.push(Arc::clone(pc));
        }

        if let Some(track) = &entry.track {
            bind_track(pc, track).await?;
        }
        Ok(())
    }

    /// Drops a subscriber from the slot. The current track, if any, is left
    /// untouched.
    pub async fn remove_subscriber(
        &self,
        key: &KeyId,
        broadcast: &BroadcastId,
        kind: TrackKind,
        pc: &Arc<RTCPeerConnection>,
    ) {
        let mut index = self.index.write().await;
        if let Some(entry) = lookup_mut(&mut index, key, broadcast, kind) {
            entry.subscribers.retain(|existing| !Arc::ptr_eq(existing, pc));
        }
        prune(&mut index, key, broadcast, kind);
    }

    pub async fn current_track(
        &self,
        key: &KeyId,
        broadcast: &BroadcastId,
        kind: TrackKind,
    ) -> Option<Arc<TrackLocalStaticRTP>> {
        let index = self.index.read().await;
        index
            .get(key)?
            .get(broadcast)?
            .get(&kind)?
            .track
            .as_ref()
            .map(Arc::clone)
    }

    pub async fn subscriber_count(
        &self,
        key: &KeyId,
        broadcast: &BroadcastId,
        kind: TrackKind,
    ) -> usize {
        let index = self.index.read().await;
        index
            .get(key)
            .and_then(|broadcasts| broadcasts.get(broadcast))
            .and_then(|kinds| kinds.get(&kind))
            .map_or(0, |entry| entry.subscribers.len())
    }

    /// True when every entry has been pruned away.
    pub async fn is_empty(&self) -> bool {
        self.index.read().await.is_empty()
    }
}

fn lookup_mut<'a>(
    index: &'a mut Index,
    key: &KeyId,
    broadcast: &BroadcastId,
    kind: TrackKind,
) -> Option<&'a mut Entry> {
    index
        .get_mut(key)?
        .get_mut(broadcast)?
        .get_mut(&kind)
}

/// Drops the entry if it holds neither track nor subscribers, then any empty
/// intermediate maps above it. Hygiene only; a track-less entry with
/// subscribers is a normal state.
fn prune(index: &mut Index, key: &KeyId, broadcast: &BroadcastId, kind: TrackKind) {
    let Some(broadcasts) = index.get_mut(key) else {
        return;
    };
    if let Some(kinds) = broadcasts.get_mut(broadcast) {
        if kinds.get(&kind).is_some_and(Entry::is_empty) {
            kinds.remove(&kind);
        }
        if kinds.is_empty() {
            broadcasts.remove(broadcast);
        }
    }
    if broadcasts.is_empty() {
        index.remove(key);
    }
}

/// Removes the RTP sender carrying the fan-out track `track_id` from `pc`.
async fn remove_sender_for(pc: &Arc<RTCPeerConnection>, track_id: &str) {
    for sender in pc.get_senders().await {
        let carries = sender
            .track()
            .await
            .is_some_and(|track| track.id() == track_id);
        if carries {
            if let Err(err) = pc.remove_track(&sender).await {
                warn!(%err, "failed to remove sender from subscriber");
            } else {
                debug!(track_id, "removed sender from subscriber");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanoid::nanoid;
    use webrtc::api::interceptor_registry::register_default_interceptors;
    use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
    use webrtc::api::APIBuilder;
    use webrtc::interceptor::registry::Registry;
    use webrtc::peer_connection::configuration::RTCConfiguration;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    async fn peer_connection() -> Arc<RTCPeerConnection> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().unwrap();
        let registry = register_default_interceptors(Registry::new(), &mut media_engine).unwrap();
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        )
    }

    fn track(mime_type: &str) -> Arc<TrackLocalStaticRTP> {
        Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            nanoid!(),
            "sfu".to_owned(),
        ))
    }

    fn video_track() -> Arc<TrackLocalStaticRTP> {
        track(MIME_TYPE_VP8)
    }

    async fn senders_of_kind(pc: &Arc<RTCPeerConnection>, kind: TrackKind) -> Vec<String> {
        let mut ids = Vec::new();
        for sender in pc.get_senders().await {
            if let Some(track) = sender.track().await {
                if TrackKind::from(track.kind()) == kind {
                    ids.push(track.id().to_owned());
                }
            }
        }
        ids
    }

    fn key() -> KeyId {
        KeyId::from("alice")
    }

    fn broadcast() -> BroadcastId {
        BroadcastId::from("room1")
    }

    #[tokio::test]
    async fn late_subscriber_receives_stored_track() {
        let registry = TrackRegistry::new();
        let track = video_track();
        registry.set_track(&key(), &broadcast(), Arc::clone(&track)).await;

        let pc = peer_connection().await;
        registry
            .add_subscriber(&key(), &broadcast(), TrackKind::Video, &pc)
            .await
            .unwrap();

        assert_eq!(senders_of_kind(&pc, TrackKind::Video).await, vec![track.id().to_owned()]);
        assert!(registry
            .current_track(&key(), &broadcast(), TrackKind::Video)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn early_subscriber_is_bound_when_track_arrives() {
        let registry = TrackRegistry::new();
        let pc = peer_connection().await;
        registry
            .add_subscriber(&key(), &broadcast(), TrackKind::Video, &pc)
            .await
            .unwrap();
        assert!(senders_of_kind(&pc, TrackKind::Video).await.is_empty());

        let track = video_track();
        registry.set_track(&key(), &broadcast(), Arc::clone(&track)).await;
        assert_eq!(senders_of_kind(&pc, TrackKind::Video).await, vec![track.id().to_owned()]);
    }

    #[tokio::test]
    async fn setting_the_same_track_twice_adds_no_sender() {
        let registry = TrackRegistry::new();
        let pc = peer_connection().await;
        registry
            .add_subscriber(&key(), &broadcast(), TrackKind::Video, &pc)
            .await
            .unwrap();

        let track = video_track();
        registry.set_track(&key(), &broadcast(), Arc::clone(&track)).await;
        registry.set_track(&key(), &broadcast(), Arc::clone(&track)).await;

        assert_eq!(senders_of_kind(&pc, TrackKind::Video).await.len(), 1);
    }

    #[tokio::test]
    async fn replacement_track_reuses_the_sender() {
        let registry = TrackRegistry::new();
        let pc = peer_connection().await;
        registry
            .add_subscriber(&key(), &broadcast(), TrackKind::Video, &pc)
            .await
            .unwrap();

        let first = video_track();
        let second = video_track();
        registry.set_track(&key(), &broadcast(), first).await;
        registry.set_track(&key(), &broadcast(), Arc::clone(&second)).await;

        assert_eq!(senders_of_kind(&pc, TrackKind::Video).await, vec![second.id().to_owned()]);
    }

    #[tokio::test]
    async fn kinds_are_independent_slots() {
        let registry = TrackRegistry::new();
        let pc = peer_connection().await;
        registry
            .add_subscriber(&key(), &broadcast(), TrackKind::Video, &pc)
            .await
            .unwrap();

        registry.set_track(&key(), &broadcast(), track(MIME_TYPE_OPUS)).await;

        // The audio track landed in its own slot; our video subscriber has no
        // sender yet.
        assert!(senders_of_kind(&pc, TrackKind::Video).await.is_empty());
        assert_eq!(
            registry.subscriber_count(&key(), &broadcast(), TrackKind::Audio).await,
            0
        );
    }

    #[tokio::test]
    async fn removing_the_track_keeps_the_subscriber_registered() {
        let registry = TrackRegistry::new();
        let pc = peer_connection().await;
        registry.set_track(&key(), &broadcast(), video_track()).await;
        registry
            .add_subscriber(&key(), &broadcast(), TrackKind::Video, &pc)
            .await
            .unwrap();
        assert_eq!(senders_of_kind(&pc, TrackKind::Video).await.len(), 1);

        registry.remove_track(&key(), &broadcast(), TrackKind::Video).await;

        assert!(senders_of_kind(&pc, TrackKind::Video).await.is_empty());
        assert_eq!(
            registry.subscriber_count(&key(), &broadcast(), TrackKind::Video).await,
            1
        );
        assert!(registry
            .current_track(&key(), &broadcast(), TrackKind::Video)
            .await
            .is_none());

        // A replacement publisher rebinds the surviving subscriber.
        let replacement = video_track();
        registry.set_track(&key(), &broadcast(), Arc::clone(&replacement)).await;
        assert_eq!(
            senders_of_kind(&pc, TrackKind::Video).await,
            vec![replacement.id().to_owned()]
        );
    }

    #[tokio::test]
    async fn add_then_remove_subscriber_leaves_registry_unchanged() {
        let registry = TrackRegistry::new();
        let pc = peer_connection().await;
        registry
            .add_subscriber(&key(), &broadcast(), TrackKind::Audio, &pc)
            .await
            .unwrap();
        registry
            .remove_subscriber(&key(), &broadcast(), TrackKind::Audio, &pc)
            .await;

        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn duplicate_registration_is_refused() {
        let registry = TrackRegistry::new();
        let pc = peer_connection().await;
        registry
            .add_subscriber(&key(), &broadcast(), TrackKind::Video, &pc)
            .await
            .unwrap();
        registry
            .add_subscriber(&key(), &broadcast(), TrackKind::Video, &pc)
            .await
            .unwrap();

        assert_eq!(
            registry.subscriber_count(&key(), &broadcast(), TrackKind::Video).await,
            1
        );
    }

    #[tokio::test]
    async fn bind_track_is_idempotent() {
        let pc = peer_connection().await;
        let track = video_track();
        bind_track(&pc, &track).await.unwrap();
        bind_track(&pc, &track).await.unwrap();

        assert_eq!(senders_of_kind(&pc, TrackKind::Video).await.len(), 1);
    }

    #[tokio::test]
    async fn remove_track_prunes_an_empty_entry() {
        let registry = TrackRegistry::new();
        registry.set_track(&key(), &broadcast(), video_track()).await;
        registry.remove_track(&key(), &broadcast(), TrackKind::Video).await;
        assert!(registry.is_empty().await);
    }
}
