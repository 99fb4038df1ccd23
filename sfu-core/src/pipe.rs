//! RTP pumps from remote tracks into fan-out tracks
//!
//! A [`TrackPipe`] owns one `(remote, local)` track pair and copies packets
//! between them on a dedicated task until the publisher goes away or the pipe
//! is stopped. The [`PipeStore`] is the shared index of running pipes, keyed
//! like the fan-out registry and tagged with the session that started each
//! pipe so a session can tear down exactly what it created.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

use crate::done::Done;
use crate::types::{BroadcastId, KeyId, TrackKind};

/// Scratch buffer for one RTP packet read.
const RTP_READ_BUFFER: usize = 1400;

pub struct TrackPipe {
    done: Done,
    kind: TrackKind,
}

impl TrackPipe {
    /// Starts the pump task. It exits when the remote read fails (the
    /// publisher left), when a fan-out write fails for any reason other than
    /// "no subscribers bound yet", or when [`TrackPipe::stop`] is called.
    pub fn new(remote: Arc<TrackRemote>, local: Arc<TrackLocalStaticRTP>) -> Self {
        let done = Done::new();
        let kind = TrackKind::from(remote.kind());
        let task_done = done.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; RTP_READ_BUFFER];
            while !task_done.is_done() {
                let packet = match remote.read(&mut buf).await {
                    Ok((packet, _attributes)) => packet,
                    Err(err) => {
                        debug!(%kind, %err, "remote track read ended");
                        break;
                    }
                };

                if let Err(err) = local.write_rtp(&packet).await {
                    // ErrClosedPipe means no subscriber is bound yet; packets
                    // are droppable until one attaches.
                    if matches!(err, webrtc::Error::ErrClosedPipe) {
                        continue;
                    }
                    warn!(%kind, %err, "fan-out track write failed");
                    task_done.finish();
                }
            }
            debug!(%kind, "track pipe stopped");
        });

        Self { done, kind }
    }

    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Stops the pump; the task observes the latch between iterations.
    pub fn stop(&self) {
        self.done.finish();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.done.is_done()
    }

    #[cfg(test)]
    fn stub(kind: TrackKind) -> Self {
        Self {
            done: Done::new(),
            kind,
        }
    }
}

struct OwnedPipe {
    session: u64,
    pipe: TrackPipe,
}

/// Running pipes indexed by `(key id, broadcast id, kind)`.
///
/// One slot per kind: a publisher sending a second track of a kind it already
/// publishes replaces the old one, and the superseded pipe is stopped rather
/// than left reading a dead remote track.
#[derive(Default)]
pub struct PipeStore {
    pipes: Mutex<HashMap<KeyId, HashMap<BroadcastId, HashMap<TrackKind, OwnedPipe>>>>,
}

impl PipeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: KeyId, broadcast: BroadcastId, session: u64, pipe: TrackPipe) {
        let kind = pipe.kind();
        let mut pipes = self.pipes.lock();
        let slot = pipes
            .entry(key)
            .or_default()
            .entry(broadcast)
            .or_default();
        if let Some(old) = slot.insert(kind, OwnedPipe { session, pipe }) {
            old.pipe.stop();
        }
    }

    /// Stops and removes every pipe at `(key, broadcast)` owned by `session`,
    /// returning the kinds that were removed. Pipes a newer session has since
    /// installed under the same keys are left running.
    pub fn remove_session(
        &self,
        key: &KeyId,
        broadcast: &BroadcastId,
        session: u64,
    ) -> Vec<TrackKind> {
        let mut pipes = self.pipes.lock();
        let mut removed = Vec::new();
        if let Some(broadcasts) = pipes.get_mut(key) {
            if let Some(kinds) = broadcasts.get_mut(broadcast) {
                kinds.retain(|kind, owned| {
                    if owned.session == session {
                        owned.pipe.stop();
                        removed.push(*kind);
                        false
                    } else {
                        true
                    }
                });
                if kinds.is_empty() {
                    broadcasts.remove(broadcast);
                }
            }
            if broadcasts.is_empty() {
                pipes.remove(key);
            }
        }
        removed
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pipes.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> KeyId {
        KeyId::from("alice")
    }

    fn broadcast() -> BroadcastId {
        BroadcastId::from("room1")
    }

    #[test]
    fn replacing_a_pipe_stops_the_old_one() {
        let store = PipeStore::new();
        let first = TrackPipe::stub(TrackKind::Video);
        let first_done = first.done.clone();

        store.insert(key(), broadcast(), 1, first);
        assert!(!first_done.is_done());

        store.insert(key(), broadcast(), 2, TrackPipe::stub(TrackKind::Video));
        assert!(first_done.is_done());
    }

    #[test]
    fn remove_session_only_touches_its_own_pipes() {
        let store = PipeStore::new();
        let video = TrackPipe::stub(TrackKind::Video);
        let video_done = video.done.clone();
        store.insert(key(), broadcast(), 1, video);

        let audio = TrackPipe::stub(TrackKind::Audio);
        let audio_done = audio.done.clone();
        store.insert(key(), broadcast(), 2, audio);

        let mut removed = store.remove_session(&key(), &broadcast(), 1);
        removed.sort_by_key(|kind| kind.as_str());
        assert_eq!(removed, vec![TrackKind::Video]);
        assert!(video_done.is_done());
        assert!(!audio_done.is_done());

        assert_eq!(
            store.remove_session(&key(), &broadcast(), 2),
            vec![TrackKind::Audio]
        );
        assert!(audio_done.is_done());
        assert!(store.is_empty());
    }

    #[test]
    fn remove_session_removes_every_kind_it_owns() {
        let store = PipeStore::new();
        store.insert(key(), broadcast(), 7, TrackPipe::stub(TrackKind::Video));
        store.insert(key(), broadcast(), 7, TrackPipe::stub(TrackKind::Audio));

        let mut removed = store.remove_session(&key(), &broadcast(), 7);
        removed.sort_by_key(|kind| kind.as_str());
        assert_eq!(removed, vec![TrackKind::Audio, TrackKind::Video]);
        assert!(store.is_empty());
    }

    #[test]
    fn remove_session_on_unknown_keys_is_a_noop() {
        let store = PipeStore::new();
        assert!(store.remove_session(&key(), &broadcast(), 1).is_empty());
    }
}
