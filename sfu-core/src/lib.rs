//! SFU fan-out plane
//!
//! This crate implements the data structures behind a Selective Forwarding
//! Unit: published tracks are indexed by `(key id, broadcast id, kind)` and
//! fanned out to every subscriber peer connection currently asking for that
//! slot. Nothing here decodes or mixes media; RTP packets are relayed as-is.
//!
//! ## Architecture
//!
//! - [`TrackRegistry`]: the shared three-level index coupling each published
//!   track to its subscriber peer connections
//! - [`TrackPipe`] / [`PipeStore`]: per-track pumps copying RTP from a remote
//!   track into its fan-out track, owned by publisher sessions
//! - [`Done`]: one-shot completion latch coordinating session tasks with
//!   engine callbacks
//! - [`signal`]: the JSON envelope protocol spoken on the control WebSocket

pub mod config;
pub mod done;
pub mod error;
pub mod logging;
pub mod pipe;
pub mod registry;
pub mod signal;
pub mod types;

pub use config::Config;
pub use done::Done;
pub use error::{Error, Result};
pub use pipe::{PipeStore, TrackPipe};
pub use registry::{bind_track, TrackRegistry};
pub use types::{BroadcastId, KeyId, TrackKind};
