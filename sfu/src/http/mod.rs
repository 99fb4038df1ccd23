//! HTTP/WebSocket layer: router, shared state and the per-session outbound
//! write channel.

pub mod auth;
pub mod publish;
pub mod subscribe;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::routing::get;
use axum::Router;
use futures::stream::SplitSink;
use futures::SinkExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use sfu_core::config::WebRtcConfig;
use sfu_core::signal::{self, Envelope};
use sfu_core::{Done, PipeStore, TrackRegistry};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<TrackRegistry>,
    pub pipes: Arc<PipeStore>,
    pub webrtc: Arc<WebRtcConfig>,
    next_session: Arc<AtomicU64>,
}

impl AppState {
    #[must_use]
    pub fn new(webrtc: WebRtcConfig) -> Self {
        Self {
            registry: Arc::new(TrackRegistry::new()),
            pipes: Arc::new(PipeStore::new()),
            webrtc: Arc::new(webrtc),
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn next_session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/broadcast/:id", get(publish::broadcast_handler))
        .route("/get", get(subscribe::subscribe_handler))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> &'static str {
    "OK"
}

/// Splits a raw query string on `&`, then each pair on its first `=`.
/// Pairs without an `=` are dropped.
#[must_use]
pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Serializes all writes to one control WebSocket.
///
/// The session read loop, the ICE callback and (for subscribers) the
/// negotiation callback all write through this queue; a dedicated task owns
/// the sink half. A failed sink write fires the session latch, and once the
/// latch has fired every further send is a no-op.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<String>,
    done: Done,
}

impl Outbound {
    pub fn new(mut sink: SplitSink<WebSocket, Message>, done: Done) -> Self {
        let (tx, mut rx) = mpsc::channel::<String>(64);
        let writer_done = done.clone();
        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(err) = sink.send(Message::Text(text)).await {
                    debug!(%err, "websocket send failed");
                    writer_done.finish();
                    break;
                }
            }
        });
        Self { tx, done }
    }

    /// Queues one envelope; returns whether it was accepted.
    pub fn send(&self, envelope: &Envelope) -> bool {
        if self.done.is_done() {
            return false;
        }
        let Ok(text) = signal::encode(envelope) else {
            return false;
        };
        match self.tx.try_send(text) {
            Ok(()) => true,
            Err(TrySendError::Closed(_)) => {
                self.done.finish();
                false
            }
            Err(TrySendError::Full(_)) => {
                warn!("control channel congested, dropping message");
                false
            }
        }
    }
}
