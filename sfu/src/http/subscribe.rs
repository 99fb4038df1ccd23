//! Subscriber sessions
//!
//! `GET /get?keyid=…&id=…&kind=…` upgrades to a WebSocket and registers a
//! peer connection for one fan-out slot. No authentication: whatever track
//! currently sits at the slot (or arrives later) is attached, and the server
//! drives negotiation — it sends offers and accepts only answers, the mirror
//! image of the publisher side.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use tracing::{debug, info, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;

use crate::http::{parse_query, AppState, Outbound};
use crate::rtc;
use sfu_core::signal::{self, ClientError, Envelope, ServerError, Signal};
use sfu_core::{BroadcastId, Done, KeyId, TrackKind};

pub async fn subscribe_handler(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let params = parse_query(query.as_deref().unwrap_or_default());

    let Some(key) = params.get("keyid") else {
        return (StatusCode::BAD_REQUEST, "Missing key ID").into_response();
    };
    let Some(id) = params.get("id") else {
        return (StatusCode::BAD_REQUEST, "Missing ID").into_response();
    };
    let Some(kind) = params.get("kind") else {
        return (StatusCode::BAD_REQUEST, "Missing kind").into_response();
    };
    let Ok(kind) = kind.parse::<TrackKind>() else {
        return (StatusCode::BAD_REQUEST, "Invalid kind").into_response();
    };

    let key = KeyId::from(key.as_str());
    let broadcast = BroadcastId::from(id.as_str());

    match ws {
        // Signalling frames are small; the axum default limit of 64 MB is not.
        Some(ws) => ws
            .max_message_size(64 * 1024)
            .on_upgrade(move |socket| handle_subscriber(socket, state, key, broadcast, kind))
            .into_response(),
        None => StatusCode::UPGRADE_REQUIRED.into_response(),
    }
}

async fn handle_subscriber(
    socket: WebSocket,
    state: AppState,
    key: KeyId,
    broadcast: BroadcastId,
    kind: TrackKind,
) {
    info!(%key, %broadcast, %kind, "subscriber connected");

    let done = Done::new();
    let (sink, mut receiver) = socket.split();
    let outbound = Outbound::new(sink, done.clone());

    let pc = match rtc::create_peer_connection(&state.webrtc).await {
        Ok(pc) => pc,
        Err(err) => {
            warn!(%key, %broadcast, %err, "peer connection setup failed");
            outbound.send(&Envelope::ServerError(err.as_server_error()));
            return;
        }
    };

    // The registry re-fires this every time it adds, replaces or removes our
    // sender, so a single session sees many offer/answer cycles.
    {
        // Weak: the callback is stored on the peer connection itself.
        let pc_weak = Arc::downgrade(&pc);
        let outbound = outbound.clone();
        let done = done.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let pc_weak = pc_weak.clone();
            let outbound = outbound.clone();
            let done = done.clone();
            Box::pin(async move {
                let Some(pc) = pc_weak.upgrade() else {
                    return;
                };
                if done.is_done() {
                    return;
                }
                let offer = match pc.create_offer(None).await {
                    Ok(offer) => offer,
                    Err(err) => {
                        warn!(%err, "create_offer failed");
                        outbound.send(&Envelope::ServerError(ServerError::CreateOfferFailed));
                        done.finish();
                        return;
                    }
                };
                if let Err(err) = pc.set_local_description(offer.clone()).await {
                    warn!(%err, "set_local_description failed");
                    done.finish();
                    return;
                }
                outbound.send(&Envelope::Signalling(Signal::Description(offer)));
            })
        }));
    }

    {
        let outbound = outbound.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let outbound = outbound.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        outbound.send(&Envelope::Signalling(Signal::IceCandidate(init)));
                    }
                    Err(err) => debug!(%err, "ICE candidate serialization failed"),
                }
            })
        }));
    }

    {
        let done = done.clone();
        pc.on_peer_connection_state_change(Box::new(move |connection_state| {
            let done = done.clone();
            Box::pin(async move {
                debug!(%connection_state, "subscriber connection state");
                if matches!(
                    connection_state,
                    RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed
                ) {
                    done.finish();
                }
            })
        }));
    }

    // Registration binds the current track immediately when one exists, which
    // in turn triggers the first negotiation.
    if let Err(err) = state.registry.add_subscriber(&key, &broadcast, kind, &pc).await {
        warn!(%key, %broadcast, %kind, %err, "failed to bind current track");
    }

    let mut socket_gone = false;
    loop {
        let frame = tokio::select! {
            () = done.wait() => break,
            frame = receiver.next() => frame,
        };
        let Some(Ok(frame)) = frame else {
            debug!(%key, %broadcast, %kind, "subscriber control channel closed");
            socket_gone = true;
            break;
        };
        let Message::Text(text) = frame else {
            continue;
        };
        let Some(Envelope::Signalling(message)) = signal::decode(&text) else {
            continue;
        };

        match message {
            Signal::Description(description) => {
                if description.sdp_type == RTCSdpType::Offer {
                    outbound.send(&Envelope::ClientError(ClientError::OfferReceived {
                        msg: "Received offer from client; server can't accept offers; only answers"
                            .to_owned(),
                    }));
                    done.finish();
                    break;
                }

                if let Err(err) = pc.set_remote_description(description).await {
                    warn!(%key, %broadcast, %kind, %err, "set_remote_description failed");
                    outbound.send(&Envelope::ServerError(ServerError::SetRemoteDescriptionFailed));
                    done.finish();
                    break;
                }
            }
            Signal::IceCandidate(init) => {
                if let Err(err) = pc.add_ice_candidate(init).await {
                    warn!(%key, %broadcast, %kind, %err, "add_ice_candidate failed");
                }
            }
        }
    }

    // Media keeps flowing to a subscriber whose control channel died, for as
    // long as its peer connection stays up.
    if socket_gone && !done.is_done() {
        done.wait().await;
    }

    // Unregister before closing so the registry never binds a closed peer
    // connection.
    state.registry.remove_subscriber(&key, &broadcast, kind, &pc).await;
    if let Err(err) = pc.close().await {
        warn!(%err, "failed to close subscriber peer connection");
    }

    info!(%key, %broadcast, %kind, "subscriber session ended");
}
