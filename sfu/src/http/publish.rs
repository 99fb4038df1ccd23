//! Publisher sessions
//!
//! `GET /broadcast/:id` upgrades to a WebSocket, authenticates the publisher
//! via the key handshake, and terminates a peer connection on the server.
//! Every track the publisher sends becomes a fan-out track in the registry;
//! the server accepts offers and answers them, never the other way around.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::StreamExt;
use nanoid::nanoid;
use tracing::{debug, info, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::http::{auth, AppState, Outbound};
use crate::rtc;
use sfu_core::signal::{self, ClientError, Envelope, ServerError, Signal, UnknownError};
use sfu_core::{BroadcastId, Done, TrackKind, TrackPipe};

pub async fn broadcast_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    // Signalling frames are small; the axum default limit of 64 MB is not.
    ws.max_message_size(64 * 1024)
        .on_upgrade(move |socket| handle_publisher(socket, state, BroadcastId::from(id)))
}

async fn handle_publisher(mut socket: WebSocket, state: AppState, broadcast: BroadcastId) {
    // The handshake runs on the raw socket before anything else exists.
    let key = match auth::handshake(&mut socket).await {
        Ok(auth::Outcome::Authenticated(key)) => key,
        Ok(auth::Outcome::Denied) => {
            let envelope = Envelope::UnknownError(UnknownError::AuthenticationFailed);
            if let Ok(text) = signal::encode(&envelope) {
                let _ = socket.send(Message::Text(text)).await;
            }
            return;
        }
        Err(err) => {
            debug!(%broadcast, %err, "key handshake failed");
            return;
        }
    };

    info!(%key, %broadcast, "publisher connected");

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

    // Browsers only offer video once the remote side wants some; audio rides
    // along on the client's own m-section. See DESIGN.md for why audio is not
    // pre-added here.
    let video_recv = RTCRtpTransceiverInit {
        direction: RTCRtpTransceiverDirection::Recvonly,
        send_encodings: vec![],
    };
    if let Err(err) = pc
        .add_transceiver_from_kind(RTPCodecType::Video, Some(video_recv))
        .await
    {
        warn!(%key, %broadcast, %err, "recvonly video transceiver rejected");
        outbound.send(&Envelope::ServerError(ServerError::TransceiverCreationFailed));
        if let Err(err) = pc.close().await {
            warn!(%err, "failed to close publisher peer connection");
        }
        return;
    }

    let session = state.next_session_id();

    {
        let state = state.clone();
        let key = key.clone();
        let broadcast = broadcast.clone();
        // Weak: the callback is stored on the peer connection itself.
        let pc_weak = Arc::downgrade(&pc);
        let done = done.clone();
        pc.on_track(Box::new(move |remote, _receiver, _transceiver| {
            let state = state.clone();
            let key = key.clone();
            let broadcast = broadcast.clone();
            let pc_weak = pc_weak.clone();
            let done = done.clone();
            Box::pin(async move {
                let kind = TrackKind::from(remote.kind());
                let local = Arc::new(TrackLocalStaticRTP::new(
                    remote.codec().capability,
                    nanoid!(),
                    "sfu".to_owned(),
                ));
                info!(
                    %key, %broadcast, %kind,
                    ssrc = remote.ssrc(),
                    codec = %local.codec().mime_type,
                    "publisher track up"
                );

                if kind == TrackKind::Video {
                    if let Some(pc) = pc_weak.upgrade() {
                        rtc::spawn_pli_ticker(pc, remote.ssrc(), done);
                    }
                }

                let pipe = TrackPipe::new(remote, Arc::clone(&local));
                state.pipes.insert(key.clone(), broadcast.clone(), session, pipe);
                state.registry.set_track(&key, &broadcast, local).await;
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
                debug!(%connection_state, "publisher connection state");
                if matches!(
                    connection_state,
                    RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed
                ) {
                    done.finish();
                }
            })
        }));
    }

    let mut socket_gone = false;
    loop {
        let frame = tokio::select! {
            () = done.wait() => break,
            frame = receiver.next() => frame,
        };
        let Some(Ok(frame)) = frame else {
            debug!(%key, %broadcast, "publisher control channel closed");
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
                if description.sdp_type == RTCSdpType::Answer {
                    outbound.send(&Envelope::ClientError(ClientError::AnswerReceived {
                        msg: "Received answer from client; servers can't accept answers; only offers"
                            .to_owned(),
                    }));
                    done.finish();
                    break;
                }

                if let Err(err) = pc.set_remote_description(description).await {
                    warn!(%key, %broadcast, %err, "set_remote_description failed");
                    outbound.send(&Envelope::ServerError(ServerError::SetRemoteDescriptionFailed));
                    done.finish();
                    break;
                }

                let answer = match pc.create_answer(None).await {
                    Ok(answer) => answer,
                    Err(err) => {
                        // The client may retry with a fresh offer.
                        warn!(%key, %broadcast, %err, "create_answer failed");
                        outbound.send(&Envelope::ServerError(ServerError::CreateAnswerFailed));
                        continue;
                    }
                };
                if let Err(err) = pc.set_local_description(answer.clone()).await {
                    warn!(%key, %broadcast, %err, "set_local_description failed");
                    outbound.send(&Envelope::ServerError(ServerError::SetLocalDescriptionFailed));
                    continue;
                }

                outbound.send(&Envelope::Signalling(Signal::Description(answer)));
            }
            Signal::IceCandidate(init) => {
                if let Err(err) = pc.add_ice_candidate(init).await {
                    warn!(%key, %broadcast, %err, "add_ice_candidate failed");
                }
            }
        }
    }

    // A dead control channel does not end the broadcast: the peer connection
    // and its pipes keep feeding subscribers until the connection itself goes
    // away.
    if socket_gone && !done.is_done() {
        done.wait().await;
    }

    for kind in state.pipes.remove_session(&key, &broadcast, session) {
        state.registry.remove_track(&key, &broadcast, kind).await;
    }
    if let Err(err) = pc.close().await {
        warn!(%err, "failed to close publisher peer connection");
    }

    info!(%key, %broadcast, "publisher session ended");
}
