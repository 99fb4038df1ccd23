//! Peer-connection construction shared by both session types

use std::sync::Arc;

use thiserror::Error;
use tokio::time::{interval, Duration};
use tracing::debug;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;

use sfu_core::config::WebRtcConfig;
use sfu_core::signal::ServerError;
use sfu_core::Done;

/// Interval between keyframe requests for a published video track.
const PLI_INTERVAL: Duration = Duration::from_secs(3);

/// Construction failure, mapped onto the wire error it is reported as.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("codec registration failed: {0}")]
    Codec(webrtc::Error),
    #[error("interceptor registration failed: {0}")]
    Interceptor(webrtc::Error),
    #[error("peer connection creation failed: {0}")]
    PeerConnection(webrtc::Error),
}

impl SetupError {
    pub const fn as_server_error(&self) -> ServerError {
        match self {
            Self::Codec(_) => ServerError::CodecRegistrationFailed,
            Self::Interceptor(_) => ServerError::InterceptorRegistrationFailed,
            Self::PeerConnection(_) => ServerError::PeerConnectionCreationFailed,
        }
    }
}

/// Builds a peer connection with default codecs, the default interceptor set
/// and the configured ICE servers.
pub async fn create_peer_connection(
    config: &WebRtcConfig,
) -> Result<Arc<RTCPeerConnection>, SetupError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(SetupError::Codec)?;

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(SetupError::Interceptor)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let rtc_config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: config.stun_servers.clone(),
            ..Default::default()
        }],
        ..Default::default()
    };

    let pc = api
        .new_peer_connection(rtc_config)
        .await
        .map_err(SetupError::PeerConnection)?;
    Ok(Arc::new(pc))
}

/// Periodically asks the publisher for a keyframe so late subscribers do not
/// stare at a black frame until the next natural one. The ticker stops with
/// the session latch or on the first RTCP write failure.
pub fn spawn_pli_ticker(pc: Arc<RTCPeerConnection>, media_ssrc: u32, done: Done) {
    tokio::spawn(async move {
        let mut ticker = interval(PLI_INTERVAL);
        loop {
            ticker.tick().await;
            if done.is_done() {
                break;
            }
            let pli = PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            };
            if let Err(err) = pc.write_rtcp(&[Box::new(pli)]).await {
                debug!(%err, "keyframe request failed, stopping ticker");
                break;
            }
        }
    });
}
