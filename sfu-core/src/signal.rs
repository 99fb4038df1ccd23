//! Control-channel protocol
//!
//! Every frame on the signalling WebSocket is a JSON envelope
//! `{"type": ..., "data": ...}`, nested once more for `SIGNALLING` payloads.
//! Decoding is deliberately forgiving: malformed JSON, unknown outer types
//! and unknown `SIGNALLING` sub-types are all dropped silently so a confused
//! client cannot take the session down.

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Top-level envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Envelope {
    #[serde(rename = "SIGNALLING")]
    Signalling(Signal),
    #[serde(rename = "UNKNOWN_ERROR")]
    UnknownError(UnknownError),
    #[serde(rename = "SERVER_ERROR")]
    ServerError(ServerError),
    #[serde(rename = "CLIENT_ERROR")]
    ClientError(ClientError),
}

/// `SIGNALLING` payloads, both directions.
///
/// ICE candidates travel in init-dict form (`candidate`, `sdpMid`,
/// `sdpMLineIndex`, `usernameFragment`): it is what browsers emit and what
/// `add_ice_candidate` consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Signal {
    #[serde(rename = "DESCRIPTION")]
    Description(RTCSessionDescription),
    #[serde(rename = "ICE_CANDIDATE")]
    IceCandidate(RTCIceCandidateInit),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnknownError {
    AuthenticationFailed,
}

/// Internal failures reported to the client before the session ends or, for
/// the recoverable ones, before the read loop continues.
///
/// Earlier servers also declared `INTERCEPTOR_CREATION_FAILED`; its only
/// producer was interval-PLI interceptor construction, and keyframe requests
/// are now a per-track ticker with no fallible construction step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerError {
    CodecRegistrationFailed,
    InterceptorRegistrationFailed,
    PeerConnectionCreationFailed,
    // The misspelling is the wire format; existing clients match on it.
    #[serde(rename = "TRANSCIEVER_CREATION_FAILED")]
    TransceiverCreationFailed,
    SetRemoteDescriptionFailed,
    CreateAnswerFailed,
    CreateOfferFailed,
    SetLocalDescriptionFailed,
}

/// Role violations: publishers may only send offers, subscribers only
/// answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientError {
    AnswerReceived { msg: String },
    OfferReceived { msg: String },
}

/// Decodes one control frame; anything unrecognizable yields `None`.
#[must_use]
pub fn decode(raw: &str) -> Option<Envelope> {
    serde_json::from_str(raw).ok()
}

pub fn encode(envelope: &Envelope) -> crate::Result<String> {
    Ok(serde_json::to_string(envelope)?)
}
