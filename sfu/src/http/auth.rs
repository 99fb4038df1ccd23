//! Key-based WebSocket authentication
//!
//! Before any signalling happens the publisher proves possession of the
//! private half of the key its key id names:
//!
//! 1. client → `CLAIM` with `keyId = "ed25519$<base64 raw public key>"`
//! 2. server → `CHALLENGE` with 32 random bytes, base64-encoded
//! 3. client → `CHALLENGE_RESPONSE` with a base64 signature over the raw
//!    payload bytes
//! 4. server → `AUTHENTICATED` or `UNAUTHENTICATED`
//!
//! The rest of the server only depends on the outcome: authenticated or not,
//! and which key id was proven.

use axum::extract::ws::{Message, WebSocket};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use sfu_core::KeyId;

const KEY_SCHEME: &str = "ed25519";
const CHALLENGE_LEN: usize = 32;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum HandshakeMessage {
    #[serde(rename = "CLAIM")]
    Claim {
        #[serde(rename = "keyId")]
        key_id: String,
    },
    #[serde(rename = "CHALLENGE")]
    Challenge { payload: String },
    #[serde(rename = "CHALLENGE_RESPONSE")]
    ChallengeResponse { signature: String },
    #[serde(rename = "AUTHENTICATED")]
    Authenticated {},
    #[serde(rename = "UNAUTHENTICATED")]
    Unauthenticated {},
}

pub enum Outcome {
    Authenticated(KeyId),
    Denied,
}

/// Runs the handshake on the freshly upgraded socket. Transport failures are
/// errors; a client that fails the protocol or the signature check is
/// `Denied` after being told so.
pub async fn handshake(socket: &mut WebSocket) -> anyhow::Result<Outcome> {
    let Some(HandshakeMessage::Claim { key_id }) = recv(socket).await? else {
        return deny(socket).await;
    };
    let Some(verifying_key) = parse_key_id(&key_id) else {
        return deny(socket).await;
    };

    let mut payload = [0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut payload);
    send(
        socket,
        &HandshakeMessage::Challenge {
            payload: BASE64.encode(payload),
        },
    )
    .await?;

    let Some(HandshakeMessage::ChallengeResponse { signature }) = recv(socket).await? else {
        return deny(socket).await;
    };
    if !verify_signature(&verifying_key, &payload, &signature) {
        return deny(socket).await;
    }

    send(socket, &HandshakeMessage::Authenticated {}).await?;
    Ok(Outcome::Authenticated(KeyId::from(key_id)))
}

async fn deny(socket: &mut WebSocket) -> anyhow::Result<Outcome> {
    send(socket, &HandshakeMessage::Unauthenticated {}).await?;
    Ok(Outcome::Denied)
}

async fn recv(socket: &mut WebSocket) -> anyhow::Result<Option<HandshakeMessage>> {
    loop {
        let Some(frame) = socket.recv().await else {
            anyhow::bail!("websocket closed during key handshake");
        };
        match frame? {
            Message::Text(text) => return Ok(serde_json::from_str(&text).ok()),
            Message::Close(_) => anyhow::bail!("websocket closed during key handshake"),
            // Pings and pongs are handled by the transport.
            _ => {}
        }
    }
}

async fn send(socket: &mut WebSocket, message: &HandshakeMessage) -> anyhow::Result<()> {
    let text = serde_json::to_string(message)?;
    socket.send(Message::Text(text)).await?;
    Ok(())
}

fn parse_key_id(key_id: &str) -> Option<VerifyingKey> {
    let (scheme, encoded) = key_id.split_once('$')?;
    if scheme != KEY_SCHEME {
        return None;
    }
    let bytes: [u8; 32] = BASE64.decode(encoded).ok()?.try_into().ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}

fn verify_signature(key: &VerifyingKey, payload: &[u8], signature: &str) -> bool {
    let Ok(bytes) = BASE64.decode(signature) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&bytes) else {
        return false;
    };
    key.verify(payload, &signature).is_ok()
}
