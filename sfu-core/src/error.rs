use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid track kind: {0}")]
    InvalidKind(String),
}

pub type Result<T> = std::result::Result<T, Error>;
