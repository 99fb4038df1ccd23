//! Identifier types shared across the fan-out plane

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use crate::error::Error;

/// Publisher identity proven by the key handshake. Opaque, compared by bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyId(String);

impl KeyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for KeyId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for KeyId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Publisher-chosen stream name under a key id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BroadcastId(String);

impl BroadcastId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BroadcastId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for BroadcastId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for BroadcastId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Media track kind. Partitions streams within one `(KeyId, BroadcastId)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<RTPCodecType> for TrackKind {
    fn from(codec_type: RTPCodecType) -> Self {
        match codec_type {
            RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

impl FromStr for TrackKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            other => Err(Error::InvalidKind(other.to_string())),
        }
    }
}
