//! Media track kinds

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }

    /// Kind implied by a codec MIME type such as `video/VP8`
    #[must_use]
    pub fn from_mime_type(mime_type: &str) -> Option<Self> {
        let (prefix, _) = mime_type.split_once('/')?;
        prefix.parse().ok()
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            other => Err(format!("unknown media kind: {other}")),
        }
    }
}

impl TryFrom<RTPCodecType> for MediaKind {
    type Error = String;

    fn try_from(codec_type: RTPCodecType) -> Result<Self, Self::Error> {
        match codec_type {
            RTPCodecType::Audio => Ok(Self::Audio),
            RTPCodecType::Video => Ok(Self::Video),
            RTPCodecType::Unspecified => Err("unspecified codec type".to_string()),
        }
    }
}

impl From<MediaKind> for RTPCodecType {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => Self::Audio,
            MediaKind::Video => Self::Video,
        }
    }
}
