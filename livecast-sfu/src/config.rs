//! SFU Configuration

use crate::track::MediaKind;
use serde::{Deserialize, Serialize};

/// A codec the router accepts from producers and offers to consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodecConfig {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
}

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Local address the media engine binds transports to
    pub listen_ip: String,
    /// Public address advertised in ICE candidates (defaults to `listen_ip`)
    pub announced_ip: Option<String>,
    /// Lowest UDP port handed out for transports
    pub rtc_min_port: u16,
    /// Highest UDP port handed out for transports
    pub rtc_max_port: u16,
    /// Maximum number of concurrent stream sessions (0 = unlimited)
    pub max_streams: usize,
    /// Maximum transports a single connection may hold (0 = unlimited)
    pub max_transports_per_connection: usize,
    /// Router codec capabilities
    pub media_codecs: Vec<CodecConfig>,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: None,
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            max_streams: 0,
            max_transports_per_connection: 8,
            media_codecs: vec![
                CodecConfig {
                    kind: MediaKind::Audio,
                    mime_type: "audio/opus".to_string(),
                    clock_rate: 48000,
                    channels: Some(2),
                },
                CodecConfig {
                    kind: MediaKind::Video,
                    mime_type: "video/VP8".to_string(),
                    clock_rate: 90000,
                    channels: None,
                },
                CodecConfig {
                    kind: MediaKind::Video,
                    mime_type: "video/H264".to_string(),
                    clock_rate: 90000,
                    channels: None,
                },
            ],
        }
    }
}

impl SfuConfig {
    /// Address put into ICE candidates
    #[must_use]
    pub fn advertised_ip(&self) -> &str {
        self.announced_ip.as_deref().unwrap_or(&self.listen_ip)
    }

    /// Collect configuration problems
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.rtc_min_port > self.rtc_max_port {
            errors.push(format!(
                "media.rtc_min_port ({}) must not exceed media.rtc_max_port ({})",
                self.rtc_min_port, self.rtc_max_port
            ));
        }
        if self.media_codecs.is_empty() {
            errors.push("media.media_codecs must list at least one codec".to_string());
        }
        for codec in &self.media_codecs {
            if MediaKind::from_mime_type(&codec.mime_type) != Some(codec.kind) {
                errors.push(format!(
                    "codec {} does not match declared kind {}",
                    codec.mime_type, codec.kind
                ));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SfuConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.advertised_ip(), "0.0.0.0");
    }

    #[test]
    fn test_validate_rejects_bad_ports_and_codecs() {
        let config = SfuConfig {
            rtc_min_port: 5000,
            rtc_max_port: 4000,
            media_codecs: vec![CodecConfig {
                kind: MediaKind::Audio,
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: None,
            }],
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }
}
