//! Transport configuration

use serde::{Deserialize, Serialize};
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::sdp::extmap::{AUDIO_LEVEL_URI, SDES_MID_URI, SDES_RTP_STREAM_ID_URI, TRANSPORT_CC_URI};

/// A codec enabled for a peer, as negotiated by the session layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecSpec {
    pub mime_type: String,
    pub clock_rate: u32,
    /// 0 for video
    pub channels: u16,
    pub fmtp_line: String,
    pub payload_type: u8,
}

impl CodecSpec {
    #[must_use]
    pub fn opus() -> Self {
        Self {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            payload_type: 111,
        }
    }

    #[must_use]
    pub fn vp8() -> Self {
        Self {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            channels: 0,
            fmtp_line: String::new(),
            payload_type: 96,
        }
    }

    #[must_use]
    pub fn h264() -> Self {
        Self {
            mime_type: MIME_TYPE_H264.to_owned(),
            clock_rate: 90000,
            channels: 0,
            fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                .to_owned(),
            payload_type: 102,
        }
    }

    #[must_use]
    pub fn is_audio(&self) -> bool {
        self.mime_type.to_lowercase().starts_with("audio/")
    }
}

/// RTP header extensions offered for one media kind
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RtpHeaderExtensionConfig {
    pub audio: Vec<String>,
    pub video: Vec<String>,
}

impl RtpHeaderExtensionConfig {
    /// True if any kind advertises transport-wide congestion control
    #[must_use]
    pub fn has_transport_cc(&self) -> bool {
        self.audio.iter().chain(self.video.iter()).any(|uri| uri == TRANSPORT_CC_URI)
    }
}

/// Per-direction media configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectionConfig {
    pub rtp_header_extension: RtpHeaderExtensionConfig,
}

impl DirectionConfig {
    #[must_use]
    pub fn default_publisher() -> Self {
        Self {
            rtp_header_extension: RtpHeaderExtensionConfig {
                audio: vec![AUDIO_LEVEL_URI.to_owned()],
                video: vec![SDES_MID_URI.to_owned(), SDES_RTP_STREAM_ID_URI.to_owned()],
            },
        }
    }

    #[must_use]
    pub fn default_subscriber() -> Self {
        Self {
            rtp_header_extension: RtpHeaderExtensionConfig {
                audio: vec![TRANSPORT_CC_URI.to_owned()],
                video: vec![TRANSPORT_CC_URI.to_owned()],
            },
        }
    }
}

/// Send-side congestion control tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CongestionControlConfig {
    pub enabled: bool,
    /// Starting estimate before any feedback arrives (bps)
    pub initial_bitrate: u64,
    pub min_bitrate: u64,
    pub max_bitrate: u64,
}

impl Default for CongestionControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_bitrate: 1_000_000,
            min_bitrate: 100_000,
            max_bitrate: 10_000_000,
        }
    }
}

/// Full RTC configuration shared by every transport of a server instance
#[derive(Clone)]
pub struct RtcConfig {
    /// Passed through to the peer-connection untouched
    pub configuration: RTCConfiguration,
    /// Answer as an ICE-lite agent when the client protocol allows it
    pub ice_lite: bool,
    pub publisher: DirectionConfig,
    pub subscriber: DirectionConfig,
    pub congestion_control: CongestionControlConfig,
}

impl std::fmt::Debug for RtcConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcConfig")
            .field("configuration", &"<RTCConfiguration>")
            .field("ice_lite", &self.ice_lite)
            .field("publisher", &self.publisher)
            .field("subscriber", &self.subscriber)
            .field("congestion_control", &self.congestion_control)
            .finish()
    }
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            configuration: RTCConfiguration::default(),
            ice_lite: true,
            publisher: DirectionConfig::default_publisher(),
            subscriber: DirectionConfig::default_subscriber(),
            congestion_control: CongestionControlConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriber_defaults_advertise_transport_cc() {
        let config = RtcConfig::default();
        assert!(config.subscriber.rtp_header_extension.has_transport_cc());
        assert!(!config.publisher.rtp_header_extension.has_transport_cc());
    }
}
