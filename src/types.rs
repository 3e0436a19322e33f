//! Common types used throughout the transport core

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a participant
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a federated server node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a media track
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackId(String);

impl TrackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TrackId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TrackId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Which of the peer's two peer-connections a transport drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalTarget {
    /// Client publishes media to the server
    Publisher,
    /// Server sends subscribed media down to the client
    Subscriber,
}

impl SignalTarget {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publisher => "publisher",
            Self::Subscriber => "subscriber",
        }
    }
}

impl fmt::Display for SignalTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client signalling protocol version
///
/// Old clients cannot handle an ICE-lite agent, so the builder keeps full ICE
/// for anything below [`ProtocolVersion::MIN_ICE_LITE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolVersion(pub u8);

impl ProtocolVersion {
    pub const MIN_ICE_LITE: Self = Self(4);

    #[must_use]
    pub fn supports_ice_lite(&self) -> bool {
        *self >= Self::MIN_ICE_LITE
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::MIN_ICE_LITE
    }
}

/// Simulcast video quality, lowest to highest
///
/// `Off` is a sentinel meaning "not subscribed"; aggregation maps never store
/// it (see [`crate::quality`]).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum VideoQuality {
    #[default]
    Off,
    Low,
    Medium,
    High,
}

impl VideoQuality {
    #[must_use]
    pub fn is_off(&self) -> bool {
        *self == Self::Off
    }
}

impl fmt::Display for VideoQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Off => "off",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

/// Hint describing an announced simulcast layer, keyed by SSRC
///
/// Used to re-associate RTP streams that arrive before (or without) their
/// signalled MID/RID header extensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulcastTrackInfo {
    pub mid: String,
    pub rid: String,
}

/// SSRC-keyed simulcast hints handed to the peer-connection builder
pub type SimulcastTracks = HashMap<u32, SimulcastTrackInfo>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_ordering() {
        assert!(VideoQuality::Off < VideoQuality::Low);
        assert!(VideoQuality::Low < VideoQuality::Medium);
        assert!(VideoQuality::Medium < VideoQuality::High);
    }

    #[test]
    fn protocol_version_gates_ice_lite() {
        assert!(!ProtocolVersion(3).supports_ice_lite());
        assert!(ProtocolVersion(4).supports_ice_lite());
        assert!(ProtocolVersion(9).supports_ice_lite());
    }
}
