//! Stream allocation seam
//!
//! The subscriber transport coordinates an external stream allocator that
//! decides which simulcast layers fit the estimated downlink. Allocation
//! policy lives outside this crate; the transport only wires lifecycle,
//! track membership, the bandwidth estimator, and state-change reporting.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::congestion::BandwidthEstimator;
use crate::types::{ParticipantId, TrackId};

/// Forwarding state of one subscribed stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Active,
    Paused,
}

/// One subscribed stream's state at report time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStateInfo {
    pub publisher_id: ParticipantId,
    pub track_id: TrackId,
    pub state: StreamState,
}

/// Batched allocator report delivered to the session layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamStateUpdate {
    pub stream_states: Vec<StreamStateInfo>,
}

/// A track handed to the allocator when a subscription starts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddTrackParams {
    pub track_id: TrackId,
    pub publisher_id: ParticipantId,
    pub is_simulcast: bool,
}

pub type OnStreamStateChange = Box<dyn Fn(StreamStateUpdate) + Send + Sync>;

/// Capability consumed from the media-forwarding layer
pub trait StreamAllocator: Send + Sync {
    fn start(&self);

    fn stop(&self);

    /// Handed exactly once per peer-connection, after which the allocator is
    /// the estimator's single reader.
    fn set_bandwidth_estimator(&self, estimator: Arc<dyn BandwidthEstimator>);

    fn add_track(&self, params: AddTrackParams);

    fn remove_track(&self, track_id: &TrackId);

    fn on_stream_state_change(&self, f: OnStreamStateChange);
}
