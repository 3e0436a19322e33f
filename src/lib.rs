//! Confer per-peer transport negotiation core
//!
//! Each conference participant owns two peer-connections: one publishing
//! media up to the SFU and one receiving subscribed media down from it. This
//! crate drives both through negotiation, recovery, and migration:
//!
//! - **`Transport`**: one peer-connection plus the offer/answer state
//!   machine, ICE-restart recovery, candidate buffering, and negotiation
//!   failure detection
//! - **`QualityAggregator`**: folds per-subscriber and per-node desired
//!   qualities into one max subscribed quality per video track
//! - **`PeerSession`**: the capability seam over the WebRTC stack; the
//!   production adapter wraps the stack's peer-connection
//! - **`StreamAllocator`**: the seam toward the media-forwarding layer's
//!   layer-selection machinery
//!
//! ## Usage
//!
//! ```rust,ignore
//! use confer_rtc::{RtcConfig, SignalTarget, Transport, TransportParams};
//!
//! let transport = Transport::new(TransportParams {
//!     participant_id: "participant".into(),
//!     protocol_version: Default::default(),
//!     target: SignalTarget::Subscriber,
//!     config: config.clone(),
//!     enabled_codecs: codecs,
//!     sim_tracks: Default::default(),
//!     stream_allocator: Some(allocator),
//! })
//! .await?;
//!
//! transport.on_offer(Arc::new(move |offer| signal.send_offer(offer)));
//! transport.negotiate(false).await;
//! ```

mod allocator;
mod builder;
mod config;
mod congestion;
mod error;
mod metrics;
mod migration;
mod quality;
mod sdp;
mod session;
mod simulcast;
mod transport;
mod types;

pub use allocator::{
    AddTrackParams, OnStreamStateChange, StreamAllocator, StreamState, StreamStateInfo,
    StreamStateUpdate,
};
pub use config::{CodecSpec, CongestionControlConfig, DirectionConfig, RtcConfig, RtpHeaderExtensionConfig};
pub use congestion::{BandwidthEstimator, SendSideBandwidthEstimator};
pub use error::{Error, Result};
pub use metrics::REGISTRY;
pub use quality::{OnSubscribedMaxQualityChange, QualityAggregator, QualityAggregatorParams};
pub use sdp::{
    extract_dtls_role, extract_fingerprint, extract_ice_credential, filter_candidates, get_mid,
    rewrite_fingerprint,
};
pub use session::{OnGatheringComplete, PeerSession, WebRtcPeerSession};
pub use transport::{
    NegotiationState, OnNegotiationFailed, OnOffer, OnRemoteDescriptionSettled, Transport,
    TransportParams,
};
pub use types::{
    NodeId, ParticipantId, ProtocolVersion, SignalTarget, SimulcastTrackInfo, SimulcastTracks,
    TrackId, VideoQuality,
};
