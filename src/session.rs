//! Peer-session seam over the WebRTC stack
//!
//! The transport controller never talks to a concrete peer-connection type;
//! it drives the [`PeerSession`] capability. [`WebRtcPeerSession`] adapts the
//! stack's peer-connection, and the integration tests drive the controller
//! through a scripted double of the same trait.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::dtls_transport::dtls_role::DTLSRole;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_candidate_pair::RTCIceCandidatePair;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

use crate::error::Result;

pub type OnGatheringComplete = Box<dyn Fn() + Send + Sync>;

/// The slice of the WebRTC stack the negotiation core consumes
#[async_trait]
pub trait PeerSession: Send + Sync {
    async fn create_offer(&self, options: Option<RTCOfferOptions>) -> Result<RTCSessionDescription>;

    async fn create_answer(&self) -> Result<RTCSessionDescription>;

    async fn set_local_description(&self, sd: RTCSessionDescription) -> Result<()>;

    async fn set_remote_description(&self, sd: RTCSessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()>;

    /// Pending-or-current remote description
    async fn remote_description(&self) -> Option<RTCSessionDescription>;

    async fn current_remote_description(&self) -> Option<RTCSessionDescription>;

    async fn local_description(&self) -> Option<RTCSessionDescription>;

    fn connection_state(&self) -> RTCPeerConnectionState;

    fn ice_gathering_state(&self) -> RTCIceGatheringState;

    /// Invoke `handler` every time candidate gathering completes
    fn on_gathering_complete(&self, handler: OnGatheringComplete);

    /// Append a stopped receive-only transceiver pinned to `mid`
    ///
    /// Used by migration priming to reproduce a previous answer's m-line
    /// layout before the first offer is generated.
    async fn add_stopped_receiver(&self, kind: RTPCodecType, mid: &str) -> Result<()>;

    /// Create a detached answer-only session sharing this session's media
    /// configuration, answering DTLS with the given role
    async fn spawn_answer_session(&self, answering_role: DTLSRole) -> Result<Arc<dyn PeerSession>>;

    async fn selected_candidate_pair(&self) -> Option<RTCIceCandidatePair>;

    async fn close(&self) -> Result<()>;
}

pub(crate) type MediaEngineFactory = Arc<dyn Fn() -> Result<MediaEngine> + Send + Sync>;

/// Production [`PeerSession`] backed by the stack's peer-connection
pub struct WebRtcPeerSession {
    pc: Arc<RTCPeerConnection>,
    engine_factory: MediaEngineFactory,
    stopped_receivers: AtomicUsize,
}

impl WebRtcPeerSession {
    pub(crate) fn new(pc: Arc<RTCPeerConnection>, engine_factory: MediaEngineFactory) -> Self {
        Self { pc, engine_factory, stopped_receivers: AtomicUsize::new(0) }
    }

    /// The raw peer-connection, for track and data-channel plumbing owned by
    /// the session layer
    #[must_use]
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

#[async_trait]
impl PeerSession for WebRtcPeerSession {
    async fn create_offer(&self, options: Option<RTCOfferOptions>) -> Result<RTCSessionDescription> {
        Ok(self.pc.create_offer(options).await?)
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription> {
        Ok(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, sd: RTCSessionDescription) -> Result<()> {
        Ok(self.pc.set_local_description(sd).await?)
    }

    async fn set_remote_description(&self, sd: RTCSessionDescription) -> Result<()> {
        Ok(self.pc.set_remote_description(sd).await?)
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        Ok(self.pc.add_ice_candidate(candidate).await?)
    }

    async fn remote_description(&self) -> Option<RTCSessionDescription> {
        self.pc.remote_description().await
    }

    async fn current_remote_description(&self) -> Option<RTCSessionDescription> {
        self.pc.current_remote_description().await
    }

    async fn local_description(&self) -> Option<RTCSessionDescription> {
        self.pc.local_description().await
    }

    fn connection_state(&self) -> RTCPeerConnectionState {
        self.pc.connection_state()
    }

    fn ice_gathering_state(&self) -> RTCIceGatheringState {
        self.pc.ice_gathering_state()
    }

    fn on_gathering_complete(&self, handler: OnGatheringComplete) {
        let handler = Arc::new(handler);
        self.pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                if state == RTCIceGathererState::Complete {
                    handler();
                }
            })
        }));
    }

    async fn add_stopped_receiver(&self, kind: RTPCodecType, mid: &str) -> Result<()> {
        let transceiver = self
            .pc
            .add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        transceiver.stop().await?;

        // The stack assigns mids positionally at offer time, counting from
        // zero in transceiver order. Server-generated answers use the same
        // numbering, so appending in m-line order reproduces them.
        let slot = self.stopped_receivers.fetch_add(1, Ordering::SeqCst);
        if mid != slot.to_string() {
            warn!(
                mid = %mid,
                slot,
                "previous answer mid is not positional; regenerated offer may diverge"
            );
        }
        Ok(())
    }

    async fn spawn_answer_session(&self, answering_role: DTLSRole) -> Result<Arc<dyn PeerSession>> {
        let mut setting_engine = SettingEngine::default();
        setting_engine.set_answering_dtls_role(answering_role)?;

        let media_engine = (self.engine_factory)()?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_setting_engine(setting_engine)
            .build();
        let pc = Arc::new(api.new_peer_connection(RTCConfiguration::default()).await?);

        Ok(Arc::new(Self {
            pc,
            engine_factory: Arc::clone(&self.engine_factory),
            stopped_receivers: AtomicUsize::new(0),
        }))
    }

    async fn selected_candidate_pair(&self) -> Option<RTCIceCandidatePair> {
        let dtls_transport = self.pc.sctp().transport();
        let ice_transport = dtls_transport.ice_transport();
        ice_transport.get_selected_candidate_pair().await
    }

    async fn close(&self) -> Result<()> {
        Ok(self.pc.close().await?)
    }
}
