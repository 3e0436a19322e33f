//! Scripted peer-session double for driving the transport state machine

#![allow(dead_code)]

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use confer_rtc::{
    Error, OnGatheringComplete, PeerSession, ProtocolVersion, Result, RtcConfig, SignalTarget,
    Transport, TransportParams,
};
use parking_lot::Mutex;
use webrtc::dtls_transport::dtls_role::DTLSRole;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_candidate_pair::RTCIceCandidatePair;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::sdp::description::session::SessionDescription;

pub const MOCK_FINGERPRINT: &str = "sha-256 M0:CK:00:11:22:33";
pub const PROBE_FINGERPRINT: &str = "sha-256 0B:AD:FE:ED:00:00";

#[derive(Default)]
struct Inner {
    gathering: Option<RTCIceGatheringState>,
    connection: Option<RTCPeerConnectionState>,
    local: Option<RTCSessionDescription>,
    remote: Option<RTCSessionDescription>,
    remote_applied: u32,
    fail_next_set_remote: bool,
    applied_candidates: Vec<RTCIceCandidateInit>,
    mlines: Vec<(String, String)>,
    has_data_channel: bool,
    ufrag_serial: u32,
    offers_created: u32,
    last_offer_options: Option<RTCOfferOptions>,
    probe_roles: Vec<DTLSRole>,
    probes: Vec<Arc<MockPeerSession>>,
    answering_role: Option<DTLSRole>,
    closed: bool,
}

pub struct MockPeerSession {
    inner: Mutex<Inner>,
    gathering_handler: Mutex<Option<OnGatheringComplete>>,
}

impl Default for MockPeerSession {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPeerSession {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()), gathering_handler: Mutex::new(None) }
    }

    pub fn set_gathering(&self, state: RTCIceGatheringState) {
        self.inner.lock().gathering = Some(state);
    }

    /// Flip gathering to complete and fire the registered hook
    pub fn complete_gathering(&self) {
        self.inner.lock().gathering = Some(RTCIceGatheringState::Complete);
        if let Some(handler) = self.gathering_handler.lock().as_ref() {
            handler();
        }
    }

    pub fn set_connection_state(&self, state: RTCPeerConnectionState) {
        self.inner.lock().connection = Some(state);
    }

    pub fn set_data_channel(&self, present: bool) {
        self.inner.lock().has_data_channel = present;
    }

    pub fn fail_next_set_remote(&self) {
        self.inner.lock().fail_next_set_remote = true;
    }

    pub fn offers_created(&self) -> u32 {
        self.inner.lock().offers_created
    }

    pub fn remote_applied(&self) -> u32 {
        self.inner.lock().remote_applied
    }

    pub fn last_offer_options(&self) -> Option<RTCOfferOptions> {
        self.inner.lock().last_offer_options.clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.inner.lock().applied_candidates.iter().map(|c| c.candidate.clone()).collect()
    }

    pub fn local_sdp(&self) -> Option<String> {
        self.inner.lock().local.as_ref().map(|sd| sd.sdp.clone())
    }

    pub fn remote_sdp(&self) -> Option<String> {
        self.inner.lock().remote.as_ref().map(|sd| sd.sdp.clone())
    }

    pub fn mlines(&self) -> Vec<(String, String)> {
        self.inner.lock().mlines.clone()
    }

    pub fn probe_roles(&self) -> Vec<DTLSRole> {
        self.inner.lock().probe_roles.clone()
    }

    pub fn probes(&self) -> Vec<Arc<MockPeerSession>> {
        self.inner.lock().probes.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn render_offer(inner: &mut Inner, ice_restart: bool) -> String {
        if inner.has_data_channel && !inner.mlines.iter().any(|(kind, _)| kind == "application") {
            let mid = inner.mlines.len().to_string();
            inner.mlines.push(("application".to_owned(), mid));
        }
        if inner.mlines.is_empty() {
            inner.mlines.push(("audio".to_owned(), "0".to_owned()));
        }
        if ice_restart {
            inner.ufrag_serial += 1;
        }

        let mut out = String::from("v=0\r\no=- 884287 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n");
        out.push_str(&format!("a=fingerprint:{MOCK_FINGERPRINT}\r\n"));
        for (kind, mid) in &inner.mlines {
            if kind == "application" {
                out.push_str("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n");
            } else {
                out.push_str(&format!("m={kind} 9 UDP/TLS/RTP/SAVPF 96\r\n"));
            }
            out.push_str("c=IN IP4 0.0.0.0\r\n");
            out.push_str(&format!("a=mid:{mid}\r\n"));
            out.push_str(&format!("a=ice-ufrag:u{}\r\n", inner.ufrag_serial));
            out.push_str("a=ice-pwd:mockpasswordmockpassword\r\n");
            out.push_str("a=setup:actpass\r\n");
        }
        out
    }

    fn render_answer(remote_offer: &SessionDescription, role: DTLSRole) -> String {
        let setup = if role == DTLSRole::Server { "passive" } else { "active" };
        let mut out = String::from("v=0\r\no=- 884288 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n");
        out.push_str(&format!("a=fingerprint:{PROBE_FINGERPRINT}\r\n"));
        for m in &remote_offer.media_descriptions {
            let kind = m.media_name.media.as_str();
            if kind == "application" {
                out.push_str("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n");
            } else {
                out.push_str(&format!("m={kind} 9 UDP/TLS/RTP/SAVPF 96\r\n"));
            }
            out.push_str("c=IN IP4 0.0.0.0\r\n");
            let mid = m.attribute("mid").flatten().unwrap_or("0");
            out.push_str(&format!("a=mid:{mid}\r\n"));
            out.push_str("a=ice-ufrag:probeufrag\r\n");
            out.push_str("a=ice-pwd:probepasswordprobepassword\r\n");
            out.push_str(&format!("a=setup:{setup}\r\n"));
            out.push_str(&format!("a=fingerprint:{PROBE_FINGERPRINT}\r\n"));
        }
        out
    }
}

#[async_trait]
impl PeerSession for MockPeerSession {
    async fn create_offer(&self, options: Option<RTCOfferOptions>) -> Result<RTCSessionDescription> {
        let mut inner = self.inner.lock();
        let ice_restart = options.as_ref().is_some_and(|o| o.ice_restart);
        let raw = Self::render_offer(&mut inner, ice_restart);
        inner.offers_created += 1;
        inner.last_offer_options = options;
        Ok(RTCSessionDescription::offer(raw).expect("mock offer parses"))
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription> {
        let inner = self.inner.lock();
        let remote = inner.remote.as_ref().expect("answer requires a remote offer");
        let parsed = remote.unmarshal()?;
        let role = inner.answering_role.unwrap_or(DTLSRole::Client);
        let raw = Self::render_answer(&parsed, role);
        Ok(RTCSessionDescription::answer(raw).expect("mock answer parses"))
    }

    async fn set_local_description(&self, sd: RTCSessionDescription) -> Result<()> {
        self.inner.lock().local = Some(sd);
        Ok(())
    }

    async fn set_remote_description(&self, sd: RTCSessionDescription) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.fail_next_set_remote {
            inner.fail_next_set_remote = false;
            return Err(Error::Unavailable("scripted remote description failure"));
        }
        inner.remote = Some(sd);
        inner.remote_applied += 1;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        self.inner.lock().applied_candidates.push(candidate);
        Ok(())
    }

    async fn remote_description(&self) -> Option<RTCSessionDescription> {
        self.inner.lock().remote.clone()
    }

    async fn current_remote_description(&self) -> Option<RTCSessionDescription> {
        self.inner.lock().remote.clone()
    }

    async fn local_description(&self) -> Option<RTCSessionDescription> {
        self.inner.lock().local.clone()
    }

    fn connection_state(&self) -> RTCPeerConnectionState {
        self.inner.lock().connection.unwrap_or(RTCPeerConnectionState::New)
    }

    fn ice_gathering_state(&self) -> RTCIceGatheringState {
        self.inner.lock().gathering.unwrap_or(RTCIceGatheringState::New)
    }

    fn on_gathering_complete(&self, handler: OnGatheringComplete) {
        *self.gathering_handler.lock() = Some(handler);
    }

    async fn add_stopped_receiver(&self, kind: RTPCodecType, mid: &str) -> Result<()> {
        let kind = match kind {
            RTPCodecType::Audio => "audio",
            _ => "video",
        };
        self.inner.lock().mlines.push((kind.to_owned(), mid.to_owned()));
        Ok(())
    }

    async fn spawn_answer_session(&self, answering_role: DTLSRole) -> Result<Arc<dyn PeerSession>> {
        let probe = Arc::new(MockPeerSession::new());
        probe.inner.lock().answering_role = Some(answering_role);

        let mut inner = self.inner.lock();
        inner.probe_roles.push(answering_role);
        inner.probes.push(Arc::clone(&probe));
        Ok(probe)
    }

    async fn selected_candidate_pair(&self) -> Option<RTCIceCandidatePair> {
        None
    }

    async fn close(&self) -> Result<()> {
        self.inner.lock().closed = true;
        Ok(())
    }
}

/// A syntactically valid remote offer carrying the given ufrag
pub fn remote_offer(ufrag: &str) -> RTCSessionDescription {
    let raw = format!(
        "v=0\r\no=- 1000 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
         m=audio 9 UDP/TLS/RTP/SAVPF 111\r\nc=IN IP4 0.0.0.0\r\n\
         a=mid:0\r\na=ice-ufrag:{ufrag}\r\na=ice-pwd:remotepasswordremote\r\n\
         a=setup:actpass\r\na=fingerprint:sha-256 CA:FE:00:11\r\n"
    );
    RTCSessionDescription::offer(raw).expect("remote offer parses")
}

/// A syntactically valid remote answer
pub fn remote_answer(ufrag: &str) -> RTCSessionDescription {
    let raw = format!(
        "v=0\r\no=- 1001 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
         m=audio 9 UDP/TLS/RTP/SAVPF 111\r\nc=IN IP4 0.0.0.0\r\n\
         a=mid:0\r\na=ice-ufrag:{ufrag}\r\na=ice-pwd:remotepasswordremote\r\n\
         a=setup:active\r\na=fingerprint:sha-256 CA:FE:00:11\r\n"
    );
    RTCSessionDescription::answer(raw).expect("remote answer parses")
}

/// Parse an SDP string into the stack's session description
pub fn parse_sdp(raw: &str) -> SessionDescription {
    SessionDescription::unmarshal(&mut Cursor::new(raw.as_bytes())).expect("valid SDP")
}

pub fn publisher_params() -> TransportParams {
    TransportParams {
        participant_id: "pa_test".into(),
        protocol_version: ProtocolVersion::default(),
        target: SignalTarget::Publisher,
        config: Arc::new(RtcConfig::default()),
        enabled_codecs: vec![],
        sim_tracks: Default::default(),
        stream_allocator: None,
    }
}

pub fn subscriber_params() -> TransportParams {
    TransportParams { target: SignalTarget::Subscriber, ..publisher_params() }
}

/// A transport driving the scripted session
pub fn transport_over(session: &Arc<MockPeerSession>) -> Arc<Transport> {
    let session: Arc<dyn PeerSession> = Arc::clone(session) as Arc<dyn PeerSession>;
    Transport::with_session(subscriber_params(), session)
}
