//! Per-peer transport controller
//!
//! One `Transport` wraps one peer-connection (publisher or subscriber) and
//! owns its negotiation state machine: locally initiated offers are debounced
//! and serialized, remote descriptions settle or queue retries, ICE restarts
//! are recovered across gathering, and a failure timer tears down sessions
//! whose answers never arrive.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_candidate_pair::RTCIceCandidatePair;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::allocator::{AddTrackParams, OnStreamStateChange, StreamAllocator};
use crate::builder::build_peer_session;
use crate::config::{CodecSpec, RtcConfig};
use crate::error::{Error, Result};
use crate::metrics;
use crate::migration;
use crate::sdp;
use crate::session::PeerSession;
use crate::types::{ParticipantId, ProtocolVersion, SignalTarget, SimulcastTracks, TrackId};

/// Trailing debounce window for locally initiated negotiation
const NEGOTIATION_FREQUENCY: Duration = Duration::from_millis(150);
/// How long an outstanding offer may wait for its answer
const NEGOTIATION_FAILED_TIMEOUT: Duration = Duration::from_secs(15);
/// Connections shorter than this are flagged for health accounting
const SHORT_CONNECTION_THRESHOLD: Duration = Duration::from_secs(2 * 60);

pub type OnOffer = Arc<dyn Fn(RTCSessionDescription) + Send + Sync>;
pub type OnNegotiationFailed = Arc<dyn Fn() + Send + Sync>;
pub type OnRemoteDescriptionSettled = Arc<dyn Fn() + Send + Sync>;

/// Where the local offer/answer exchange currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationState {
    #[default]
    Idle,
    /// We are the offerer and the client has not answered yet
    AwaitingAnswer,
    /// Another negotiation was requested while awaiting; run it after the
    /// outstanding answer lands
    RetryQueued,
}

pub struct TransportParams {
    pub participant_id: ParticipantId,
    pub protocol_version: ProtocolVersion,
    pub target: SignalTarget,
    pub config: Arc<RtcConfig>,
    pub enabled_codecs: Vec<CodecSpec>,
    pub sim_tracks: SimulcastTracks,
    /// Subscriber direction only
    pub stream_allocator: Option<Arc<dyn StreamAllocator>>,
}

/// Negotiation bookkeeping guarded by the transport lock
#[derive(Default)]
struct Negotiation {
    state: NegotiationState,
    /// Remote candidates received before any remote description
    pending_candidates: Vec<RTCIceCandidateInit>,
    /// Publishers whose updates ride on the next offer
    pending_publishers: HashSet<ParticipantId>,
    restart_after_gathering: bool,
    restart_at_next_offer: bool,
    previous_answer: Option<RTCSessionDescription>,
    /// ufrag:pwd of the current remote offerer, for restart detection
    current_offer_ice_credential: String,
    /// Remote ICE-restart offer deferred while gathering
    pending_restart_ice_offer: Option<RTCSessionDescription>,
    failure_timer: Option<JoinHandle<()>>,
}

/// One peer-connection plus its negotiation state machine
pub struct Transport {
    params: TransportParams,
    session: Arc<dyn PeerSession>,
    weak: Weak<Transport>,

    negotiation: Mutex<Negotiation>,
    /// Bumped once per produced local offer; failure timers are scoped to it
    negotiate_counter: AtomicU32,
    prefer_tcp: AtomicBool,
    ice_connected_at: RwLock<Option<Instant>>,
    debounced_negotiate: SyncMutex<Option<JoinHandle<()>>>,

    on_offer: RwLock<Option<OnOffer>>,
    on_negotiation_failed: RwLock<Option<OnNegotiationFailed>>,
    on_remote_description_settled: RwLock<Option<OnRemoteDescriptionSettled>>,
}

impl Transport {
    /// Build the peer-connection for `params` and wrap it in a transport
    pub async fn new(params: TransportParams) -> Result<Arc<Self>> {
        if let Some(allocator) = &params.stream_allocator {
            allocator.start();
        }

        let allocator = params.stream_allocator.clone();
        let session = build_peer_session(
            params.target,
            params.protocol_version,
            &params.config,
            &params.enabled_codecs,
            &params.sim_tracks,
            Box::new(move |estimator| {
                if let Some(allocator) = &allocator {
                    allocator.set_bandwidth_estimator(estimator);
                }
            }),
        )
        .await?;

        Ok(Self::with_session(params, Arc::new(session)))
    }

    /// Wrap an existing peer session
    ///
    /// This is the seam the integration tests drive; `new` goes through it as
    /// well.
    pub fn with_session(params: TransportParams, session: Arc<dyn PeerSession>) -> Arc<Self> {
        let transport = Arc::new_cyclic(|weak| Self {
            params,
            session: Arc::clone(&session),
            weak: weak.clone(),
            negotiation: Mutex::new(Negotiation::default()),
            negotiate_counter: AtomicU32::new(0),
            prefer_tcp: AtomicBool::new(false),
            ice_connected_at: RwLock::new(None),
            debounced_negotiate: SyncMutex::new(None),
            on_offer: RwLock::new(None),
            on_negotiation_failed: RwLock::new(None),
            on_remote_description_settled: RwLock::new(None),
        });

        let weak = Arc::downgrade(&transport);
        session.on_gathering_complete(Box::new(move || {
            let Some(transport) = weak.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                transport.handle_gathering_complete().await;
            });
        }));

        transport
    }

    #[must_use]
    pub fn participant_id(&self) -> &ParticipantId {
        &self.params.participant_id
    }

    #[must_use]
    pub fn target(&self) -> SignalTarget {
        self.params.target
    }

    /// The underlying peer session, for track and data-channel plumbing
    #[must_use]
    pub fn session(&self) -> &Arc<dyn PeerSession> {
        &self.session
    }

    pub fn on_offer(&self, f: OnOffer) {
        *self.on_offer.write() = Some(f);
    }

    pub fn on_negotiation_failed(&self, f: OnNegotiationFailed) {
        *self.on_negotiation_failed.write() = Some(f);
    }

    pub fn on_remote_description_settled(&self, f: OnRemoteDescriptionSettled) {
        *self.on_remote_description_settled.write() = Some(f);
    }

    pub fn set_prefer_tcp(&self, prefer_tcp: bool) {
        self.prefer_tcp.store(prefer_tcp, Ordering::Relaxed);
    }

    pub fn set_ice_connected_at(&self, at: Instant) {
        *self.ice_connected_at.write() = Some(at);
    }

    /// Whether ICE stayed connected for less than the short-connection
    /// threshold, and for how long it has been up
    #[must_use]
    pub fn is_short_connection(&self, at: Instant) -> (bool, Duration) {
        let Some(connected_at) = *self.ice_connected_at.read() else {
            return (false, Duration::ZERO);
        };

        let duration = at.saturating_duration_since(connected_at);
        (duration < SHORT_CONNECTION_THRESHOLD, duration)
    }

    /// True once the peer-connection left its initial state
    #[must_use]
    pub fn is_established(&self) -> bool {
        self.session.connection_state() != RTCPeerConnectionState::New
    }

    pub async fn get_selected_pair(&self) -> Option<RTCIceCandidatePair> {
        self.session.selected_candidate_pair().await
    }

    pub async fn negotiation_state(&self) -> NegotiationState {
        self.negotiation.lock().await.state
    }

    /// Tag `publisher_id`'s track updates onto the next produced offer
    pub async fn add_negotiation_pending(&self, publisher_id: ParticipantId) {
        self.negotiation.lock().await.pending_publishers.insert(publisher_id);
    }

    pub async fn is_negotiation_pending(&self, publisher_id: &ParticipantId) -> bool {
        self.negotiation.lock().await.pending_publishers.contains(publisher_id)
    }

    /// Apply a remote candidate, buffering it until a remote description
    /// exists
    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        let mut negotiation = self.negotiation.lock().await;
        if self.session.remote_description().await.is_none() {
            negotiation.pending_candidates.push(candidate);
            return Ok(());
        }
        drop(negotiation);

        debug!(
            participant = %self.params.participant_id,
            candidate = %candidate.candidate,
            "adding remote candidate"
        );
        self.session.add_ice_candidate(candidate).await
    }

    /// Apply a remote offer or answer
    ///
    /// A remote offer with changed ICE credentials is an ICE restart; while
    /// gathering it is deferred until gathering completes. A settled answer
    /// releases any queued retry negotiation.
    pub async fn set_remote_description(&self, sd: RTCSessionDescription) -> Result<()> {
        let mut negotiation = self.negotiation.lock().await;

        let mut ice_credential = String::new();
        let mut offer_restart_ice = false;
        if sd.sdp_type == RTCSdpType::Offer {
            (ice_credential, offer_restart_ice) =
                match remote_offer_restart_info(&negotiation, &sd) {
                    Ok(info) => info,
                    Err(err) => {
                        error!(
                            participant = %self.params.participant_id,
                            error = %err,
                            "checking remote offer for ICE restart failed"
                        );
                        return Err(err);
                    }
                };
        }

        if offer_restart_ice
            && self.session.ice_gathering_state() == RTCIceGatheringState::Gathering
        {
            debug!(
                participant = %self.params.participant_id,
                "remote ICE-restart offer while gathering, deferring"
            );
            negotiation.pending_restart_ice_offer = Some(sd);
            return Ok(());
        }

        if let Err(err) = self.session.set_remote_description(sd.clone()).await {
            metrics::count_error("remote_description", "apply");
            return Err(err);
        }

        if negotiation.current_offer_ice_credential.is_empty() || offer_restart_ice {
            negotiation.current_offer_ice_credential = ice_credential;
        }

        // negotiated; settle the state machine
        let last_state = negotiation.state;
        negotiation.state = NegotiationState::Idle;
        if let Some(timer) = negotiation.failure_timer.take() {
            timer.abort();
        }

        // the buffer survives failure here so a later description can retry
        for candidate in &negotiation.pending_candidates {
            self.session.add_ice_candidate(candidate.clone()).await?;
        }
        negotiation.pending_candidates.clear();

        // only initiate when we are the offerer
        if last_state == NegotiationState::RetryQueued && sd.sdp_type == RTCSdpType::Answer {
            debug!(
                participant = %self.params.participant_id,
                "re-negotiating after receiving answer"
            );
            if let Err(err) = self.create_and_send_offer_locked(&mut negotiation, None).await {
                error!(
                    participant = %self.params.participant_id,
                    error = %err,
                    "could not negotiate"
                );
            }
        }
        drop(negotiation);

        if let Some(settled) = self.on_remote_description_settled.read().clone() {
            tokio::spawn(async move {
                settled();
            });
        }
        Ok(())
    }

    /// Request a locally initiated negotiation
    ///
    /// Unforced requests collapse through a trailing debounce window; a
    /// forced request cancels any pending one and offers immediately.
    pub async fn negotiate(&self, force: bool) {
        if let Some(pending) = self.debounced_negotiate.lock().take() {
            pending.abort();
        }

        if force {
            if let Err(err) = self.create_and_send_offer(None).await {
                error!(
                    participant = %self.params.participant_id,
                    error = %err,
                    "could not negotiate"
                );
            }
        } else {
            let Some(transport) = self.weak.upgrade() else {
                return;
            };
            *self.debounced_negotiate.lock() = Some(tokio::spawn(async move {
                tokio::time::sleep(NEGOTIATION_FREQUENCY).await;
                if let Err(err) = transport.create_and_send_offer(None).await {
                    error!(
                        participant = %transport.params.participant_id,
                        error = %err,
                        "could not negotiate"
                    );
                }
            }));
        }
    }

    pub async fn create_and_send_offer(&self, options: Option<RTCOfferOptions>) -> Result<()> {
        let mut negotiation = self.negotiation.lock().await;
        self.create_and_send_offer_locked(&mut negotiation, options).await
    }

    /// The offer algorithm; runs with the negotiation lock held
    async fn create_and_send_offer_locked(
        &self,
        negotiation: &mut Negotiation,
        options: Option<RTCOfferOptions>,
    ) -> Result<()> {
        let Some(on_offer) = self.on_offer.read().clone() else {
            return Ok(());
        };
        if self.session.connection_state() == RTCPeerConnectionState::Closed {
            return Ok(());
        }

        let ice_restart =
            options.as_ref().is_some_and(|o| o.ice_restart) || negotiation.restart_at_next_offer;

        // restart requested but gathering is still running: finish it first
        if ice_restart {
            if self.session.ice_gathering_state() == RTCIceGatheringState::Gathering {
                debug!(
                    participant = %self.params.participant_id,
                    "restarting ICE after gathering completes"
                );
                negotiation.restart_after_gathering = true;
                return Ok(());
            }
            debug!(participant = %self.params.participant_id, "restarting ICE");
        }

        if ice_restart && negotiation.state != NegotiationState::Idle {
            match self.session.current_remote_description().await {
                None => {
                    // restart while the client never answered: resend the
                    // current local description to nudge it, then retry
                    let Some(offer) = self.session.local_description().await else {
                        warn!(
                            participant = %self.params.participant_id,
                            "ICE restart without local offer"
                        );
                        return Err(Error::IceRestartWithoutLocalSdp);
                    };
                    negotiation.state = NegotiationState::RetryQueued;
                    negotiation.restart_at_next_offer = true;
                    tokio::spawn(async move {
                        on_offer(offer);
                    });
                    return Ok(());
                }
                Some(current) => {
                    // coerce the peer-connection back to stable
                    info!(
                        participant = %self.params.participant_id,
                        "recovering from pending negotiation state on ICE restart"
                    );
                    if let Err(err) = self.session.set_remote_description(current).await {
                        metrics::count_error("offer", "remote_description");
                        return Err(err);
                    }
                }
            }
        } else {
            // an ongoing negotiation finishes first; queue at most one retry
            match negotiation.state {
                NegotiationState::AwaitingAnswer => {
                    info!(
                        participant = %self.params.participant_id,
                        "skipping negotiation, trying again later"
                    );
                    negotiation.state = NegotiationState::RetryQueued;
                    return Ok(());
                }
                NegotiationState::RetryQueued => return Ok(()),
                NegotiationState::Idle => {}
            }
        }

        let mut options = options.unwrap_or_default();
        if negotiation.previous_answer.take().is_some() {
            options.ice_restart = true;
        }
        if negotiation.restart_at_next_offer {
            negotiation.restart_at_next_offer = false;
            options.ice_restart = true;
        }

        let offer = match self.session.create_offer(Some(options)).await {
            Ok(offer) => offer,
            Err(err) => {
                metrics::count_error("offer", "create");
                error!(
                    participant = %self.params.participant_id,
                    error = %err,
                    "could not create offer"
                );
                return Err(err);
            }
        };
        let offer = sdp::filter_candidates(offer, self.prefer_tcp.load(Ordering::Relaxed));

        if let Err(err) = self.session.set_local_description(offer.clone()).await {
            metrics::count_error("offer", "local_description");
            error!(
                participant = %self.params.participant_id,
                error = %err,
                "could not set local description"
            );
            return Err(err);
        }

        negotiation.state = NegotiationState::AwaitingAnswer;
        negotiation.restart_after_gathering = false;
        negotiation.pending_publishers.clear();

        let epoch = self.negotiate_counter.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(timer) = negotiation.failure_timer.take() {
            timer.abort();
        }
        negotiation.failure_timer = Some(self.spawn_failure_timer(epoch));

        tokio::spawn(async move {
            on_offer(offer);
        });
        Ok(())
    }

    fn spawn_failure_timer(&self, epoch: u32) -> JoinHandle<()> {
        let weak = self.weak.clone();
        tokio::spawn(async move {
            tokio::time::sleep(NEGOTIATION_FAILED_TIMEOUT).await;
            let Some(transport) = weak.upgrade() else {
                return;
            };

            let failed = transport.negotiation.lock().await.state != NegotiationState::Idle;
            if transport.negotiate_counter.load(Ordering::SeqCst) == epoch && failed {
                warn!(
                    participant = %transport.params.participant_id,
                    target = %transport.params.target,
                    epoch,
                    "negotiation timed out waiting for answer"
                );
                if let Some(on_failed) = transport.on_negotiation_failed.read().clone() {
                    on_failed();
                }
            }
        })
    }

    async fn handle_gathering_complete(self: Arc<Self>) {
        let mut negotiation = self.negotiation.lock().await;
        if negotiation.restart_after_gathering {
            debug!(
                participant = %self.params.participant_id,
                "restarting ICE after ICE gathering"
            );
            negotiation.restart_after_gathering = false;
            let options = RTCOfferOptions { ice_restart: true, ..Default::default() };
            if let Err(err) =
                self.create_and_send_offer_locked(&mut negotiation, Some(options)).await
            {
                warn!(
                    participant = %self.params.participant_id,
                    error = %err,
                    "could not restart ICE"
                );
            }
        } else if let Some(offer) = negotiation.pending_restart_ice_offer.take() {
            debug!(
                participant = %self.params.participant_id,
                "accepting deferred remote ICE-restart offer after gathering"
            );
            drop(negotiation);
            if let Err(err) = self.set_remote_description(offer).await {
                warn!(
                    participant = %self.params.participant_id,
                    error = %err,
                    "could not accept deferred remote ICE-restart offer"
                );
            }
        }
    }

    /// Install a previous answer ahead of any negotiation so the next offer
    /// resumes the client's migrated session; see [`crate::migration`]
    pub async fn set_previous_answer(&self, answer: RTCSessionDescription) {
        let mut negotiation = self.negotiation.lock().await;
        if self.session.remote_description().await.is_some()
            || negotiation.previous_answer.is_some()
        {
            return;
        }

        negotiation.previous_answer = Some(answer.clone());
        if let Err(err) = migration::prime_with_previous_answer(&self.session, &answer).await {
            error!(
                participant = %self.params.participant_id,
                error = %err,
                "priming with previous answer failed"
            );
        }
    }

    /// Candidate filtering honoring the transport's TCP preference
    #[must_use]
    pub fn filter_candidates(&self, sd: RTCSessionDescription) -> RTCSessionDescription {
        sdp::filter_candidates(sd, self.prefer_tcp.load(Ordering::Relaxed))
    }

    pub fn on_stream_state_change(&self, f: OnStreamStateChange) {
        if let Some(allocator) = &self.params.stream_allocator {
            allocator.on_stream_state_change(f);
        }
    }

    pub fn add_track(&self, track: AddTrackParams) {
        if let Some(allocator) = &self.params.stream_allocator {
            allocator.add_track(track);
        }
    }

    pub fn remove_track(&self, track_id: &TrackId) {
        if let Some(allocator) = &self.params.stream_allocator {
            allocator.remove_track(track_id);
        }
    }

    /// Stop timers and the allocator, then close the peer-connection
    pub async fn close(&self) {
        {
            let mut negotiation = self.negotiation.lock().await;
            if let Some(timer) = negotiation.failure_timer.take() {
                timer.abort();
            }
        }
        if let Some(pending) = self.debounced_negotiate.lock().take() {
            pending.abort();
        }
        if let Some(allocator) = &self.params.stream_allocator {
            allocator.stop();
        }
        let _ = self.session.close().await;
    }
}

/// Parse a remote offer's ICE credential and decide whether it restarts ICE
fn remote_offer_restart_info(
    negotiation: &Negotiation,
    sd: &RTCSessionDescription,
) -> Result<(String, bool)> {
    let parsed = sd.unmarshal()?;
    let (ufrag, pwd) = sdp::extract_ice_credential(&parsed)?;
    let credential = format!("{ufrag}:{pwd}");

    // changed credential on a remote offer means the remote restarted ICE
    let restart = !negotiation.current_offer_ice_credential.is_empty()
        && negotiation.current_offer_ice_credential != credential;
    Ok((credential, restart))
}
