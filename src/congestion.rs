//! Send-side congestion control for the subscriber peer-connection
//!
//! The stack does not ship a bandwidth estimator, so the transport carries a
//! small send-side one driven by transport-wide-CC feedback: an interceptor
//! records outgoing packets by their TWCC sequence number and matches them
//! against `TransportLayerCc` reports, and the estimator adjusts its target
//! with a loss-based additive-increase / multiplicative-decrease rule.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;
use webrtc::interceptor::stream_info::StreamInfo;
use webrtc::interceptor::{
    Attributes, Interceptor, InterceptorBuilder, RTCPReader, RTCPWriter, RTPReader, RTPWriter,
};
use webrtc::rtcp::transport_feedbacks::transport_layer_cc::{
    PacketStatusChunk, SymbolTypeTcc, TransportLayerCc,
};
use webrtc::sdp::extmap::TRANSPORT_CC_URI;
use webrtc::util::marshal::MarshalSize;

use crate::config::CongestionControlConfig;

type IResult<T> = std::result::Result<T, webrtc::interceptor::Error>;

/// How long a sent packet stays eligible for feedback matching
const SENT_HISTORY_WINDOW: Duration = Duration::from_secs(2);
/// Window over which the acknowledged bitrate is measured
const ACK_RATE_WINDOW: Duration = Duration::from_millis(1000);

const LOSS_INCREASE_THRESHOLD: f64 = 0.02;
const LOSS_DECREASE_THRESHOLD: f64 = 0.10;
const INCREASE_FACTOR: f64 = 1.08;

/// Read side of the estimator, handed to the stream allocator
pub trait BandwidthEstimator: Send + Sync {
    /// Current target send rate in bits per second
    fn target_bitrate(&self) -> u64;

    fn on_target_bitrate_change(&self, f: Box<dyn Fn(u64) + Send + Sync>);
}

struct SentPacket {
    size: usize,
    sent_at: Instant,
}

struct EstimatorState {
    target: u64,
    sent: HashMap<u16, SentPacket>,
    sent_order: VecDeque<u16>,
    acked: VecDeque<(Instant, usize)>,
}

/// Loss-based send-side estimate over TWCC feedback
pub struct SendSideBandwidthEstimator {
    config: CongestionControlConfig,
    state: Mutex<EstimatorState>,
    on_change: Mutex<Option<Box<dyn Fn(u64) + Send + Sync>>>,
}

impl SendSideBandwidthEstimator {
    #[must_use]
    pub fn new(config: CongestionControlConfig) -> Self {
        let target = config.initial_bitrate;
        Self {
            config,
            state: Mutex::new(EstimatorState {
                target,
                sent: HashMap::new(),
                sent_order: VecDeque::new(),
                acked: VecDeque::new(),
            }),
            on_change: Mutex::new(None),
        }
    }

    pub(crate) fn record_sent(&self, seq: u16, size: usize, now: Instant) {
        let mut state = self.state.lock();
        state.sent.insert(seq, SentPacket { size, sent_at: now });
        state.sent_order.push_back(seq);

        while let Some(&oldest) = state.sent_order.front() {
            let expired = state
                .sent
                .get(&oldest)
                .is_none_or(|p| now.duration_since(p.sent_at) > SENT_HISTORY_WINDOW);
            if !expired {
                break;
            }
            state.sent_order.pop_front();
            state.sent.remove(&oldest);
        }
    }

    /// Fold one feedback report into the estimate
    pub(crate) fn process_feedback(&self, cc: &TransportLayerCc, now: Instant) {
        let mut acked_packets = 0u64;
        let mut lost_packets = 0u64;

        let changed = {
            let mut state = self.state.lock();
            for (seq, received) in walk_feedback(cc) {
                let Some(sent) = state.sent.remove(&seq) else {
                    continue;
                };
                if received {
                    acked_packets += 1;
                    state.acked.push_back((now, sent.size));
                } else {
                    lost_packets += 1;
                }
            }
            while state
                .acked
                .front()
                .is_some_and(|(at, _)| now.duration_since(*at) > ACK_RATE_WINDOW)
            {
                state.acked.pop_front();
            }

            let referenced = acked_packets + lost_packets;
            if referenced == 0 {
                return;
            }
            let loss = lost_packets as f64 / referenced as f64;
            let acked_bytes: usize = state.acked.iter().map(|(_, size)| size).sum();
            let acked_rate =
                (acked_bytes as f64 * 8.0 / ACK_RATE_WINDOW.as_secs_f64()) as u64;

            let previous = state.target;
            let target = if loss >= LOSS_DECREASE_THRESHOLD {
                (previous as f64 * (1.0 - 0.5 * loss)) as u64
            } else if loss <= LOSS_INCREASE_THRESHOLD {
                let grown = (previous as f64 * INCREASE_FACTOR) as u64;
                // never grow past what the link has demonstrated plus headroom
                grown.min((acked_rate.max(previous) as f64 * 1.5) as u64)
            } else {
                previous
            };
            state.target = target.clamp(self.config.min_bitrate, self.config.max_bitrate);

            if state.target != previous {
                debug!(
                    previous_bps = previous,
                    target_bps = state.target,
                    loss = loss,
                    "bandwidth estimate updated"
                );
                Some(state.target)
            } else {
                None
            }
        };

        if let Some(target) = changed {
            let on_change = self.on_change.lock();
            if let Some(f) = on_change.as_ref() {
                f(target);
            }
        }
    }
}

impl BandwidthEstimator for SendSideBandwidthEstimator {
    fn target_bitrate(&self) -> u64 {
        self.state.lock().target
    }

    fn on_target_bitrate_change(&self, f: Box<dyn Fn(u64) + Send + Sync>) {
        *self.on_change.lock() = Some(f);
    }
}

/// Flatten a TWCC report into (sequence, received) pairs
pub(crate) fn walk_feedback(cc: &TransportLayerCc) -> Vec<(u16, bool)> {
    let mut out = Vec::with_capacity(cc.packet_status_count as usize);
    let mut seq = cc.base_sequence_number;
    let mut remaining = cc.packet_status_count;

    let mut push = |seq: &mut u16, remaining: &mut u16, symbol: SymbolTypeTcc| {
        if *remaining == 0 {
            return;
        }
        out.push((*seq, symbol != SymbolTypeTcc::PacketNotReceived));
        *seq = seq.wrapping_add(1);
        *remaining -= 1;
    };

    for chunk in &cc.packet_chunks {
        match chunk {
            PacketStatusChunk::RunLengthChunk(run) => {
                for _ in 0..run.run_length {
                    push(&mut seq, &mut remaining, run.packet_status_symbol);
                }
            }
            PacketStatusChunk::StatusVectorChunk(vector) => {
                for symbol in &vector.symbol_list {
                    push(&mut seq, &mut remaining, *symbol);
                }
            }
        }
    }

    out
}

/// Builder installed into the interceptor registry for subscriber sessions
pub(crate) struct CongestionControlBuilder {
    config: CongestionControlConfig,
    on_new_estimator: Box<dyn Fn(Arc<SendSideBandwidthEstimator>) + Send + Sync>,
}

impl CongestionControlBuilder {
    pub(crate) fn new(
        config: CongestionControlConfig,
        on_new_estimator: Box<dyn Fn(Arc<SendSideBandwidthEstimator>) + Send + Sync>,
    ) -> Self {
        Self { config, on_new_estimator }
    }
}

impl InterceptorBuilder for CongestionControlBuilder {
    fn build(&self, _id: &str) -> IResult<Arc<dyn Interceptor + Send + Sync>> {
        let estimator = Arc::new(SendSideBandwidthEstimator::new(self.config.clone()));
        (self.on_new_estimator)(Arc::clone(&estimator));
        Ok(Arc::new(CongestionControlInterceptor { estimator }))
    }
}

struct CongestionControlInterceptor {
    estimator: Arc<SendSideBandwidthEstimator>,
}

#[async_trait]
impl Interceptor for CongestionControlInterceptor {
    async fn bind_rtcp_reader(
        &self,
        reader: Arc<dyn RTCPReader + Send + Sync>,
    ) -> Arc<dyn RTCPReader + Send + Sync> {
        Arc::new(FeedbackReader { parent: reader, estimator: Arc::clone(&self.estimator) })
    }

    async fn bind_rtcp_writer(
        &self,
        writer: Arc<dyn RTCPWriter + Send + Sync>,
    ) -> Arc<dyn RTCPWriter + Send + Sync> {
        writer
    }

    async fn bind_local_stream(
        &self,
        info: &StreamInfo,
        writer: Arc<dyn RTPWriter + Send + Sync>,
    ) -> Arc<dyn RTPWriter + Send + Sync> {
        let Some(ext_id) = info
            .rtp_header_extensions
            .iter()
            .find(|ext| ext.uri == TRANSPORT_CC_URI)
            .map(|ext| ext.id as u8)
        else {
            return writer;
        };
        Arc::new(SentRecorder { parent: writer, estimator: Arc::clone(&self.estimator), ext_id })
    }

    async fn unbind_local_stream(&self, _info: &StreamInfo) {}

    async fn bind_remote_stream(
        &self,
        _info: &StreamInfo,
        reader: Arc<dyn RTPReader + Send + Sync>,
    ) -> Arc<dyn RTPReader + Send + Sync> {
        reader
    }

    async fn unbind_remote_stream(&self, _info: &StreamInfo) {}

    async fn close(&self) -> IResult<()> {
        Ok(())
    }
}

struct FeedbackReader {
    parent: Arc<dyn RTCPReader + Send + Sync>,
    estimator: Arc<SendSideBandwidthEstimator>,
}

#[async_trait]
impl RTCPReader for FeedbackReader {
    async fn read(
        &self,
        buf: &mut [u8],
        attributes: &Attributes,
    ) -> IResult<(Vec<Box<dyn webrtc::rtcp::packet::Packet + Send + Sync>>, Attributes)> {
        let (packets, attributes) = self.parent.read(buf, attributes).await?;
        for packet in &packets {
            if let Some(cc) = packet.as_any().downcast_ref::<TransportLayerCc>() {
                self.estimator.process_feedback(cc, Instant::now());
            }
        }
        Ok((packets, attributes))
    }
}

struct SentRecorder {
    parent: Arc<dyn RTPWriter + Send + Sync>,
    estimator: Arc<SendSideBandwidthEstimator>,
    ext_id: u8,
}

#[async_trait]
impl RTPWriter for SentRecorder {
    async fn write(
        &self,
        pkt: &webrtc::rtp::packet::Packet,
        attributes: &Attributes,
    ) -> IResult<usize> {
        if let Some(payload) = pkt.header.get_extension(self.ext_id) {
            if payload.len() >= 2 {
                let seq = u16::from_be_bytes([payload[0], payload[1]]);
                let size = pkt.header.marshal_size() + pkt.payload.len();
                self.estimator.record_sent(seq, size, Instant::now());
            }
        }
        self.parent.write(pkt, attributes).await
    }
}
