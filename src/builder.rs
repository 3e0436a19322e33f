//! Peer-connection construction for publisher and subscriber transports

use std::sync::Arc;
use std::time::Duration;

use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::interceptor::registry::Registry;
use webrtc::interceptor::twcc::sender::Sender as TwccSender;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpHeaderExtensionCapability, RTPCodecType,
};

use crate::config::{CodecSpec, DirectionConfig, RtcConfig};
use crate::congestion::{CongestionControlBuilder, SendSideBandwidthEstimator};
use crate::error::Result;
use crate::session::WebRtcPeerSession;
use crate::simulcast::SimulcastRebindBuilder;
use crate::types::{ProtocolVersion, SignalTarget, SimulcastTracks};

const DTLS_RETRANSMISSION_INTERVAL: Duration = Duration::from_millis(100);

// disconnected is kept short enough for ice-lite against Firefox; failed and
// keepalive follow the stack defaults
const ICE_DISCONNECTED_TIMEOUT: Duration = Duration::from_secs(10);
const ICE_FAILED_TIMEOUT: Duration = Duration::from_secs(25);
const ICE_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);

pub(crate) type OnBandwidthEstimator =
    Box<dyn Fn(Arc<SendSideBandwidthEstimator>) + Send + Sync>;

/// Build a configured peer session for one transport direction
pub(crate) async fn build_peer_session(
    target: SignalTarget,
    protocol_version: ProtocolVersion,
    config: &RtcConfig,
    enabled_codecs: &[CodecSpec],
    sim_tracks: &SimulcastTracks,
    on_bandwidth_estimator: OnBandwidthEstimator,
) -> Result<WebRtcPeerSession> {
    let direction = match target {
        SignalTarget::Publisher => &config.publisher,
        SignalTarget::Subscriber => &config.subscriber,
    };

    let media_engine = build_media_engine(enabled_codecs, direction)?;

    let mut setting_engine = SettingEngine::default();
    // SRTP/SRTCP replay protection is off on purpose. Without RTX support in
    // the stack, a client that probes bandwidth by re-sending older packets
    // (Firefox does) gets those probes rejected as replays, the probe never
    // completes, and read buffers fill up. Re-enable once RTX lands.
    setting_engine.disable_srtp_replay_protection(true);
    setting_engine.disable_srtcp_replay_protection(true);
    setting_engine.set_lite(config.ice_lite && protocol_version.supports_ice_lite());
    setting_engine.set_dtls_retransmission_interval(DTLS_RETRANSMISSION_INTERVAL);
    setting_engine.set_ice_timeouts(
        Some(ICE_DISCONNECTED_TIMEOUT),
        Some(ICE_FAILED_TIMEOUT),
        Some(ICE_KEEPALIVE_INTERVAL),
    );

    let mut registry = Registry::new();
    if target == SignalTarget::Subscriber
        && config.congestion_control.enabled
        && direction.rtp_header_extension.has_transport_cc()
    {
        registry.add(Box::new(CongestionControlBuilder::new(
            config.congestion_control.clone(),
            on_bandwidth_estimator,
        )));
        registry.add(Box::new(TwccSender::builder()));
    }
    if !sim_tracks.is_empty() {
        registry.add(Box::new(SimulcastRebindBuilder::new(sim_tracks.clone())));
    }

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_setting_engine(setting_engine)
        .with_interceptor_registry(registry)
        .build();
    let pc = Arc::new(api.new_peer_connection(config.configuration.clone()).await?);

    // migration probes need an identically configured engine later on
    let codecs = enabled_codecs.to_vec();
    let direction = direction.clone();
    let engine_factory = Arc::new(move || build_media_engine(&codecs, &direction));

    Ok(WebRtcPeerSession::new(pc, engine_factory))
}

fn build_media_engine(
    enabled_codecs: &[CodecSpec],
    direction: &DirectionConfig,
) -> Result<MediaEngine> {
    let mut media_engine = MediaEngine::default();

    for codec in enabled_codecs {
        let kind = if codec.is_audio() { RTPCodecType::Audio } else { RTPCodecType::Video };
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: codec.mime_type.clone(),
                    clock_rate: codec.clock_rate,
                    channels: codec.channels,
                    sdp_fmtp_line: codec.fmtp_line.clone(),
                    rtcp_feedback: vec![],
                },
                payload_type: codec.payload_type,
                ..Default::default()
            },
            kind,
        )?;
    }

    for uri in &direction.rtp_header_extension.audio {
        media_engine.register_header_extension(
            RTCRtpHeaderExtensionCapability { uri: uri.clone() },
            RTPCodecType::Audio,
            None,
        )?;
    }
    for uri in &direction.rtp_header_extension.video {
        media_engine.register_header_extension(
            RTCRtpHeaderExtensionCapability { uri: uri.clone() },
            RTPCodecType::Video,
            None,
        )?;
    }

    Ok(media_engine)
}
