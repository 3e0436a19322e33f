//! Re-association of unsignaled simulcast streams
//!
//! Some clients start simulcast layers before the SDP naming them arrives, or
//! omit MID/RID header extensions after the first packets. When the session
//! layer already knows which SSRC belongs to which track it hands the builder
//! a hint map, and this interceptor stamps the missing extensions onto
//! incoming packets so the stack can route them to the right transceiver.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;
use webrtc::interceptor::stream_info::StreamInfo;
use webrtc::interceptor::{
    Attributes, Interceptor, InterceptorBuilder, RTCPReader, RTCPWriter, RTPReader, RTPWriter,
};
use webrtc::sdp::extmap::{SDES_MID_URI, SDES_RTP_STREAM_ID_URI};

use crate::types::{SimulcastTrackInfo, SimulcastTracks};

type IResult<T> = std::result::Result<T, webrtc::interceptor::Error>;

pub(crate) struct SimulcastRebindBuilder {
    hints: SimulcastTracks,
}

impl SimulcastRebindBuilder {
    pub(crate) fn new(hints: SimulcastTracks) -> Self {
        Self { hints }
    }
}

impl InterceptorBuilder for SimulcastRebindBuilder {
    fn build(&self, _id: &str) -> IResult<Arc<dyn Interceptor + Send + Sync>> {
        Ok(Arc::new(SimulcastRebindInterceptor { hints: self.hints.clone() }))
    }
}

struct SimulcastRebindInterceptor {
    hints: SimulcastTracks,
}

#[async_trait]
impl Interceptor for SimulcastRebindInterceptor {
    async fn bind_rtcp_reader(
        &self,
        reader: Arc<dyn RTCPReader + Send + Sync>,
    ) -> Arc<dyn RTCPReader + Send + Sync> {
        reader
    }

    async fn bind_rtcp_writer(
        &self,
        writer: Arc<dyn RTCPWriter + Send + Sync>,
    ) -> Arc<dyn RTCPWriter + Send + Sync> {
        writer
    }

    async fn bind_local_stream(
        &self,
        _info: &StreamInfo,
        writer: Arc<dyn RTPWriter + Send + Sync>,
    ) -> Arc<dyn RTPWriter + Send + Sync> {
        writer
    }

    async fn unbind_local_stream(&self, _info: &StreamInfo) {}

    async fn bind_remote_stream(
        &self,
        info: &StreamInfo,
        reader: Arc<dyn RTPReader + Send + Sync>,
    ) -> Arc<dyn RTPReader + Send + Sync> {
        let Some(hint) = self.hints.get(&info.ssrc) else {
            return reader;
        };

        let ext_id = |uri: &str| {
            info.rtp_header_extensions
                .iter()
                .find(|ext| ext.uri == uri)
                .map(|ext| ext.id as u8)
        };
        let (Some(mid_id), Some(rid_id)) = (ext_id(SDES_MID_URI), ext_id(SDES_RTP_STREAM_ID_URI))
        else {
            return reader;
        };

        Arc::new(RebindReader { parent: reader, hint: hint.clone(), mid_id, rid_id })
    }

    async fn unbind_remote_stream(&self, _info: &StreamInfo) {}

    async fn close(&self) -> IResult<()> {
        Ok(())
    }
}

struct RebindReader {
    parent: Arc<dyn RTPReader + Send + Sync>,
    hint: SimulcastTrackInfo,
    mid_id: u8,
    rid_id: u8,
}

#[async_trait]
impl RTPReader for RebindReader {
    async fn read(
        &self,
        buf: &mut [u8],
        attributes: &Attributes,
    ) -> IResult<(webrtc::rtp::packet::Packet, Attributes)> {
        let (mut pkt, attributes) = self.parent.read(buf, attributes).await?;

        if pkt.header.get_extension(self.mid_id).is_none() {
            if let Err(err) = pkt
                .header
                .set_extension(self.mid_id, Bytes::copy_from_slice(self.hint.mid.as_bytes()))
            {
                warn!(
                    ssrc = pkt.header.ssrc,
                    mid = %self.hint.mid,
                    error = %err,
                    "could not stamp mid extension on simulcast stream"
                );
            }
        }
        if pkt.header.get_extension(self.rid_id).is_none() {
            if let Err(err) = pkt
                .header
                .set_extension(self.rid_id, Bytes::copy_from_slice(self.hint.rid.as_bytes()))
            {
                warn!(
                    ssrc = pkt.header.ssrc,
                    rid = %self.hint.rid,
                    error = %err,
                    "could not stamp rid extension on simulcast stream"
                );
            }
        }

        Ok((pkt, attributes))
    }
}
