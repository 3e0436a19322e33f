//! Migration priming
//!
//! When a client reconnects to a different server instance, the fresh
//! peer-connection would normally open with a full renegotiation and a new
//! DTLS identity, interrupting media. Priming reconstructs enough of the old
//! session that the next offer lines up with the answer the client already
//! holds: same m-line count and order, same mids, same fingerprint.

use std::sync::Arc;

use tracing::debug;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::sdp::description::session::SessionDescription;

use crate::error::{Error, Result};
use crate::sdp::{extract_dtls_role, extract_fingerprint, get_mid, rewrite_fingerprint};
use crate::session::PeerSession;

/// Align `session` with a previous answer produced by another instance
///
/// Walks the answer's media descriptions in order. Audio and video m-lines
/// become stopped receive-only transceivers pinned to the answer's mids; an
/// application m-line triggers the data-channel stickying below; anything
/// else is skipped.
pub(crate) async fn prime_with_previous_answer(
    session: &Arc<dyn PeerSession>,
    previous_answer: &RTCSessionDescription,
) -> Result<()> {
    let parsed = previous_answer.unmarshal()?;

    for media in &parsed.media_descriptions {
        let kind = match media.media_name.media.as_str() {
            "audio" => RTPCodecType::Audio,
            "video" => RTPCodecType::Video,
            "application" => {
                sticky_data_channel(session, &parsed).await?;
                continue;
            }
            other => {
                debug!(media = other, "skipping unknown media in previous answer");
                continue;
            }
        };

        let mid = get_mid(media).ok_or(Error::MissingMid)?;
        session.add_stopped_receiver(kind, mid).await?;
    }

    Ok(())
}

/// Pin the data-channel m-line to its position in the previous answer
///
/// The stack always appends the data-channel m-line when the data channel is
/// created through its high-level API, but a legacy answer may carry it
/// earlier. Running one offer/answer round against a throwaway answer-only
/// peer makes the real peer-connection adopt the answer's m-line layout while
/// the walk above has only added the m-lines preceding the data channel.
/// Rewriting the throwaway's fingerprint to the client's keeps the DTLS
/// session verifiable after migration.
async fn sticky_data_channel(
    session: &Arc<dyn PeerSession>,
    previous_answer: &SessionDescription,
) -> Result<()> {
    let (algorithm, hash) = extract_fingerprint(previous_answer)?;

    let offer = session.create_offer(None).await?;
    session.set_local_description(offer.clone()).await?;

    let probe = session.spawn_answer_session(extract_dtls_role(previous_answer)).await?;
    let result = async {
        probe.set_remote_description(offer).await?;
        let answer = probe.create_answer().await?;

        let mut parsed_answer = answer.unmarshal()?;
        rewrite_fingerprint(&mut parsed_answer, &algorithm, &hash);
        let rewritten = RTCSessionDescription::answer(parsed_answer.marshal())?;

        session.set_remote_description(rewritten).await
    }
    .await;

    let _ = probe.close().await;
    result
}
