//! SDP helpers for negotiation
//!
//! Pure functions over the stack's parsed session description. Credential and
//! fingerprint extraction follow the collect-and-check discipline: gather the
//! attribute from the session level and every m-line, then require a single
//! consistent value.

use tracing::warn;
use webrtc::dtls_transport::dtls_role::DTLSRole;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::sdp::description::media::MediaDescription;
use webrtc::sdp::description::session::{
    SessionDescription, ATTR_KEY_CANDIDATE, ATTR_KEY_CONNECTION_SETUP, ATTR_KEY_MID,
};
use webrtc::sdp::util::ConnectionRole;

use crate::error::{Error, Result};

const ATTR_KEY_ICE_UFRAG: &str = "ice-ufrag";
const ATTR_KEY_ICE_PWD: &str = "ice-pwd";
const ATTR_KEY_FINGERPRINT: &str = "fingerprint";

/// Extract the ICE (ufrag, pwd) pair from session- and media-level attributes
pub fn extract_ice_credential(desc: &SessionDescription) -> Result<(String, String)> {
    let mut ufrags = Vec::new();
    let mut pwds = Vec::new();

    if let Some(ufrag) = desc.attribute(ATTR_KEY_ICE_UFRAG) {
        ufrags.push(ufrag.clone());
    }
    if let Some(pwd) = desc.attribute(ATTR_KEY_ICE_PWD) {
        pwds.push(pwd.clone());
    }

    for m in &desc.media_descriptions {
        if let Some(ufrag) = m.attribute(ATTR_KEY_ICE_UFRAG).flatten() {
            ufrags.push(ufrag.to_owned());
        }
        if let Some(pwd) = m.attribute(ATTR_KEY_ICE_PWD).flatten() {
            pwds.push(pwd.to_owned());
        }
    }

    if ufrags.is_empty() {
        return Err(Error::MissingIceUfrag);
    }
    if pwds.is_empty() {
        return Err(Error::MissingIcePwd);
    }
    if ufrags.iter().any(|u| *u != ufrags[0]) {
        return Err(Error::ConflictingIceUfrag);
    }
    if pwds.iter().any(|p| *p != pwds[0]) {
        return Err(Error::ConflictingIcePwd);
    }

    Ok((ufrags.swap_remove(0), pwds.swap_remove(0)))
}

/// Extract the DTLS certificate (algorithm, hash) from the description
pub fn extract_fingerprint(desc: &SessionDescription) -> Result<(String, String)> {
    let mut fingerprints = Vec::new();

    if let Some(fingerprint) = desc.attribute(ATTR_KEY_FINGERPRINT) {
        fingerprints.push(fingerprint.clone());
    }
    for m in &desc.media_descriptions {
        if let Some(fingerprint) = m.attribute(ATTR_KEY_FINGERPRINT).flatten() {
            fingerprints.push(fingerprint.to_owned());
        }
    }

    if fingerprints.is_empty() {
        return Err(Error::MissingFingerprint);
    }
    if fingerprints.iter().any(|f| *f != fingerprints[0]) {
        return Err(Error::ConflictingFingerprints);
    }

    let mut parts = fingerprints[0].split(' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(algorithm), Some(hash), None) => Ok((algorithm.to_owned(), hash.to_owned())),
        _ => Err(Error::InvalidFingerprint),
    }
}

/// Determine which DTLS role the description's owner took
///
/// `setup:active` answers as the DTLS client, `setup:passive` as the server.
/// With no `setup` attribute the default behaviour of answerers applies:
/// browsers pick the client role, so assume client. An ICE-lite remote would
/// make the stack answer as server instead, which is exactly the asymmetry
/// this helper papers over when reconstructing a migrated session.
pub fn extract_dtls_role(desc: &SessionDescription) -> DTLSRole {
    for m in &desc.media_descriptions {
        let Some(setup) = m.attribute(ATTR_KEY_CONNECTION_SETUP).flatten() else {
            continue;
        };
        if setup == ConnectionRole::Active.to_string() {
            return DTLSRole::Client;
        }
        if setup == ConnectionRole::Passive.to_string() {
            return DTLSRole::Server;
        }
    }

    DTLSRole::Client
}

/// The m-line's mid attribute, if present
pub fn get_mid(media: &MediaDescription) -> Option<&str> {
    media.attribute(ATTR_KEY_MID).flatten()
}

/// Replace every fingerprint attribute, session- and media-level
pub fn rewrite_fingerprint(desc: &mut SessionDescription, algorithm: &str, hash: &str) {
    let line = format!("{algorithm} {hash}");
    for a in &mut desc.attributes {
        if a.key == ATTR_KEY_FINGERPRINT {
            a.value = Some(line.clone());
        }
    }
    for m in &mut desc.media_descriptions {
        for a in &mut m.attributes {
            if a.key == ATTR_KEY_FINGERPRINT {
                a.value = Some(line.clone());
            }
        }
    }
}

/// Drop non-TCP candidate attributes when `prefer_tcp` is set
///
/// Every other attribute passes through verbatim. A description that fails to
/// parse is returned unchanged; filtering is best-effort.
pub fn filter_candidates(sd: RTCSessionDescription, prefer_tcp: bool) -> RTCSessionDescription {
    if !prefer_tcp {
        return sd;
    }

    let mut parsed = match sd.unmarshal() {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(error = %err, "could not parse SDP to filter candidates");
            return sd;
        }
    };

    let keep = |a: &webrtc::sdp::description::common::Attribute| {
        a.key != ATTR_KEY_CANDIDATE || a.value.as_deref().is_some_and(|v| v.contains("tcp"))
    };
    parsed.attributes.retain(keep);
    for m in &mut parsed.media_descriptions {
        m.attributes.retain(keep);
    }

    let filtered = parsed.marshal();
    let rebuilt = match sd.sdp_type {
        RTCSdpType::Offer => RTCSessionDescription::offer(filtered),
        RTCSdpType::Answer => RTCSessionDescription::answer(filtered),
        RTCSdpType::Pranswer => RTCSessionDescription::pranswer(filtered),
        _ => return sd,
    };
    match rebuilt {
        Ok(out) => out,
        Err(err) => {
            warn!(error = %err, "could not rebuild SDP after filtering candidates");
            sd
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn parse(raw: &str) -> SessionDescription {
        SessionDescription::unmarshal(&mut Cursor::new(raw.as_bytes())).expect("valid SDP")
    }

    fn sdp_with(session_attrs: &[&str], media_sections: &[&[&str]]) -> String {
        let mut out = String::from("v=0\r\no=- 884287 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n");
        for a in session_attrs {
            out.push_str(&format!("a={a}\r\n"));
        }
        for attrs in media_sections {
            out.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\nc=IN IP4 0.0.0.0\r\n");
            for a in *attrs {
                out.push_str(&format!("a={a}\r\n"));
            }
        }
        out
    }

    #[test]
    fn ice_credential_from_media_level() {
        let desc = parse(&sdp_with(
            &[],
            &[&["ice-ufrag:abcd", "ice-pwd:efghijklmnop"], &["ice-ufrag:abcd", "ice-pwd:efghijklmnop"]],
        ));
        let (ufrag, pwd) = extract_ice_credential(&desc).unwrap();
        assert_eq!(ufrag, "abcd");
        assert_eq!(pwd, "efghijklmnop");
    }

    #[test]
    fn ice_credential_conflict_across_levels() {
        let desc = parse(&sdp_with(
            &["ice-ufrag:aaaa", "ice-pwd:efghijklmnop"],
            &[&["ice-ufrag:bbbb", "ice-pwd:efghijklmnop"]],
        ));
        assert!(matches!(extract_ice_credential(&desc), Err(Error::ConflictingIceUfrag)));
    }

    #[test]
    fn ice_credential_missing() {
        let desc = parse(&sdp_with(&[], &[&["ice-pwd:efghijklmnop"]]));
        assert!(matches!(extract_ice_credential(&desc), Err(Error::MissingIceUfrag)));
        let desc = parse(&sdp_with(&[], &[&["ice-ufrag:abcd"]]));
        assert!(matches!(extract_ice_credential(&desc), Err(Error::MissingIcePwd)));
    }

    #[test]
    fn fingerprint_roundtrip_after_rewrite() {
        let mut desc = parse(&sdp_with(
            &["fingerprint:sha-256 AA:BB:CC"],
            &[&["fingerprint:sha-256 AA:BB:CC"], &["fingerprint:sha-256 AA:BB:CC"]],
        ));
        rewrite_fingerprint(&mut desc, "sha-512", "11:22:33");
        let (algorithm, hash) = extract_fingerprint(&desc).unwrap();
        assert_eq!(algorithm, "sha-512");
        assert_eq!(hash, "11:22:33");
    }

    #[test]
    fn fingerprint_conflicts_and_shape() {
        let desc = parse(&sdp_with(
            &["fingerprint:sha-256 AA:BB"],
            &[&["fingerprint:sha-256 AA:CC"]],
        ));
        assert!(matches!(extract_fingerprint(&desc), Err(Error::ConflictingFingerprints)));

        let desc = parse(&sdp_with(&["fingerprint:sha-256"], &[]));
        assert!(matches!(extract_fingerprint(&desc), Err(Error::InvalidFingerprint)));

        let desc = parse(&sdp_with(&[], &[&[]]));
        assert!(matches!(extract_fingerprint(&desc), Err(Error::MissingFingerprint)));
    }

    #[test]
    fn fingerprint_with_empty_hash_token_is_accepted() {
        use webrtc::sdp::description::common::Attribute;

        // exactly two space-separated tokens, the second empty
        let mut desc = parse(&sdp_with(&[], &[]));
        desc.attributes.push(Attribute {
            key: "fingerprint".to_owned(),
            value: Some("sha-256 ".to_owned()),
        });

        let (algorithm, hash) = extract_fingerprint(&desc).unwrap();
        assert_eq!(algorithm, "sha-256");
        assert_eq!(hash, "");
    }

    #[test]
    fn dtls_role_from_setup_attribute() {
        let desc = parse(&sdp_with(&[], &[&["setup:active"]]));
        assert_eq!(extract_dtls_role(&desc), DTLSRole::Client);

        let desc = parse(&sdp_with(&[], &[&["setup:passive"]]));
        assert_eq!(extract_dtls_role(&desc), DTLSRole::Server);

        let desc = parse(&sdp_with(&[], &[&[]]));
        assert_eq!(extract_dtls_role(&desc), DTLSRole::Client);
    }

    #[test]
    fn mid_lookup() {
        let desc = parse(&sdp_with(&[], &[&["mid:7"], &[]]));
        assert_eq!(get_mid(&desc.media_descriptions[0]), Some("7"));
        assert_eq!(get_mid(&desc.media_descriptions[1]), None);
    }

    #[test]
    fn candidate_filter_is_identity_without_preference() {
        let raw = sdp_with(
            &[],
            &[&[
                "ice-ufrag:abcd",
                "ice-pwd:efghijklmnop",
                "candidate:1 1 udp 2130706431 10.0.0.1 50000 typ host",
                "candidate:2 1 tcp 1671430143 10.0.0.1 9 typ host tcptype active",
            ]],
        );
        let offer = RTCSessionDescription::offer(raw.clone()).unwrap();
        let out = filter_candidates(offer, false);
        assert_eq!(out.sdp, raw);
    }

    #[test]
    fn candidate_filter_keeps_only_tcp() {
        let raw = sdp_with(
            &[],
            &[&[
                "ice-ufrag:abcd",
                "ice-pwd:efghijklmnop",
                "candidate:1 1 udp 2130706431 10.0.0.1 50000 typ host",
                "candidate:2 1 tcp 1671430143 10.0.0.1 9 typ host tcptype active",
                "mid:0",
            ]],
        );
        let offer = RTCSessionDescription::offer(raw).unwrap();
        let out = filter_candidates(offer, true);
        assert!(!out.sdp.contains("udp 2130706431"));
        assert!(out.sdp.contains("tcp 1671430143"));
        // non-candidate attributes survive
        assert!(out.sdp.contains("a=mid:0"));
    }
}
