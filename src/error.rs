use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SDP has no ice-ufrag attribute")]
    MissingIceUfrag,

    #[error("SDP has no ice-pwd attribute")]
    MissingIcePwd,

    #[error("SDP carries conflicting ice-ufrag values")]
    ConflictingIceUfrag,

    #[error("SDP carries conflicting ice-pwd values")]
    ConflictingIcePwd,

    #[error("SDP has no fingerprint attribute")]
    MissingFingerprint,

    #[error("SDP carries conflicting fingerprint values")]
    ConflictingFingerprints,

    #[error("SDP fingerprint attribute is malformed")]
    InvalidFingerprint,

    #[error("media description has no mid attribute")]
    MissingMid,

    #[error("ICE restart requested without a settled local description")]
    IceRestartWithoutLocalSdp,

    #[error("{0} not available")]
    Unavailable(&'static str),

    #[error("WebRTC error: {0}")]
    Webrtc(#[from] webrtc::Error),

    #[error("SDP error: {0}")]
    Sdp(#[from] webrtc::sdp::Error),

    #[error("interceptor error: {0}")]
    Interceptor(#[from] webrtc::interceptor::Error),
}
