use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid signaling message: {0}")]
    InvalidMessage(String),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Signaling channel closed")]
    ChannelClosed,

    #[error("Session registry stopped")]
    RegistryStopped,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
