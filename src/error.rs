use serde::Serialize;
use thiserror::Error;

use crate::protocol::StreamProtocol;
use crate::transport::ReaderState;

/// Player-wide error type
#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("Protocol {0} is not available for this stream")]
    ProtocolUnavailable(StreamProtocol),

    #[error("Stream offline (HTTP {status})")]
    StreamUnavailable { status: u16 },

    #[error("{stage} failed with HTTP {status}")]
    HttpStatus { stage: &'static str, status: u16 },

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Invalid SDP: {0}")]
    Sdp(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    Url(String),

    #[error("Peer connection error: {0}")]
    Peer(String),

    #[error("Peer Connection Closed")]
    ConnectionClosed,

    #[error("Stream did not load within {0} ms")]
    LoadTimeout(u64),

    #[error("HLS {kind} error: {details}")]
    Hls { kind: String, details: String },

    #[error("Video stalled")]
    Stalled,

    #[error("Invalid state: {0}")]
    InvalidState(ReaderState),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Error taxonomy used for recovery decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Protocol or stream not offered by the backend right now
    Unavailable,
    /// Malformed SDP or a non-success HTTP exchange
    Negotiation,
    /// Connection termination, load timeout or stall after negotiation
    Runtime,
    /// Anything else
    Unknown,
}

impl PlayerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlayerError::ProtocolUnavailable(_) | PlayerError::StreamUnavailable { .. } => {
                ErrorKind::Unavailable
            }
            PlayerError::HttpStatus { .. }
            | PlayerError::Negotiation(_)
            | PlayerError::Sdp(_)
            | PlayerError::Http(_)
            | PlayerError::Url(_)
            | PlayerError::Peer(_) => ErrorKind::Negotiation,
            PlayerError::ConnectionClosed
            | PlayerError::LoadTimeout(_)
            | PlayerError::Hls { .. }
            | PlayerError::Stalled => ErrorKind::Runtime,
            PlayerError::InvalidState(_)
            | PlayerError::Config(_)
            | PlayerError::Io(_)
            | PlayerError::Serialization(_)
            | PlayerError::Other(_) => ErrorKind::Unknown,
        }
    }

    /// Whether the orchestrator should schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, PlayerError::Config(_))
    }

    /// Message shown to the viewer while the player retries
    pub fn notice(&self) -> PlayerNotice {
        match self.kind() {
            ErrorKind::Unavailable => PlayerNotice::Offline,
            ErrorKind::Runtime
                if matches!(self, PlayerError::LoadTimeout(_) | PlayerError::Stalled) =>
            {
                PlayerNotice::Offline
            }
            ErrorKind::Unknown if matches!(self, PlayerError::Other(_)) => {
                PlayerNotice::Retrying(self.to_string())
            }
            ErrorKind::Unknown => PlayerNotice::Retrying(PlayerNotice::UNKNOWN_ERROR.to_string()),
            _ => PlayerNotice::Retrying(self.to_string()),
        }
    }
}

/// User-visible player notice
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "message", rename_all = "snake_case")]
pub enum PlayerNotice {
    /// Initial state, nothing attempted yet
    Loading,
    /// Stream not ready or gone; transient
    Offline,
    /// Attempt failed; transient
    Retrying(String),
    /// No protocol is supported by both platform and server; persistent
    DeviceUnsupported,
}

impl PlayerNotice {
    pub const UNKNOWN_ERROR: &'static str = "Unknown error";

    /// Only the exhausted-protocols notice stays up without a retry hint.
    pub fn is_persistent(&self) -> bool {
        matches!(self, PlayerNotice::DeviceUnsupported)
    }
}

impl std::fmt::Display for PlayerNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlayerNotice::Loading => write!(f, "Loading stream..."),
            PlayerNotice::Offline => write!(f, "Stream is offline, retrying..."),
            PlayerNotice::Retrying(msg) => write!(f, "{}, retrying...", msg),
            PlayerNotice::DeviceUnsupported => {
                write!(f, "This device does not support any available stream protocol")
            }
        }
    }
}

/// Result type alias for the player
pub type Result<T> = std::result::Result<T, PlayerError>;
