//! Stream protocol catalog and selection policy

use serde::{Deserialize, Serialize};

/// Wire protocol used to deliver the stream to the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamProtocol {
    #[serde(rename = "hls")]
    Hls,
    #[serde(rename = "ll-hls")]
    LlHls,
    #[serde(rename = "webrtc")]
    WebRtc,
    #[serde(rename = "webrtc-tcp")]
    WebRtcTcp,
    #[serde(rename = "webrtc-udp")]
    WebRtcUdp,
}

/// Protocol family, selects the transport variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFamily {
    WebRtc,
    Hls,
}

/// ICE candidate transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateTransport {
    Udp,
    Tcp,
}

impl CandidateTransport {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateTransport::Udp => "udp",
            CandidateTransport::Tcp => "tcp",
        }
    }

    /// Parse a transport token such as `udp`, `TCP` or `udp4`.
    pub fn from_token(token: &str) -> Option<Self> {
        let token = token.to_ascii_lowercase();
        if token.starts_with("udp") {
            Some(CandidateTransport::Udp)
        } else if token.starts_with("tcp") {
            Some(CandidateTransport::Tcp)
        } else {
            None
        }
    }
}

impl std::fmt::Display for CandidateTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CandidateTransport::Udp => write!(f, "UDP"),
            CandidateTransport::Tcp => write!(f, "TCP"),
        }
    }
}

/// Default auto-selection order
pub const DEFAULT_PRIORITY: [StreamProtocol; 5] = [
    StreamProtocol::LlHls,
    StreamProtocol::WebRtc,
    StreamProtocol::Hls,
    StreamProtocol::WebRtcUdp,
    StreamProtocol::WebRtcTcp,
];

impl StreamProtocol {
    pub const ALL: [StreamProtocol; 5] = [
        StreamProtocol::Hls,
        StreamProtocol::LlHls,
        StreamProtocol::WebRtc,
        StreamProtocol::WebRtcTcp,
        StreamProtocol::WebRtcUdp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamProtocol::Hls => "hls",
            StreamProtocol::LlHls => "ll-hls",
            StreamProtocol::WebRtc => "webrtc",
            StreamProtocol::WebRtcTcp => "webrtc-tcp",
            StreamProtocol::WebRtcUdp => "webrtc-udp",
        }
    }

    /// Parse a persisted or user-supplied value. Unknown values yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == value.trim())
    }

    pub fn family(&self) -> ProtocolFamily {
        match self {
            StreamProtocol::Hls | StreamProtocol::LlHls => ProtocolFamily::Hls,
            StreamProtocol::WebRtc | StreamProtocol::WebRtcTcp | StreamProtocol::WebRtcUdp => {
                ProtocolFamily::WebRtc
            }
        }
    }

    /// Candidate transport the answer and trickle candidates are restricted to
    pub fn candidate_transport(&self) -> Option<CandidateTransport> {
        match self {
            StreamProtocol::WebRtcTcp => Some(CandidateTransport::Tcp),
            StreamProtocol::WebRtcUdp => Some(CandidateTransport::Udp),
            _ => None,
        }
    }

    pub fn is_low_latency_hls(&self) -> bool {
        matches!(self, StreamProtocol::LlHls)
    }

    /// Variants only offered in the menu when secret options are enabled
    pub fn is_transport_constrained(&self) -> bool {
        self.candidate_transport().is_some()
    }
}

impl std::fmt::Display for StreamProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StreamProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown stream protocol: {}", s))
    }
}

/// First entry of `priority` that is present in `supported`.
pub fn select_best(
    priority: &[StreamProtocol],
    supported: &[StreamProtocol],
) -> Option<StreamProtocol> {
    priority.iter().copied().find(|p| supported.contains(p))
}

/// Keep a preferred protocol if it is still supported, otherwise select.
pub fn resolve_preference(
    preferred: Option<StreamProtocol>,
    priority: &[StreamProtocol],
    supported: &[StreamProtocol],
) -> Option<StreamProtocol> {
    match preferred {
        Some(p) if supported.contains(&p) => Some(p),
        _ => select_best(priority, supported),
    }
}

/// Protocols listed in the latency menu.
///
/// Transport-constrained WebRTC variants are hidden unless `secret` is set,
/// in which case the unconstrained variant is hidden instead.
pub fn visible_protocols(valid: &[StreamProtocol], secret: bool) -> Vec<StreamProtocol> {
    StreamProtocol::ALL
        .into_iter()
        .filter(|p| valid.contains(p))
        .filter(|p| {
            if secret {
                *p != StreamProtocol::WebRtc
            } else {
                !p.is_transport_constrained()
            }
        })
        .collect()
}
