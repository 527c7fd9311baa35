use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{PlayerError, Result};
use crate::protocol::{StreamProtocol, DEFAULT_PRIORITY};

/// Main player configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Stream URLs advertised by the backend
    pub endpoints: StreamEndpoints,
    /// Credentials sent with every signaling and playlist request
    pub credentials: Option<Credentials>,
    /// Delay before retrying after a failure (ms)
    pub retry_interval_ms: u64,
    /// Interval between stats samples (ms)
    pub stats_refresh_interval_ms: u64,
    /// Max entries in a graph history
    pub stats_max_history: usize,
    /// Duration after which a waiting/stalled video is declared dead (ms)
    pub stall_timeout_ms: u64,
    /// Auto-selection order
    pub protocol_priority: Vec<StreamProtocol>,
    /// List the TCP/UDP-only WebRTC variants in the protocol menu
    pub show_transport_variants: bool,
    /// HLS player settings
    pub hls: HlsConfig,
    /// WebRTC signaling settings
    pub webrtc: WebRtcConfig,
    /// Decoding capabilities of the sink
    pub decoders: DecoderConfig,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            endpoints: StreamEndpoints::default(),
            credentials: None,
            retry_interval_ms: 2000,
            stats_refresh_interval_ms: 1500,
            stats_max_history: 50,
            stall_timeout_ms: 8000,
            protocol_priority: DEFAULT_PRIORITY.to_vec(),
            show_transport_variants: false,
            hls: HlsConfig::default(),
            webrtc: WebRtcConfig::default(),
            decoders: DecoderConfig::default(),
        }
    }
}

impl PlayerConfig {
    /// Reject values that would spin the retry loop or break selection
    pub fn validate(&self) -> Result<()> {
        if self.retry_interval_ms == 0 {
            return Err(PlayerError::Config("retry_interval_ms must be > 0".into()));
        }
        if self.stall_timeout_ms == 0 {
            return Err(PlayerError::Config("stall_timeout_ms must be > 0".into()));
        }
        if self.stats_refresh_interval_ms == 0 {
            return Err(PlayerError::Config(
                "stats_refresh_interval_ms must be > 0".into(),
            ));
        }
        if self.stats_max_history == 0 {
            return Err(PlayerError::Config("stats_max_history must be > 0".into()));
        }
        if self.protocol_priority.is_empty() {
            return Err(PlayerError::Config("protocol_priority is empty".into()));
        }
        if self.hls.load_timeout_ms == 0 {
            return Err(PlayerError::Config("hls.load_timeout_ms must be > 0".into()));
        }
        Ok(())
    }
}

/// Stream URLs for one path
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamEndpoints {
    /// WHEP endpoint
    pub webrtc_url: Option<String>,
    /// HLS multivariant or media playlist
    pub hls_url: Option<String>,
    /// Readiness/codec metadata endpoint
    pub readiness_url: Option<String>,
}

impl StreamEndpoints {
    pub fn url_for(&self, protocol: StreamProtocol) -> Option<&str> {
        use crate::protocol::ProtocolFamily;
        match protocol.family() {
            ProtocolFamily::WebRtc => self.webrtc_url.as_deref(),
            ProtocolFamily::Hls => self.hls_url.as_deref(),
        }
    }
}

/// Request credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Credentials {
    Basic { username: String, password: String },
    Bearer { token: String },
}

impl Credentials {
    /// `Authorization` header value
    pub fn header_value(&self) -> String {
        match self {
            Credentials::Basic { username, password } => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", username, password));
                format!("Basic {}", encoded)
            }
            Credentials::Bearer { token } => format!("Bearer {}", token),
        }
    }
}

/// HLS player configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HlsConfig {
    /// Time allowed for the manifest to load (ms)
    pub load_timeout_ms: u64,
    /// Segments behind the live edge to start from
    pub live_sync_count: usize,
    /// Consecutive fragment failures tolerated before the error turns fatal
    pub max_fragment_retries: u32,
    /// Per-request timeout (ms)
    pub request_timeout_ms: u64,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            load_timeout_ms: 5000,
            live_sync_count: 3,
            max_fragment_retries: 3,
            request_timeout_ms: 10_000,
        }
    }
}

/// WebRTC signaling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// Send a WHEP DELETE to the session URL on close
    pub teardown_on_close: bool,
    /// Per-request timeout (ms)
    pub request_timeout_ms: u64,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            teardown_on_close: true,
            request_timeout_ms: 10_000,
        }
    }
}

/// Content types the sink can decode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// RTP mime types (`video/H264`, `audio/opus`, ...)
    pub webrtc: Vec<String>,
    /// Fragmented MP4 / MPEG-TS content types for HLS
    pub media_source: Vec<String>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            // Codecs registered by webrtc-rs `register_default_codecs`
            webrtc: vec![
                "video/H264".into(),
                "video/VP8".into(),
                "video/VP9".into(),
                "video/AV1".into(),
                "audio/opus".into(),
                "audio/G722".into(),
                "audio/PCMU".into(),
                "audio/PCMA".into(),
            ],
            media_source: vec![
                "video/mp4; codecs=\"avc1.42E01F\"".into(),
                "video/mp4; codecs=\"hvc1.1.6.L93.B0\"".into(),
                "video/mp4; codecs=\"vp09.00.10.08\"".into(),
                "video/mp4; codecs=\"av01.0.04M.08\"".into(),
                "audio/mp4; codecs=\"mp4a.40.2\"".into(),
                "audio/mp4; codecs=\"opus\"".into(),
            ],
        }
    }
}
