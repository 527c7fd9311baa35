//! Decoder capability probing
//!
//! A protocol is offered only when every codec the server advertises maps to
//! a decoding profile and the sink reports that profile as decodable.

use std::collections::HashSet;

use crate::config::DecoderConfig;
use crate::protocol::{ProtocolFamily, StreamProtocol};
use crate::sink::MediaKind;

/// How media reaches the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodingContainer {
    /// RTP payloads from a peer connection
    WebRtc,
    /// Fragmented MP4 fed through media source extensions
    MediaSource,
}

/// Decoding query for one codec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDecodingConfiguration {
    pub container: DecodingContainer,
    pub kind: MediaKind,
    /// RTP mime type or mp4 content type, depending on the container
    pub content_type: String,
}

/// Answer of a decoding query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodingInfo {
    pub supported: bool,
    pub smooth: bool,
}

/// Platform decoding capabilities
pub trait DecoderCapabilities: Send + Sync {
    fn decoding_info(&self, query: &MediaDecodingConfiguration) -> DecodingInfo;
}

/// Capabilities from a static list of content types
#[derive(Debug, Clone)]
pub struct ConfiguredDecoders {
    webrtc: HashSet<String>,
    media_source: HashSet<String>,
}

impl ConfiguredDecoders {
    pub fn new(config: &DecoderConfig) -> Self {
        Self {
            webrtc: config.webrtc.iter().map(|c| normalize_type(c)).collect(),
            media_source: config.media_source.iter().map(|c| normalize_type(c)).collect(),
        }
    }
}

impl DecoderCapabilities for ConfiguredDecoders {
    fn decoding_info(&self, query: &MediaDecodingConfiguration) -> DecodingInfo {
        let set = match query.container {
            DecodingContainer::WebRtc => &self.webrtc,
            DecodingContainer::MediaSource => &self.media_source,
        };
        let supported = set.contains(&normalize_type(&query.content_type));
        DecodingInfo {
            supported,
            smooth: supported,
        }
    }
}

fn normalize_type(content_type: &str) -> String {
    content_type
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Map a server codec name to a decoding query for the protocol family
pub fn codec_profile(family: ProtocolFamily, codec: &str) -> Option<MediaDecodingConfiguration> {
    let name = codec.trim().to_ascii_lowercase();
    let (kind, rtp, mp4) = match name.as_str() {
        "h264" | "avc" | "avc1" => (MediaKind::Video, Some("video/H264"), Some("avc1.42E01F")),
        "h265" | "hevc" | "hvc1" => (
            MediaKind::Video,
            Some("video/H265"),
            Some("hvc1.1.6.L93.B0"),
        ),
        "vp8" => (MediaKind::Video, Some("video/VP8"), None),
        "vp9" => (MediaKind::Video, Some("video/VP9"), Some("vp09.00.10.08")),
        "av1" => (MediaKind::Video, Some("video/AV1"), Some("av01.0.04M.08")),
        "opus" => (MediaKind::Audio, Some("audio/opus"), Some("opus")),
        "g722" => (MediaKind::Audio, Some("audio/G722"), None),
        "g711" | "pcmu" => (MediaKind::Audio, Some("audio/PCMU"), None),
        "pcma" => (MediaKind::Audio, Some("audio/PCMA"), None),
        "mpeg-4 audio" | "mpeg4-audio" | "aac" | "mp4a" => {
            (MediaKind::Audio, None, Some("mp4a.40.2"))
        }
        _ => return None,
    };

    let (container, content_type) = match family {
        ProtocolFamily::WebRtc => (DecodingContainer::WebRtc, rtp?.to_string()),
        ProtocolFamily::Hls => (
            DecodingContainer::MediaSource,
            format!("{}/mp4; codecs=\"{}\"", kind, mp4?),
        ),
    };

    Some(MediaDecodingConfiguration {
        container,
        kind,
        content_type,
    })
}

/// Whether `protocol` can play a stream advertising `codecs`.
///
/// An empty codec list means the server did not say, and support is assumed.
pub fn protocol_supported(
    protocol: StreamProtocol,
    codecs: &[String],
    decoders: &dyn DecoderCapabilities,
) -> bool {
    codecs.iter().all(|codec| {
        codec_profile(protocol.family(), codec)
            .map(|query| decoders.decoding_info(&query).supported)
            .unwrap_or(false)
    })
}
