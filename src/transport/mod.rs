//! Transport readers
//!
//! A [`Transport`] is created per negotiation attempt and discarded on close.
//! The variant is picked from the protocol family at construction time.

pub mod capability;
pub mod reader;

use std::sync::Arc;

pub use capability::{
    protocol_supported, ConfiguredDecoders, DecoderCapabilities, DecodingContainer, DecodingInfo,
    MediaDecodingConfiguration,
};
pub use reader::{ErrorCallback, ReaderConfiguration, ReaderState, StatsCallback};

use crate::config::{HlsConfig, WebRtcConfig};
use crate::error::Result;
use crate::hls::HlsTransport;
use crate::protocol::{ProtocolFamily, StreamProtocol};
use crate::sink::VideoSink;
use crate::webrtc::{PeerConnector, WebRtcTransport};

/// Collaborators shared by every transport of a player
#[derive(Clone)]
pub struct TransportContext {
    pub http: reqwest::Client,
    pub peers: Arc<dyn PeerConnector>,
    pub webrtc: WebRtcConfig,
    pub hls: HlsConfig,
}

pub enum Transport {
    WebRtc(WebRtcTransport),
    Hls(HlsTransport),
}

impl Transport {
    /// Build the reader for `config.protocol`. Nothing happens until `start()`.
    pub fn for_protocol(
        config: ReaderConfiguration,
        context: &TransportContext,
        sink: Arc<dyn VideoSink>,
        debug: bool,
    ) -> Result<Self> {
        Ok(match config.protocol.family() {
            ProtocolFamily::WebRtc => {
                Transport::WebRtc(WebRtcTransport::new(config, context, sink, debug)?)
            }
            ProtocolFamily::Hls => Transport::Hls(HlsTransport::new(config, context, sink, debug)?),
        })
    }

    /// Whether the sink can decode what `protocol` would deliver
    pub fn supported(
        protocol: StreamProtocol,
        codecs: &[String],
        decoders: &dyn DecoderCapabilities,
    ) -> bool {
        protocol_supported(protocol, codecs, decoders)
    }

    pub fn start(&self) -> Result<()> {
        match self {
            Transport::WebRtc(t) => t.start(),
            Transport::Hls(t) => t.start(),
        }
    }

    pub fn close(&self) {
        match self {
            Transport::WebRtc(t) => t.close(),
            Transport::Hls(t) => t.close(),
        }
    }

    pub fn play(&self) {
        match self {
            Transport::WebRtc(t) => t.play(),
            Transport::Hls(t) => t.play(),
        }
    }

    pub fn pause(&self) {
        match self {
            Transport::WebRtc(t) => t.pause(),
            Transport::Hls(t) => t.pause(),
        }
    }

    pub fn set_debug_state(&self, enabled: bool) {
        match self {
            Transport::WebRtc(t) => t.set_debug_state(enabled),
            Transport::Hls(t) => t.set_debug_state(enabled),
        }
    }

    pub fn state(&self) -> ReaderState {
        match self {
            Transport::WebRtc(t) => t.state(),
            Transport::Hls(t) => t.state(),
        }
    }

    pub fn protocol_family(&self) -> ProtocolFamily {
        match self {
            Transport::WebRtc(_) => ProtocolFamily::WebRtc,
            Transport::Hls(_) => ProtocolFamily::Hls,
        }
    }
}
