use super::{
    keys, pretty_bits_per_second, pretty_bytes, pretty_millis, GraphColors, PlayerStatsRecord,
    Prefix,
};
use crate::protocol::{CandidateTransport, StreamProtocol};

/// Aggregated WebRTC counters for one sampling tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WebRtcSample {
    pub bandwidth_bps: f64,
    pub bytes_received: u64,
    pub packets_received: u64,
    pub packets_lost: i64,
    pub packets_discarded: u64,
    /// Average jitter across inbound streams (seconds)
    pub jitter: Option<f64>,
    /// Average jitter-buffer delay per emitted sample (seconds)
    pub jitter_buffer_delay: Option<f64>,
    pub transport: Option<CandidateTransport>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
}

/// HLS fragment counters for one sampling tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HlsSample {
    pub bandwidth_bps: f64,
    pub bytes_loaded: u64,
    pub fragments: u64,
    /// LL-HLS partial segments delivered
    pub parts: u64,
    /// End-to-end latency reported by the playlist clock (seconds)
    pub latency: Option<f64>,
}

/// Raw transport sample
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSample {
    WebRtc(WebRtcSample),
    Hls(HlsSample),
}

/// Convert a transport sample into uniform records
pub fn normalize(protocol: StreamProtocol, sample: &TransportSample) -> Vec<PlayerStatsRecord> {
    let mut records = vec![PlayerStatsRecord::value(keys::PROTOCOL, protocol.as_str())];

    match sample {
        TransportSample::WebRtc(s) => {
            records.push(bandwidth(s.bandwidth_bps));
            records.push(PlayerStatsRecord::value(
                keys::BYTES_RECEIVED,
                pretty_bytes(s.bytes_received, Prefix::Iec),
            ));
            records.push(PlayerStatsRecord::value(
                keys::PACKETS_RECEIVED,
                s.packets_received.to_string(),
            ));
            records.push(PlayerStatsRecord::value(
                keys::PACKETS_LOST,
                s.packets_lost.to_string(),
            ));
            records.push(PlayerStatsRecord::value(
                keys::PACKETS_DISCARDED,
                s.packets_discarded.to_string(),
            ));
            if let Some(jitter) = s.jitter {
                records.push(
                    PlayerStatsRecord::graph(
                        keys::JITTER,
                        jitter,
                        pretty_millis(jitter),
                        GraphColors::TIMING,
                    )
                    .with_std_dev_scale(),
                );
            }
            if let Some(delay) = s.jitter_buffer_delay {
                records.push(
                    PlayerStatsRecord::graph(
                        keys::JITTER_BUFFER,
                        delay,
                        pretty_millis(delay),
                        GraphColors::LATENCY,
                    )
                    .with_std_dev_scale(),
                );
            }
            records.push(PlayerStatsRecord::value(
                keys::TRANSPORT,
                s.transport
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
            ));
            if let Some(codec) = &s.video_codec {
                records.push(PlayerStatsRecord::value(keys::CODEC_VIDEO, codec.clone()));
            }
            if let Some(codec) = &s.audio_codec {
                records.push(PlayerStatsRecord::value(keys::CODEC_AUDIO, codec.clone()));
            }
        }
        TransportSample::Hls(s) => {
            records.push(bandwidth(s.bandwidth_bps));
            records.push(PlayerStatsRecord::value(
                keys::BYTES_RECEIVED,
                pretty_bytes(s.bytes_loaded, Prefix::Iec),
            ));
            records.push(PlayerStatsRecord::value(
                keys::FRAGMENTS,
                s.fragments.to_string(),
            ));
            if protocol.is_low_latency_hls() {
                records.push(PlayerStatsRecord::value(keys::PARTS, s.parts.to_string()));
            }
            if let Some(latency) = s.latency {
                records.push(PlayerStatsRecord::graph(
                    keys::LATENCY,
                    latency,
                    pretty_millis(latency),
                    GraphColors::LATENCY,
                ));
            }
        }
    }

    records
}

fn bandwidth(bps: f64) -> PlayerStatsRecord {
    PlayerStatsRecord::graph(
        keys::BANDWIDTH,
        bps,
        pretty_bits_per_second(bps),
        GraphColors::BANDWIDTH,
    )
}
