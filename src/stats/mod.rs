//! Uniform playback statistics
//!
//! Transports sample their own raw counters and hand them to the normalizer,
//! which produces labeled [`PlayerStatsRecord`]s. Graph history is kept by the
//! orchestrator in a [`StatsBoard`], never by the transports.

mod format;
mod normalize;

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;

pub use format::{pretty_bits_per_second, pretty_bytes, pretty_millis, Prefix};
pub use normalize::{normalize, HlsSample, TransportSample, WebRtcSample};

/// Stat labels
pub mod keys {
    pub const PROTOCOL: &str = "statProtocol";
    pub const BANDWIDTH: &str = "statBandwidth";
    pub const BYTES_RECEIVED: &str = "statBytesReceived";
    pub const PACKETS_RECEIVED: &str = "statPacketsReceived";
    pub const PACKETS_LOST: &str = "statPacketsLost";
    pub const PACKETS_DISCARDED: &str = "statPacketsDiscarded";
    pub const JITTER: &str = "statJitter";
    pub const JITTER_BUFFER: &str = "statJitterBuffer";
    pub const TRANSPORT: &str = "statTransport";
    pub const CODEC_VIDEO: &str = "statCodecVideo";
    pub const CODEC_AUDIO: &str = "statCodecAudio";
    pub const FRAGMENTS: &str = "statFragments";
    pub const PARTS: &str = "statParts";
    pub const LATENCY: &str = "statLatency";
    pub const RESOLUTION: &str = "statResolution";
}

/// Graph colors
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphColors {
    pub fill: &'static str,
    pub background: &'static str,
}

impl GraphColors {
    pub const BANDWIDTH: GraphColors = GraphColors {
        fill: "#3a86ff",
        background: "#3a86ff33",
    };
    pub const TIMING: GraphColors = GraphColors {
        fill: "#ff9f1c",
        background: "#ff9f1c33",
    };
    pub const LATENCY: GraphColors = GraphColors {
        fill: "#2ec4b6",
        background: "#2ec4b633",
    };
}

/// One labeled stat
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PlayerStatsRecord {
    Value {
        key: String,
        value: String,
    },
    Graph {
        key: String,
        value: f64,
        value_string: String,
        history: VecDeque<f64>,
        /// Scale the graph around the standard deviation instead of zero
        std_dev_scale: bool,
        colors: GraphColors,
    },
}

impl PlayerStatsRecord {
    pub fn value(key: &str, value: impl Into<String>) -> Self {
        PlayerStatsRecord::Value {
            key: key.to_string(),
            value: value.into(),
        }
    }

    pub fn graph(key: &str, value: f64, value_string: String, colors: GraphColors) -> Self {
        PlayerStatsRecord::Graph {
            key: key.to_string(),
            value,
            value_string,
            history: VecDeque::new(),
            std_dev_scale: false,
            colors,
        }
    }

    pub fn with_std_dev_scale(mut self) -> Self {
        if let PlayerStatsRecord::Graph { std_dev_scale, .. } = &mut self {
            *std_dev_scale = true;
        }
        self
    }

    pub fn key(&self) -> &str {
        match self {
            PlayerStatsRecord::Value { key, .. } | PlayerStatsRecord::Graph { key, .. } => key,
        }
    }
}

/// Keyed stats with bounded FIFO graph history
#[derive(Debug, Clone)]
pub struct StatsBoard {
    max_history: usize,
    entries: Vec<PlayerStatsRecord>,
}

impl StatsBoard {
    pub fn new(max_history: usize) -> Self {
        Self {
            max_history: max_history.max(1),
            entries: Vec::new(),
        }
    }

    /// Merge a fresh sample. Graph entries append their value to the history
    /// carried over from the previous sample, dropping the oldest entry once
    /// the history is full.
    pub fn merge(&mut self, records: Vec<PlayerStatsRecord>) {
        for mut record in records {
            let existing = self.entries.iter().position(|e| e.key() == record.key());

            if let PlayerStatsRecord::Graph { value, history, .. } = &mut record {
                let previous = existing.and_then(|i| match &mut self.entries[i] {
                    PlayerStatsRecord::Graph { history, .. } => Some(std::mem::take(history)),
                    PlayerStatsRecord::Value { .. } => None,
                });
                *history = previous.unwrap_or_default();
                while history.len() >= self.max_history {
                    history.pop_front();
                }
                history.push_back(*value);
            }

            match existing {
                Some(i) => self.entries[i] = record,
                None => self.entries.push(record),
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&PlayerStatsRecord> {
        self.entries.iter().find(|e| e.key() == key)
    }

    pub fn records(&self) -> &[PlayerStatsRecord] {
        &self.entries
    }
}

/// `(now - prev) * 8 / interval`, in bits per second.
///
/// A counter that went backwards (new session) yields 0.
pub fn bandwidth_bps(prev: u64, now: u64, interval: Duration) -> f64 {
    let secs = interval.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    now.saturating_sub(prev) as f64 * 8.0 / secs
}

/// Byte counter to bandwidth converter. The first sample has no baseline and
/// reports 0.
#[derive(Debug, Clone, Default)]
pub struct ByteRateMeter {
    prev: Option<u64>,
}

impl ByteRateMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&mut self, bytes_now: u64, interval: Duration) -> f64 {
        let bps = match self.prev {
            Some(prev) => bandwidth_bps(prev, bytes_now, interval),
            None => 0.0,
        };
        self.prev = Some(bytes_now);
        bps
    }
}
