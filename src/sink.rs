//! Video sink abstraction
//!
//! The sink is the rendering element the stream ends up in. It is owned by the
//! orchestrator and lent to exactly one active transport at a time.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use webrtc::track::track_remote::TrackRemote;

/// Media kind of a track or SDP media section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "video" => Some(MediaKind::Video),
            "audio" => Some(MediaKind::Audio),
            _ => None,
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
        }
    }
}

/// Inbound WebRTC track handed to the sink (the `srcObject` assignment)
#[derive(Clone)]
pub struct RemoteTrack {
    pub kind: MediaKind,
    /// Codec mime type, e.g. `video/H264`
    pub codec: String,
    pub ssrc: u32,
    /// Underlying RTP track; absent for scripted peers
    pub track: Option<Arc<TrackRemote>>,
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("kind", &self.kind)
            .field("codec", &self.codec)
            .field("ssrc", &self.ssrc)
            .field("attached", &self.track.is_some())
            .finish()
    }
}

/// Loaded HLS media segment or partial segment (the `src` feed)
#[derive(Debug, Clone)]
pub struct HlsFragment {
    /// Media sequence number of the segment
    pub sequence: u64,
    /// Index of the partial segment, when delivered as an LL-HLS part
    pub part: Option<usize>,
    pub url: String,
    /// Duration in seconds
    pub duration: f64,
    pub data: Bytes,
}

/// Playback events raised by the sink
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Play,
    Pause,
    Waiting,
    Stalled,
    Playing,
    LoadedData { width: u32, height: u32 },
}

/// Rendering element fed by the active transport
pub trait VideoSink: Send + Sync {
    /// Attach an inbound WebRTC track
    fn attach_track(&self, track: RemoteTrack);

    /// Append a loaded HLS fragment
    fn append_fragment(&self, fragment: HlsFragment);

    /// Detach whatever media is currently attached
    fn reset(&self);
}
