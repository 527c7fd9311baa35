//! stream-player - Live stream playback client
//!
//! Plays a stream over WHEP WebRTC, HLS or LL-HLS. The orchestrator polls
//! stream readiness, picks the best protocol both ends support, negotiates a
//! transport into a [`sink::VideoSink`] and retries on failure or stall.

pub mod config;
pub mod error;
pub mod hls;
pub mod orchestrator;
pub mod protocol;
pub mod scheduler;
pub mod sink;
pub mod stats;
pub mod transport;
pub mod utils;
pub mod webrtc;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{PlayerError, PlayerNotice, Result};
pub use orchestrator::{OrchestratorHandle, PlayerContext, PlayerPhase, PlayerStatus, StreamOrchestrator};
pub use protocol::StreamProtocol;
