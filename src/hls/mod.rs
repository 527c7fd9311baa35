//! HLS and LL-HLS playback
//!
//! The [`HlsTransport`] drives an [`HlsLoader`] and feeds loaded fragments
//! into the sink.

pub mod loader;
pub mod playlist;
mod transport;

pub use loader::{HlsErrorKind, HlsEvent, HlsLoadError, HlsLoader};
pub use playlist::{MediaPlaylist, Playlist, Segment, Variant};
pub use transport::HlsTransport;
