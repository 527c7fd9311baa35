//! Player configuration and persisted preferences

mod schema;
mod store;

pub use schema::{
    Credentials, DecoderConfig, HlsConfig, PlayerConfig, StreamEndpoints, WebRtcConfig,
};
pub use store::{JsonPreferenceStore, MemoryPreferenceStore, PreferenceStore, Preferences};
