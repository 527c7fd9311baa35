use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::protocol::StreamProtocol;

/// Persisted client-local preferences
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Preferences {
    /// Last successfully used protocol, stored as its wire string
    #[serde(rename = "stream-protocol", default)]
    pub stream_protocol: Option<String>,
}

impl Preferences {
    /// Unknown or missing values yield `None` so callers fall back to selection.
    pub fn protocol(&self) -> Option<StreamProtocol> {
        self.stream_protocol
            .as_deref()
            .and_then(StreamProtocol::parse)
    }
}

/// Storage for the protocol preference
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    /// Current preference (cached, no I/O)
    fn load(&self) -> Option<StreamProtocol>;

    /// Persist a new preference
    async fn save(&self, protocol: StreamProtocol) -> Result<()>;
}

/// Preference store backed by a JSON file
///
/// Uses `ArcSwap` so reads from the orchestrator loop never block on I/O.
pub struct JsonPreferenceStore {
    path: PathBuf,
    cache: Arc<ArcSwap<Preferences>>,
}

impl JsonPreferenceStore {
    /// Open the store, reading existing preferences if the file exists
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let prefs = match tokio::fs::read_to_string(path).await {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                warn!("Ignoring unreadable preferences at {}: {}", path.display(), e);
                Preferences::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Preferences::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: path.to_path_buf(),
            cache: Arc::new(ArcSwap::from_pointee(prefs)),
        })
    }

    pub fn get(&self) -> Arc<Preferences> {
        self.cache.load_full()
    }
}

#[async_trait]
impl PreferenceStore for JsonPreferenceStore {
    fn load(&self) -> Option<StreamProtocol> {
        self.cache.load().protocol()
    }

    async fn save(&self, protocol: StreamProtocol) -> Result<()> {
        let mut prefs = (**self.cache.load()).clone();
        prefs.stream_protocol = Some(protocol.as_str().to_string());

        let json = serde_json::to_string_pretty(&prefs)?;
        tokio::fs::write(&self.path, json).await?;
        self.cache.store(Arc::new(prefs));

        debug!("Saved stream protocol preference: {}", protocol);
        Ok(())
    }
}

/// In-memory preference store
#[derive(Default)]
pub struct MemoryPreferenceStore {
    cache: ArcSwap<Preferences>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_protocol(protocol: StreamProtocol) -> Self {
        Self {
            cache: ArcSwap::from_pointee(Preferences {
                stream_protocol: Some(protocol.as_str().to_string()),
            }),
        }
    }
}

#[async_trait]
impl PreferenceStore for MemoryPreferenceStore {
    fn load(&self) -> Option<StreamProtocol> {
        self.cache.load().protocol()
    }

    async fn save(&self, protocol: StreamProtocol) -> Result<()> {
        self.cache.store(Arc::new(Preferences {
            stream_protocol: Some(protocol.as_str().to_string()),
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_json_store_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prefs/player.json");

        let store = JsonPreferenceStore::open(&path).await.unwrap();
        assert_eq!(store.load(), None);

        store.save(StreamProtocol::WebRtcTcp).await.unwrap();
        assert_eq!(store.load(), Some(StreamProtocol::WebRtcTcp));

        let reopened = JsonPreferenceStore::open(&path).await.unwrap();
        assert_eq!(reopened.load(), Some(StreamProtocol::WebRtcTcp));

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(raw.contains("\"stream-protocol\": \"webrtc-tcp\""));
    }

    #[tokio::test]
    async fn test_unknown_value_falls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("player.json");
        tokio::fs::write(&path, r#"{"stream-protocol":"rtmp"}"#)
            .await
            .unwrap();

        let store = JsonPreferenceStore::open(&path).await.unwrap();
        assert_eq!(store.load(), None);
        assert_eq!(store.get().stream_protocol.as_deref(), Some("rtmp"));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("player.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let store = JsonPreferenceStore::open(&path).await.unwrap();
        assert_eq!(store.load(), None);
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryPreferenceStore::with_protocol(StreamProtocol::Hls);
        assert_eq!(store.load(), Some(StreamProtocol::Hls));
        store.save(StreamProtocol::LlHls).await.unwrap();
        assert_eq!(store.load(), Some(StreamProtocol::LlHls));
    }
}
