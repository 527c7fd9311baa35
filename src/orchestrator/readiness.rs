//! Stream readiness and codec metadata

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{PlayerError, Result};

/// Answer of the readiness endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamReadiness {
    /// Codecs of the published tracks; empty when the server does not say
    #[serde(default)]
    pub codecs: Vec<String>,
    #[serde(default)]
    pub ready: bool,
}

impl StreamReadiness {
    /// Used when the endpoint cannot be reached
    pub fn assumed() -> Self {
        Self {
            codecs: Vec::new(),
            ready: true,
        }
    }
}

#[async_trait]
pub trait ReadinessSource: Send + Sync {
    async fn fetch(&self) -> Result<StreamReadiness>;
}

/// Readiness polled over HTTP
pub struct HttpReadinessSource {
    http: reqwest::Client,
    url: String,
    auth: Option<String>,
    timeout: Duration,
}

impl HttpReadinessSource {
    pub fn new(http: reqwest::Client, url: impl Into<String>, auth: Option<String>) -> Self {
        Self {
            http,
            url: url.into(),
            auth,
            timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl ReadinessSource for HttpReadinessSource {
    async fn fetch(&self) -> Result<StreamReadiness> {
        let mut request = self.http.get(&self.url).timeout(self.timeout);
        if let Some(auth) = &self.auth {
            request = request.header(AUTHORIZATION, auth);
        }

        let res = request.send().await?;
        if !res.status().is_success() {
            return Err(PlayerError::HttpStatus {
                stage: "Readiness",
                status: res.status().as_u16(),
            });
        }
        let body = res.bytes().await?;
        let readiness: StreamReadiness = serde_json::from_slice(&body)?;
        trace!("Readiness of {}: {:?}", self.url, readiness);
        Ok(readiness)
    }
}

/// Fixed answer, for setups without a readiness endpoint
#[derive(Debug, Clone)]
pub struct StaticReadiness(pub StreamReadiness);

#[async_trait]
impl ReadinessSource for StaticReadiness {
    async fn fetch(&self) -> Result<StreamReadiness> {
        Ok(self.0.clone())
    }
}
