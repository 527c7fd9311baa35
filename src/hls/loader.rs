//! HLS loading loop
//!
//! [`HlsLoader`] plays the role of the HLS player library: it resolves the
//! multivariant playlist, follows the media playlist near the live edge and
//! reports everything it does as [`HlsEvent`]s. Deciding what is fatal for
//! the attempt is left to the transport.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, FixedOffset};
use reqwest::header::AUTHORIZATION;
use reqwest::Url;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};

use super::playlist::{self, MediaPlaylist, PartialSegment, Playlist};
use crate::config::HlsConfig;
use crate::sink::HlsFragment;

/// Error categories, after the HLS player library
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HlsErrorKind {
    Network,
    Media,
    Other,
}

impl std::fmt::Display for HlsErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HlsErrorKind::Network => write!(f, "networkError"),
            HlsErrorKind::Media => write!(f, "mediaError"),
            HlsErrorKind::Other => write!(f, "otherError"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HlsLoadError {
    pub fatal: bool,
    pub kind: HlsErrorKind,
    pub details: String,
    /// HTTP status of the failed request, if one was received
    pub status: Option<u16>,
}

#[derive(Debug, Clone)]
pub enum HlsEvent {
    ManifestParsed {
        low_latency: bool,
    },
    /// Initialization section of a fragmented MP4 stream
    InitLoaded(HlsFragment),
    FragLoaded {
        fragment: HlsFragment,
        program_date_time: Option<DateTime<FixedOffset>>,
    },
    Error(HlsLoadError),
}

enum Fetch {
    Ok(Bytes),
    Failed { details: String, status: Option<u16> },
}

pub struct HlsLoader {
    http: reqwest::Client,
    url: Url,
    auth: Option<String>,
    low_latency: bool,
    config: HlsConfig,
    events: mpsc::UnboundedSender<HlsEvent>,
    paused: watch::Receiver<bool>,
    failures: u32,
}

impl HlsLoader {
    pub fn new(
        http: reqwest::Client,
        url: Url,
        auth: Option<String>,
        low_latency: bool,
        config: HlsConfig,
        events: mpsc::UnboundedSender<HlsEvent>,
        paused: watch::Receiver<bool>,
    ) -> Self {
        Self {
            http,
            url,
            auth,
            low_latency,
            config,
            events,
            paused,
            failures: 0,
        }
    }

    fn emit(&self, event: HlsEvent) -> bool {
        self.events.send(event).is_ok()
    }

    fn error(&self, fatal: bool, kind: HlsErrorKind, details: String, status: Option<u16>) {
        let _ = self.emit(HlsEvent::Error(HlsLoadError {
            fatal,
            kind,
            details,
            status,
        }));
    }

    async fn fetch(&self, url: Url) -> Fetch {
        let mut request = self
            .http
            .get(url.clone())
            .timeout(Duration::from_millis(self.config.request_timeout_ms));
        if let Some(auth) = &self.auth {
            request = request.header(AUTHORIZATION, auth);
        }

        match request.send().await {
            Ok(res) if res.status().is_success() => match res.bytes().await {
                Ok(body) => Fetch::Ok(body),
                Err(e) => Fetch::Failed {
                    details: format!("{}: {}", url, e),
                    status: None,
                },
            },
            Ok(res) => Fetch::Failed {
                details: format!("{} returned {}", url, res.status()),
                status: Some(res.status().as_u16()),
            },
            Err(e) => Fetch::Failed {
                details: format!("{}: {}", url, e),
                status: e.status().map(|s| s.as_u16()),
            },
        }
    }

    /// Record a failed request; returns true once the retry budget is spent
    fn record_failure(&mut self, details: String, status: Option<u16>) -> bool {
        self.failures += 1;
        let fatal = self.failures > self.config.max_fragment_retries;
        self.error(fatal, HlsErrorKind::Network, details, status);
        fatal
    }

    async fn wait_while_paused(&mut self) -> bool {
        while *self.paused.borrow_and_update() {
            if self.paused.changed().await.is_err() {
                return false;
            }
        }
        true
    }

    async fn load_playlist(&self, url: Url) -> Result<Playlist, (String, Option<u16>)> {
        match self.fetch(url).await {
            Fetch::Ok(body) => {
                let text = String::from_utf8_lossy(&body);
                playlist::parse(&text).map_err(|e| (e.to_string(), None))
            }
            Fetch::Failed { details, status } => Err((details, status)),
        }
    }

    /// Resolve the media playlist URL and its first contents
    async fn open(&self) -> Option<(Url, MediaPlaylist)> {
        let manifest = match self.load_playlist(self.url.clone()).await {
            Ok(p) => p,
            Err((details, status)) => {
                self.error(true, HlsErrorKind::Network, details, status);
                return None;
            }
        };

        let (media_url, media) = match manifest {
            Playlist::Media(media) => (self.url.clone(), media),
            Playlist::Multivariant(variants) => {
                let Some(variant) = variants.first() else {
                    self.error(true, HlsErrorKind::Other, "no variants".into(), None);
                    return None;
                };
                let Ok(url) = self.url.join(&variant.uri) else {
                    self.error(true, HlsErrorKind::Other, format!("bad variant URI {}", variant.uri), None);
                    return None;
                };
                debug!("Selected variant {}", url);
                match self.load_playlist(url.clone()).await {
                    Ok(Playlist::Media(media)) => (url, media),
                    Ok(Playlist::Multivariant(_)) => {
                        self.error(true, HlsErrorKind::Other, "nested multivariant playlist".into(), None);
                        return None;
                    }
                    Err((details, status)) => {
                        self.error(true, HlsErrorKind::Network, details, status);
                        return None;
                    }
                }
            }
        };

        let low_latency = self.low_latency && media.has_parts();
        info!(
            "HLS manifest loaded ({} segments, low latency: {})",
            media.segments.len(),
            low_latency
        );
        self.emit(HlsEvent::ManifestParsed { low_latency });
        Some((media_url, media))
    }

    /// Playlist reload delay of at least `min` seconds. Reports a fatal
    /// error when `secs` is not a usable duration.
    fn reload_delay(&self, secs: f64, min: f64) -> Option<Duration> {
        match Duration::try_from_secs_f64(secs.max(min)) {
            Ok(delay) => Some(delay),
            Err(_) => {
                self.error(
                    true,
                    HlsErrorKind::Other,
                    format!("invalid reload interval {}", secs),
                    None,
                );
                None
            }
        }
    }

    fn reload_url(&self, base: &Url, msn: u64, part: usize) -> Url {
        let mut url = base.clone();
        url.query_pairs_mut()
            .append_pair("_HLS_msn", &msn.to_string())
            .append_pair("_HLS_part", &part.to_string());
        url
    }

    /// Fetch one segment or part and hand it over. Returns false when the
    /// loader should stop.
    async fn load_fragment(
        &mut self,
        base: &Url,
        uri: &str,
        sequence: u64,
        part: Option<usize>,
        duration: f64,
        program_date_time: Option<DateTime<FixedOffset>>,
    ) -> Option<bool> {
        if !self.wait_while_paused().await {
            return None;
        }
        let Ok(url) = base.join(uri) else {
            self.error(true, HlsErrorKind::Other, format!("bad fragment URI {}", uri), None);
            return None;
        };

        match self.fetch(url.clone()).await {
            Fetch::Ok(data) => {
                self.failures = 0;
                trace!("Loaded {} ({} bytes)", url, data.len());
                let fragment = HlsFragment {
                    sequence,
                    part,
                    url: url.to_string(),
                    duration,
                    data,
                };
                if !self.emit(HlsEvent::FragLoaded {
                    fragment,
                    program_date_time,
                }) {
                    return None;
                }
                Some(true)
            }
            Fetch::Failed { details, status } => {
                if self.record_failure(details, status) {
                    return None;
                }
                Some(false)
            }
        }
    }

    pub async fn run(mut self) {
        let Some((media_url, mut media)) = self.open().await else {
            return;
        };
        let low_latency = self.low_latency && media.has_parts();

        if let Some(init) = media.init_uri.clone() {
            let Ok(url) = media_url.join(&init) else {
                self.error(true, HlsErrorKind::Other, format!("bad map URI {}", init), None);
                return;
            };
            match self.fetch(url.clone()).await {
                Fetch::Ok(data) => {
                    self.emit(HlsEvent::InitLoaded(HlsFragment {
                        sequence: media.media_sequence,
                        part: None,
                        url: url.to_string(),
                        duration: 0.0,
                        data,
                    }));
                }
                Fetch::Failed { details, status } => {
                    self.error(true, HlsErrorKind::Network, details, status);
                    return;
                }
            }
        }

        let start_index = if media.end_list {
            0
        } else {
            media.segments.len().saturating_sub(self.config.live_sync_count)
        };
        let mut next_seq = media.media_sequence.saturating_add(start_index as u64);
        let mut next_part = 0usize;

        loop {
            let segments = media.segments.clone();
            let from_seq = next_seq;
            'segments: for segment in segments.iter().filter(|s| s.sequence >= from_seq) {
                if low_latency && segment.sequence == next_seq && next_part > 0 {
                    // finish a segment started as parts
                    let remaining: Vec<PartialSegment> =
                        segment.parts.iter().skip(next_part).cloned().collect();
                    for p in remaining {
                        match self
                            .load_fragment(&media_url, &p.uri, segment.sequence, Some(next_part), p.duration, None)
                            .await
                        {
                            Some(true) => next_part += 1,
                            Some(false) => break 'segments,
                            None => return,
                        }
                    }
                } else {
                    match self
                        .load_fragment(
                            &media_url,
                            &segment.uri,
                            segment.sequence,
                            None,
                            segment.duration,
                            segment.program_date_time,
                        )
                        .await
                    {
                        Some(true) => {}
                        Some(false) => break,
                        None => return,
                    }
                }
                next_seq = segment.sequence.saturating_add(1);
                next_part = 0;
            }

            if low_latency && media.next_sequence() == next_seq {
                let pending: Vec<PartialSegment> =
                    media.pending_parts.iter().skip(next_part).cloned().collect();
                for p in pending {
                    match self
                        .load_fragment(&media_url, &p.uri, next_seq, Some(next_part), p.duration, None)
                        .await
                    {
                        Some(true) => next_part += 1,
                        Some(false) => break,
                        None => return,
                    }
                }
            }

            if media.end_list {
                info!("HLS playlist ended");
                return;
            }

            if !self.wait_while_paused().await {
                return;
            }

            let reload = if low_latency && media.can_block_reload {
                self.reload_url(&media_url, next_seq, next_part)
            } else {
                let wait = if low_latency {
                    media.part_target.unwrap_or(media.target_duration)
                } else {
                    media.target_duration
                };
                let Some(delay) = self.reload_delay(wait, 0.1) else {
                    return;
                };
                tokio::time::sleep(delay).await;
                media_url.clone()
            };

            match self.load_playlist(reload).await {
                Ok(Playlist::Media(next)) => {
                    if next.media_sequence > next_seq {
                        debug!("Fell behind live edge, jumping to {}", next.media_sequence);
                        next_seq = next.media_sequence;
                        next_part = 0;
                    }
                    media = next;
                }
                Ok(Playlist::Multivariant(_)) => {
                    self.error(true, HlsErrorKind::Other, "playlist changed type".into(), None);
                    return;
                }
                Err((details, status)) => {
                    if self.record_failure(details, status) {
                        return;
                    }
                    let Some(delay) = self.reload_delay(media.target_duration, 0.5) else {
                        return;
                    };
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
