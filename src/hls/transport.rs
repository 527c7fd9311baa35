use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use parking_lot::Mutex;
use reqwest::Url;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};

use super::loader::{HlsErrorKind, HlsEvent, HlsLoadError, HlsLoader};
use crate::config::HlsConfig;
use crate::error::{PlayerError, Result};
use crate::scheduler::TaskHandle;
use crate::sink::{HlsFragment, VideoSink};
use crate::stats::{ByteRateMeter, HlsSample, TransportSample};
use crate::transport::reader::{ReaderConfiguration, ReaderCore, ReaderState, StatsSource};
use crate::transport::TransportContext;
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// HLS / LL-HLS reader
pub struct HlsTransport {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Counters {
    bytes_loaded: u64,
    fragments: u64,
    parts: u64,
    latency: Option<f64>,
}

struct Inner {
    core: Arc<ReaderCore>,
    http: reqwest::Client,
    url: Url,
    hls: HlsConfig,
    sink: Arc<dyn VideoSink>,
    paused: watch::Sender<bool>,
    load_timeout: Mutex<Option<TaskHandle>>,
    counters: Mutex<Counters>,
    meter: Mutex<ByteRateMeter>,
    noise: LogThrottler,
}

impl HlsTransport {
    pub fn new(
        config: ReaderConfiguration,
        context: &TransportContext,
        sink: Arc<dyn VideoSink>,
        debug: bool,
    ) -> Result<Self> {
        let url = Url::parse(&config.url)
            .map_err(|e| PlayerError::Url(format!("{}: {}", config.url, e)))?;
        let (paused, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                core: Arc::new(ReaderCore::new(config, debug)),
                http: context.http.clone(),
                url,
                hls: context.hls.clone(),
                sink,
                paused,
                load_timeout: Mutex::new(None),
                counters: Mutex::new(Counters::default()),
                meter: Mutex::new(ByteRateMeter::new()),
                noise: LogThrottler::with_secs(10),
            }),
        })
    }

    /// Attach the player to the stream and start loading
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        inner.core.begin()?;
        let low_latency = inner.core.protocol().is_low_latency_hls();
        info!(
            "Starting {} playback of {} (low latency: {})",
            inner.core.protocol(),
            inner.url,
            low_latency
        );

        inner.core.spawn_stats_sampler(inner.clone() as Arc<dyn StatsSource>);
        inner.arm_load_timeout();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let loader = HlsLoader::new(
            inner.http.clone(),
            inner.url.clone(),
            inner.core.config().auth_header(),
            low_latency,
            inner.hls.clone(),
            events_tx,
            inner.paused.subscribe(),
        );
        let handle = inner.core.scheduler().spawn(move |_token| loader.run());
        inner.core.hold(handle);

        inner.spawn_event_loop(events_rx);
        Ok(())
    }

    pub fn close(&self) {
        if self.inner.core.close() {
            debug!("{} reader closed", self.inner.core.protocol());
            self.inner.load_timeout.lock().take();
        }
    }

    pub fn play(&self) {
        if self.inner.paused.send_replace(false) {
            debug!("Resuming HLS loading");
        }
    }

    pub fn pause(&self) {
        if !self.inner.paused.send_replace(true) {
            debug!("Suspending HLS loading");
        }
    }

    pub fn set_debug_state(&self, enabled: bool) {
        self.inner.core.set_debug(enabled);
    }

    pub fn state(&self) -> ReaderState {
        self.inner.core.state()
    }
}

impl Drop for HlsTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Map a loader error onto the player taxonomy
fn load_error(err: HlsLoadError) -> PlayerError {
    match err.status {
        Some(status @ (400 | 401 | 403 | 404)) => PlayerError::StreamUnavailable { status },
        _ => PlayerError::Hls {
            kind: err.kind.to_string(),
            details: err.details,
        },
    }
}

/// Seconds between the end of a fragment and `now`; `None` if the
/// fragment end is not representable
fn latency_of(
    program_date_time: DateTime<FixedOffset>,
    duration: f64,
    now: DateTime<Utc>,
) -> Option<f64> {
    let length = TimeDelta::try_milliseconds((duration * 1000.0) as i64)?;
    let end = program_date_time.checked_add_signed(length)?;
    Some(now.signed_duration_since(end).num_milliseconds() as f64 / 1000.0)
}

impl Inner {
    fn fail(&self, err: PlayerError) {
        if self.core.fail(err) {
            self.load_timeout.lock().take();
        }
    }

    fn arm_load_timeout(self: &Arc<Self>) {
        let timeout_ms = self.hls.load_timeout_ms;
        let inner = self.clone();
        let handle = self
            .core
            .scheduler()
            .after(Duration::from_millis(timeout_ms), async move {
                inner.fail(PlayerError::LoadTimeout(timeout_ms));
            });
        *self.load_timeout.lock() = Some(handle);
    }

    fn spawn_event_loop(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<HlsEvent>) {
        let inner = self.clone();
        let handle = self.core.scheduler().spawn(move |_token| async move {
            while let Some(event) = events.recv().await {
                if !inner.core.is_running() {
                    break;
                }
                inner.handle_event(event);
            }
        });
        self.core.hold(handle);
    }

    fn handle_event(&self, event: HlsEvent) {
        match event {
            HlsEvent::ManifestParsed { low_latency } => {
                info!("HLS manifest parsed (low latency: {})", low_latency);
                self.load_timeout.lock().take();
            }
            HlsEvent::InitLoaded(fragment) => {
                debug!("Init segment loaded ({} bytes)", fragment.data.len());
                self.counters.lock().bytes_loaded += fragment.data.len() as u64;
                self.sink.append_fragment(fragment);
            }
            HlsEvent::FragLoaded {
                fragment,
                program_date_time,
            } => self.on_fragment(fragment, program_date_time),
            HlsEvent::Error(err) => self.on_error(err),
        }
    }

    fn on_fragment(&self, fragment: HlsFragment, program_date_time: Option<DateTime<FixedOffset>>) {
        self.load_timeout.lock().take();
        {
            let mut counters = self.counters.lock();
            counters.bytes_loaded += fragment.data.len() as u64;
            if fragment.part.is_some() {
                counters.parts += 1;
            } else {
                counters.fragments += 1;
            }
            if let Some(latency) =
                program_date_time.and_then(|pdt| latency_of(pdt, fragment.duration, Utc::now()))
            {
                counters.latency = Some(latency);
            }
        }
        trace!(
            "Fragment {}{} appended",
            fragment.sequence,
            fragment.part.map(|p| format!(".{}", p)).unwrap_or_default()
        );
        self.sink.append_fragment(fragment);
    }

    fn on_error(&self, err: HlsLoadError) {
        let escalate = err.fatal
            || (err.kind == HlsErrorKind::Network && err.status.is_some_and(|s| s >= 400));
        if escalate {
            self.fail(load_error(err));
            return;
        }
        warn_throttled!(
            self.noise,
            "hls-error",
            "Non-fatal HLS {} error: {}",
            err.kind,
            err.details
        );
    }
}

#[async_trait]
impl StatsSource for Inner {
    async fn sample(&self, interval: Duration) -> Option<TransportSample> {
        let counters = self.counters.lock();
        let bandwidth_bps = self.meter.lock().sample(counters.bytes_loaded, interval);
        Some(TransportSample::Hls(HlsSample {
            bandwidth_bps,
            bytes_loaded: counters.bytes_loaded,
            fragments: counters.fragments,
            parts: counters.parts,
            latency: counters.latency,
        }))
    }

    fn reset_baseline(&self) {
        *self.meter.lock() = ByteRateMeter::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::protocol::StreamProtocol;
    use crate::stats::{keys, PlayerStatsRecord};
    use crate::test_support::{
        transport_context, wait_until, FakePeerConnector, HlsMock, MemorySink,
    };

    fn live_playlist(first: u64, count: u64) -> String {
        let mut text = format!(
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:1\n#EXT-X-MEDIA-SEQUENCE:{}\n",
            first
        );
        for seq in first..first + count {
            text.push_str(&format!("#EXTINF:1.0,\nseg{}.ts\n", seq));
        }
        text
    }

    struct Harness {
        transport: HlsTransport,
        errors: Arc<Mutex<Vec<PlayerError>>>,
        sink: Arc<MemorySink>,
    }

    fn harness_with(url: String, protocol: StreamProtocol, hls: HlsConfig) -> Harness {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let e = errors.clone();
        let sink = Arc::new(MemorySink::default());
        let mut context = transport_context(Arc::new(FakePeerConnector::default()));
        context.hls = hls;
        let config = ReaderConfiguration::new(url, protocol).on_error(move |err| {
            e.lock().push(err);
        });
        let transport = HlsTransport::new(config, &context, sink.clone(), false).unwrap();
        Harness {
            transport,
            errors,
            sink,
        }
    }

    fn harness(url: String, protocol: StreamProtocol) -> Harness {
        harness_with(url, protocol, HlsConfig::default())
    }

    #[test]
    fn test_latency_from_program_date_time() {
        let pdt = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap();
        let now = DateTime::parse_from_rfc3339("2024-01-01T00:00:03.500Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!((latency_of(pdt, 2.0, now).unwrap() - 1.5).abs() < 1e-9);
        assert_eq!(latency_of(pdt, 1e300, now), None);
    }

    #[test]
    fn test_error_mapping() {
        let offline = load_error(HlsLoadError {
            fatal: true,
            kind: HlsErrorKind::Network,
            details: "gone".into(),
            status: Some(404),
        });
        assert_eq!(offline.kind(), ErrorKind::Unavailable);

        let server = load_error(HlsLoadError {
            fatal: true,
            kind: HlsErrorKind::Network,
            details: "boom".into(),
            status: Some(500),
        });
        assert_eq!(server.kind(), ErrorKind::Runtime);
        assert!(server.to_string().contains("networkError"));
    }

    #[tokio::test]
    async fn test_starts_near_live_edge() {
        let mock = HlsMock::spawn(&live_playlist(10, 6)).await;
        let h = harness(mock.media_url(), StreamProtocol::Hls);

        h.transport.start().unwrap();
        assert!(wait_until(|| h.sink.fragments().len() >= 3).await);

        let sequences: Vec<u64> = h.sink.fragments().iter().map(|f| f.sequence).collect();
        assert_eq!(&sequences[..3], &[13, 14, 15]);
        assert!(mock.count("seg12.ts") == 0);
        assert!(h.errors.lock().is_empty());

        h.transport.close();
        h.transport.close();
        assert_eq!(h.transport.state(), ReaderState::Closed);
    }

    #[tokio::test]
    async fn test_multivariant_selects_first_variant() {
        let mock = HlsMock::spawn(&live_playlist(0, 2)).await;
        let h = harness(mock.master_url(), StreamProtocol::Hls);

        h.transport.start().unwrap();
        assert!(wait_until(|| h.sink.fragments().len() >= 2).await);
        assert!(mock.count("master.m3u8") >= 1);
        assert!(mock.count("index.m3u8") >= 1);
        assert!(h.errors.lock().is_empty());
    }

    #[tokio::test]
    async fn test_manifest_not_found_is_unavailable() {
        let mock = HlsMock::spawn(&live_playlist(0, 3)).await;
        mock.set_playlist_status(404);
        let h = harness(mock.media_url(), StreamProtocol::Hls);

        h.transport.start().unwrap();
        assert!(wait_until(|| !h.errors.lock().is_empty()).await);
        assert_eq!(h.errors.lock()[0].kind(), ErrorKind::Unavailable);
        assert_eq!(h.transport.state(), ReaderState::Closed);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.errors.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_fragment_http_error_escalates() {
        let mock = HlsMock::spawn(&live_playlist(0, 3)).await;
        mock.set_segment_status(500);
        let h = harness(mock.media_url(), StreamProtocol::Hls);

        h.transport.start().unwrap();
        assert!(wait_until(|| !h.errors.lock().is_empty()).await);
        assert_eq!(h.errors.lock()[0].kind(), ErrorKind::Runtime);
        assert!(h.sink.fragments().is_empty());
    }

    #[tokio::test]
    async fn test_load_timeout_reports_offline() {
        // accepts connections but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/live/index.m3u8", listener.local_addr().unwrap());
        let h = harness_with(
            url,
            StreamProtocol::Hls,
            HlsConfig {
                load_timeout_ms: 200,
                ..Default::default()
            },
        );

        h.transport.start().unwrap();
        assert!(wait_until(|| !h.errors.lock().is_empty()).await);
        assert!(matches!(h.errors.lock()[0], PlayerError::LoadTimeout(200)));
        assert_eq!(
            h.errors.lock()[0].notice(),
            crate::error::PlayerNotice::Offline
        );
        drop(listener);
    }

    #[tokio::test]
    async fn test_low_latency_uses_parts_and_blocking_reload() {
        let playlist = "#EXTM3U\n\
            #EXT-X-VERSION:9\n\
            #EXT-X-TARGETDURATION:1\n\
            #EXT-X-SERVER-CONTROL:CAN-BLOCK-RELOAD=YES\n\
            #EXT-X-PART-INF:PART-TARGET=0.2\n\
            #EXT-X-MEDIA-SEQUENCE:5\n\
            #EXTINF:1.0,\n\
            seg5.ts\n\
            #EXT-X-PART:DURATION=0.2,URI=\"part6_0.ts\",INDEPENDENT=YES\n\
            #EXT-X-PART:DURATION=0.2,URI=\"part6_1.ts\"\n";
        let mock = HlsMock::spawn(playlist).await;
        let h = harness(mock.media_url(), StreamProtocol::LlHls);

        h.transport.start().unwrap();
        assert!(wait_until(|| mock.requests().iter().any(|r| r.contains("_HLS_msn=6"))).await);

        let reload = mock
            .requests()
            .into_iter()
            .find(|r| r.contains("_HLS_msn"))
            .unwrap();
        assert!(reload.contains("_HLS_part=2"));

        let parts: Vec<Option<usize>> = h.sink.fragments().iter().map(|f| f.part).collect();
        assert_eq!(parts, vec![None, Some(0), Some(1)]);
        h.transport.close();
    }

    #[tokio::test]
    async fn test_pause_suspends_loading() {
        let mock = HlsMock::spawn(&live_playlist(0, 3)).await;
        let h = harness(mock.media_url(), StreamProtocol::Hls);

        h.transport.pause();
        h.transport.start().unwrap();
        assert!(wait_until(|| mock.count("index.m3u8") >= 1).await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(mock.count(".ts"), 0);

        h.transport.play();
        assert!(wait_until(|| h.sink.fragments().len() >= 3).await);
    }

    #[tokio::test]
    async fn test_stats_report_fragments_and_latency() {
        let now = Utc::now() - chrono::Duration::seconds(4);
        let playlist = format!(
            "#EXTM3U\n#EXT-X-TARGETDURATION:1\n#EXT-X-MEDIA-SEQUENCE:0\n\
             #EXT-X-PROGRAM-DATE-TIME:{}\n#EXTINF:1.0,\nseg0.ts\n#EXTINF:1.0,\nseg1.ts\n",
            now.to_rfc3339()
        );
        let mock = HlsMock::spawn(&playlist).await;
        let records = Arc::new(Mutex::new(Vec::<Vec<PlayerStatsRecord>>::new()));
        let r = records.clone();
        let config = ReaderConfiguration::new(mock.media_url(), StreamProtocol::Hls)
            .with_stats_interval(Duration::from_millis(50))
            .on_stats(move |batch| r.lock().push(batch));
        let transport = HlsTransport::new(
            config,
            &transport_context(Arc::new(FakePeerConnector::default())),
            Arc::new(MemorySink::default()),
            true,
        )
        .unwrap();

        transport.start().unwrap();
        let complete = |batch: &Vec<PlayerStatsRecord>| {
            batch
                .iter()
                .any(|rec| *rec == PlayerStatsRecord::value(keys::FRAGMENTS, "2"))
        };
        assert!(wait_until(|| records.lock().iter().any(complete)).await);
        transport.close();

        let batch = records.lock().iter().find(|b| complete(b)).cloned().unwrap();
        assert!(batch.iter().any(|rec| rec.key() == keys::LATENCY));
        assert!(batch.iter().all(|rec| rec.key() != keys::PARTS));
    }

    #[tokio::test]
    async fn test_recoverable_errors_are_not_escalated() {
        let mock = HlsMock::spawn(&live_playlist(0, 3)).await;
        let h = harness(mock.media_url(), StreamProtocol::Hls);
        h.transport.pause();
        h.transport.start().unwrap();

        let error = |kind, status| {
            HlsEvent::Error(HlsLoadError {
                fatal: false,
                kind,
                details: "flaky".into(),
                status,
            })
        };
        h.transport.inner.handle_event(error(HlsErrorKind::Network, None));
        h.transport.inner.handle_event(error(HlsErrorKind::Network, Some(304)));
        h.transport.inner.handle_event(error(HlsErrorKind::Media, Some(500)));
        assert!(h.errors.lock().is_empty());
        assert_eq!(h.transport.state(), ReaderState::Running);

        h.transport.inner.handle_event(error(HlsErrorKind::Network, Some(503)));
        assert_eq!(h.errors.lock().len(), 1);
        assert_eq!(h.errors.lock()[0].kind(), ErrorKind::Runtime);
        assert_eq!(h.transport.state(), ReaderState::Closed);
    }

    #[tokio::test]
    async fn test_unusable_target_duration_fails_attempt() {
        let playlist = "#EXTM3U\n#EXT-X-TARGETDURATION:1e30\n#EXT-X-MEDIA-SEQUENCE:0\n\
            #EXTINF:1.0,\nseg0.ts\n";
        let mock = HlsMock::spawn(playlist).await;
        let h = harness(mock.media_url(), StreamProtocol::Hls);

        h.transport.start().unwrap();
        assert!(wait_until(|| !h.errors.lock().is_empty()).await);
        assert_eq!(h.errors.lock()[0].kind(), ErrorKind::Runtime);
        assert!(h.errors.lock()[0].to_string().contains("invalid target duration"));
        assert_eq!(h.transport.state(), ReaderState::Closed);
        assert!(h.sink.fragments().is_empty());
    }

    #[tokio::test]
    async fn test_unusable_reload_playlist_fails_attempt() {
        let mock = HlsMock::spawn(&live_playlist(0, 2)).await;
        let h = harness_with(
            mock.media_url(),
            StreamProtocol::Hls,
            HlsConfig {
                max_fragment_retries: 0,
                ..Default::default()
            },
        );

        h.transport.start().unwrap();
        assert!(wait_until(|| h.sink.fragments().len() >= 2).await);
        mock.set_playlist(
            "#EXTM3U\n#EXT-X-TARGETDURATION:inf\n#EXT-X-MEDIA-SEQUENCE:0\n#EXTINF:1.0,\nseg0.ts\n",
        );

        assert!(wait_until(|| !h.errors.lock().is_empty()).await);
        assert_eq!(h.errors.lock()[0].kind(), ErrorKind::Runtime);
        assert_eq!(h.transport.state(), ReaderState::Closed);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.errors.lock().len(), 1);
    }
}
