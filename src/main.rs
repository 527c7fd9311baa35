use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stream_player::config::{Credentials, JsonPreferenceStore, PlayerConfig, PreferenceStore};
use stream_player::orchestrator::{PlayerContext, PlayerStatus, StreamOrchestrator};
use stream_player::sink::{HlsFragment, RemoteTrack, SinkEvent, VideoSink};
use stream_player::stats::PlayerStatsRecord;
use stream_player::StreamProtocol;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// stream-player command line arguments
#[derive(Parser, Debug)]
#[command(name = "stream-player")]
#[command(version, about = "Live stream player for WHEP WebRTC, HLS and LL-HLS", long_about = None)]
struct CliArgs {
    /// WHEP endpoint of the stream
    #[arg(long, value_name = "URL")]
    webrtc_url: Option<String>,

    /// HLS playlist of the stream
    #[arg(long, value_name = "URL")]
    hls_url: Option<String>,

    /// Readiness/codec metadata endpoint
    #[arg(long, value_name = "URL")]
    readiness_url: Option<String>,

    /// Start with this protocol (hls, ll-hls, webrtc, webrtc-tcp, webrtc-udp)
    #[arg(long, value_name = "PROTOCOL")]
    protocol: Option<StreamProtocol>,

    /// JSON configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Data directory for persisted preferences
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Append HLS media to this file
    #[arg(short = 'o', long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Username for basic authentication
    #[arg(long, requires = "password")]
    username: Option<String>,

    /// Password for basic authentication
    #[arg(long, requires = "username")]
    password: Option<String>,

    /// Bearer token
    #[arg(long, conflicts_with = "username")]
    token: Option<String>,

    /// Sample and log playback statistics
    #[arg(long)]
    debug: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose, args.log_json);

    tracing::info!("Starting stream-player v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => load_config(path).await?,
        None => PlayerConfig::default(),
    };

    // CLI overrides
    if let Some(url) = args.webrtc_url {
        config.endpoints.webrtc_url = Some(url);
    }
    if let Some(url) = args.hls_url {
        config.endpoints.hls_url = Some(url);
    }
    if let Some(url) = args.readiness_url {
        config.endpoints.readiness_url = Some(url);
    }
    if let (Some(username), Some(password)) = (args.username, args.password) {
        config.credentials = Some(Credentials::Basic { username, password });
    } else if let Some(token) = args.token {
        config.credentials = Some(Credentials::Bearer { token });
    }

    if config.endpoints.webrtc_url.is_none() && config.endpoints.hls_url.is_none() {
        anyhow::bail!("no stream URL configured, pass --webrtc-url and/or --hls-url");
    }

    let data_dir = args.data_dir.unwrap_or_else(get_data_dir);
    tracing::info!("Data directory: {}", data_dir.display());
    let preferences = Arc::new(JsonPreferenceStore::open(&data_dir.join("player.json")).await?);
    if let Some(protocol) = args.protocol {
        preferences.save(protocol).await?;
    }

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let sink = LoggingSink::new(events_tx, args.output.as_deref()).await?;
    sink.spawn_stall_monitor(Duration::from_millis(2000));

    let context = PlayerContext::new(config, preferences)?;
    let handle = StreamOrchestrator::spawn(context, sink.clone(), events_rx);
    if args.debug {
        handle.set_debug(true);
    }

    let mut status = handle.subscribe();
    let reporter = tokio::spawn(async move {
        let mut last: Option<PlayerStatus> = None;
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            report_status(last.as_ref(), &current);
            last = Some(current);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for CTRL+C")?;
    tracing::info!("Shutdown signal received");

    handle.shutdown().await;
    reporter.abort();
    sink.reset();
    tracing::info!(
        "Received {} RTP packets and {} HLS bytes",
        sink.packets.load(Ordering::Relaxed),
        sink.hls_bytes.load(Ordering::Relaxed)
    );
    Ok(())
}

async fn load_config(path: &Path) -> anyhow::Result<PlayerConfig> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: PlayerConfig = serde_json::from_str(&json)
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    Ok(config)
}

fn report_status(previous: Option<&PlayerStatus>, current: &PlayerStatus) {
    let changed = |f: fn(&PlayerStatus) -> String| previous.map(f) != Some(f(current));

    if changed(|s| format!("{:?}", s.menu_protocols)) && !current.menu_protocols.is_empty() {
        let menu: Vec<String> = current.menu_protocols.iter().map(|p| p.to_string()).collect();
        tracing::info!("Available protocols: {}", menu.join(", "));
    }
    if changed(|s| format!("{:?}/{:?}", s.phase, s.protocol)) {
        tracing::info!(
            "Player {:?} (protocol: {})",
            current.phase,
            current
                .protocol
                .map(|p| p.to_string())
                .unwrap_or_else(|| "none".to_string())
        );
    }
    if changed(|s| format!("{:?}", s.notice)) {
        match &current.notice {
            Some(notice) if notice.is_persistent() => tracing::error!("{}", notice),
            Some(notice) => tracing::warn!("{}", notice),
            None => {}
        }
    }
    if current.debug && !current.stats.is_empty() {
        let line: Vec<String> = current
            .stats
            .iter()
            .chain(current.global_stats.iter())
            .map(|record| match record {
                PlayerStatsRecord::Value { key, value } => format!("{}={}", key, value),
                PlayerStatsRecord::Graph {
                    key, value_string, ..
                } => format!("{}={}", key, value_string),
            })
            .collect();
        tracing::debug!("Stats: {}", line.join(" "));
    }
}

/// Sink that counts what it receives and optionally records HLS media.
///
/// Raises `Playing` when media starts flowing and `Waiting` when it stops.
struct LoggingSink {
    events: mpsc::UnboundedSender<SinkEvent>,
    output: Option<mpsc::UnboundedSender<Bytes>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    last_media: Arc<Mutex<Option<Instant>>>,
    packets: Arc<AtomicU64>,
    hls_bytes: AtomicU64,
}

impl LoggingSink {
    async fn new(
        events: mpsc::UnboundedSender<SinkEvent>,
        output: Option<&Path>,
    ) -> anyhow::Result<Arc<Self>> {
        let output = match output {
            Some(path) => {
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .with_context(|| format!("failed to open {}", path.display()))?;
                let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
                tokio::spawn(async move {
                    while let Some(data) = rx.recv().await {
                        if let Err(e) = file.write_all(&data).await {
                            tracing::error!("Failed to write output: {}", e);
                            break;
                        }
                    }
                });
                Some(tx)
            }
            None => None,
        };

        Ok(Arc::new(Self {
            events,
            output,
            readers: Mutex::new(Vec::new()),
            last_media: Arc::new(Mutex::new(None)),
            packets: Arc::new(AtomicU64::new(0)),
            hls_bytes: AtomicU64::new(0),
        }))
    }

    fn media_received(&self) {
        let previous = self.last_media.lock().replace(Instant::now());
        if previous.is_none() {
            let _ = self.events.send(SinkEvent::Playing);
        }
    }

    fn spawn_stall_monitor(self: &Arc<Self>, threshold: Duration) {
        let sink = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(500));
            loop {
                ticker.tick().await;
                let Some(sink) = sink.upgrade() else {
                    return;
                };
                let mut last = sink.last_media.lock();
                if last.is_some_and(|t| t.elapsed() > threshold) {
                    // media stopped; the next packet raises Playing again
                    *last = None;
                    let _ = sink.events.send(SinkEvent::Waiting);
                }
            }
        });
    }
}

impl VideoSink for LoggingSink {
    fn attach_track(&self, track: RemoteTrack) {
        tracing::info!("Attached {} track ({}, ssrc {})", track.kind, track.codec, track.ssrc);
        let Some(remote) = track.track else {
            self.media_received();
            return;
        };

        let events = self.events.clone();
        let packets = self.packets.clone();
        let last_media = self.last_media.clone();
        let handle = tokio::spawn(async move {
            let mut count = 0u64;
            while let Ok((packet, _)) = remote.read_rtp().await {
                if count == 0 {
                    tracing::debug!("First RTP packet (pt {})", packet.header.payload_type);
                }
                count += 1;
                packets.fetch_add(1, Ordering::Relaxed);
                if last_media.lock().replace(Instant::now()).is_none() {
                    let _ = events.send(SinkEvent::Playing);
                }
            }
            tracing::debug!("Track ended after {} packets", count);
        });
        self.readers.lock().push(handle);
    }

    fn append_fragment(&self, fragment: HlsFragment) {
        tracing::trace!("Appending {} ({} bytes)", fragment.url, fragment.data.len());
        self.hls_bytes
            .fetch_add(fragment.data.len() as u64, Ordering::Relaxed);
        if let Some(output) = &self.output {
            let _ = output.send(fragment.data);
        }
        self.media_received();
    }

    fn reset(&self) {
        for reader in self.readers.lock().drain(..) {
            reader.abort();
        }
        *self.last_media.lock() = None;
    }
}

fn init_logging(level: LogLevel, verbose_count: u8, json: bool) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "stream_player=error,webrtc=error",
        LogLevel::Warn => "stream_player=warn,webrtc=warn",
        LogLevel::Info => "stream_player=info,webrtc=warn",
        LogLevel::Verbose => "stream_player=debug,webrtc=warn",
        LogLevel::Debug => "stream_player=debug,webrtc=info",
        LogLevel::Trace => "stream_player=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Get the application data directory
fn get_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("STREAM_PLAYER_DATA_DIR") {
        return PathBuf::from(path);
    }
    PathBuf::from(".stream-player")
}
