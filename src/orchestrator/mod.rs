//! Stream orchestrator
//!
//! Owns the sink and at most one active [`Transport`]. Cycles through
//! readiness polling, protocol selection, negotiation and playback, and
//! falls back to polling after every failure:
//!
//! ```text
//! Polling -> SelectingProtocol -> Negotiating -> Playing
//!    ^                                  |           |
//!    +------- retry after delay --------+-----------+
//! ```
//!
//! Every attempt gets a generation number. Callbacks and timers carry the
//! generation they were created for, and anything tagged with an older one
//! is dropped.

pub mod readiness;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use readiness::{HttpReadinessSource, ReadinessSource, StaticReadiness, StreamReadiness};

use crate::config::{PlayerConfig, PreferenceStore};
use crate::error::{PlayerError, PlayerNotice, Result};
use crate::protocol::{resolve_preference, visible_protocols, StreamProtocol};
use crate::scheduler::{millis, Scheduler, TaskHandle};
use crate::sink::{SinkEvent, VideoSink};
use crate::stats::{keys, PlayerStatsRecord, StatsBoard};
use crate::transport::{
    ConfiguredDecoders, DecoderCapabilities, ReaderConfiguration, Transport, TransportContext,
};
use crate::webrtc::RtcPeerConnector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerPhase {
    Polling,
    SelectingProtocol,
    Negotiating,
    Playing,
    Stopped,
}

/// Snapshot published after every state change
#[derive(Debug, Clone, Serialize)]
pub struct PlayerStatus {
    pub phase: PlayerPhase,
    /// Message for the viewer; `None` while playing
    pub notice: Option<PlayerNotice>,
    pub protocol: Option<StreamProtocol>,
    /// Protocols supported by both sink and server, in priority order
    pub valid_protocols: Vec<StreamProtocol>,
    /// Entries of the protocol menu
    pub menu_protocols: Vec<StreamProtocol>,
    pub debug: bool,
    pub stats: Vec<PlayerStatsRecord>,
    pub global_stats: Vec<PlayerStatsRecord>,
}

impl PlayerStatus {
    fn initial() -> Self {
        Self {
            phase: PlayerPhase::Polling,
            notice: Some(PlayerNotice::Loading),
            protocol: None,
            valid_protocols: Vec::new(),
            menu_protocols: Vec::new(),
            debug: false,
            stats: Vec::new(),
            global_stats: Vec::new(),
        }
    }
}

/// Everything the orchestrator depends on
pub struct PlayerContext {
    pub config: PlayerConfig,
    pub transport: TransportContext,
    pub readiness: Arc<dyn ReadinessSource>,
    pub preferences: Arc<dyn PreferenceStore>,
    pub decoders: Arc<dyn DecoderCapabilities>,
}

impl PlayerContext {
    /// Production wiring: reqwest client, webrtc-rs peers, HTTP readiness
    /// when an endpoint is configured, decoders from the config.
    pub fn new(config: PlayerConfig, preferences: Arc<dyn PreferenceStore>) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder().build()?;

        let readiness: Arc<dyn ReadinessSource> = match &config.endpoints.readiness_url {
            Some(url) => Arc::new(HttpReadinessSource::new(
                http.clone(),
                url.clone(),
                config.credentials.as_ref().map(|c| c.header_value()),
            )),
            None => Arc::new(StaticReadiness(StreamReadiness::assumed())),
        };

        Ok(Self {
            transport: TransportContext {
                http,
                peers: Arc::new(RtcPeerConnector::new()),
                webrtc: config.webrtc.clone(),
                hls: config.hls.clone(),
            },
            readiness,
            preferences,
            decoders: Arc::new(ConfiguredDecoders::new(&config.decoders)),
            config,
        })
    }
}

enum Command {
    SetProtocol(StreamProtocol),
    SetDebug(bool),
    Shutdown,
}

enum Event {
    Readiness {
        generation: u64,
        readiness: StreamReadiness,
    },
    TransportError {
        generation: u64,
        error: PlayerError,
    },
    TransportStats {
        generation: u64,
        records: Vec<PlayerStatsRecord>,
    },
    Retry {
        generation: u64,
    },
    StallTimeout {
        generation: u64,
    },
}

/// Control handle of a running orchestrator
pub struct OrchestratorHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<PlayerStatus>,
    task: JoinHandle<()>,
}

impl OrchestratorHandle {
    /// Switch protocol explicitly; the choice is persisted
    pub fn set_protocol(&self, protocol: StreamProtocol) {
        let _ = self.commands.send(Command::SetProtocol(protocol));
    }

    pub fn set_debug(&self, enabled: bool) {
        let _ = self.commands.send(Command::SetDebug(enabled));
    }

    pub fn status(&self) -> PlayerStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlayerStatus> {
        self.status.clone()
    }

    /// Close the active transport, cancel all timers and wait for the actor
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Err(e) = self.task.await {
            warn!("Orchestrator task ended abnormally: {}", e);
        }
    }
}

pub struct StreamOrchestrator {
    context: PlayerContext,
    sink: Arc<dyn VideoSink>,
    status: watch::Sender<PlayerStatus>,
    events: mpsc::UnboundedSender<Event>,
    scheduler: Scheduler,
    generation: u64,
    active: Option<Transport>,
    protocol: Option<StreamProtocol>,
    valid: Vec<StreamProtocol>,
    requested: Option<StreamProtocol>,
    debug: bool,
    stats: StatsBoard,
    global_stats: StatsBoard,
    polling: Option<TaskHandle>,
    retry: Option<TaskHandle>,
    stall: Option<TaskHandle>,
}

impl StreamOrchestrator {
    pub fn spawn(
        context: PlayerContext,
        sink: Arc<dyn VideoSink>,
        sink_events: mpsc::UnboundedReceiver<SinkEvent>,
    ) -> OrchestratorHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(PlayerStatus::initial());
        let history = context.config.stats_max_history;

        let orchestrator = Self {
            context,
            sink,
            status: status_tx,
            events: events_tx,
            scheduler: Scheduler::new(),
            generation: 0,
            active: None,
            protocol: None,
            valid: Vec::new(),
            requested: None,
            debug: false,
            stats: StatsBoard::new(history),
            global_stats: StatsBoard::new(history),
            polling: None,
            retry: None,
            stall: None,
        };
        let task = tokio::spawn(orchestrator.run(commands_rx, events_rx, sink_events));

        OrchestratorHandle {
            commands: commands_tx,
            status: status_rx,
            task,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
        mut sink_events: mpsc::UnboundedReceiver<SinkEvent>,
    ) {
        info!("Stream orchestrator started");
        self.poll();

        let mut sink_open = true;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::SetProtocol(protocol)) => self.switch_protocol(protocol),
                    Some(Command::SetDebug(enabled)) => self.set_debug(enabled),
                    Some(Command::Shutdown) | None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
                event = sink_events.recv(), if sink_open => match event {
                    Some(event) => self.handle_sink_event(event),
                    None => {
                        debug!("Sink event channel closed");
                        sink_open = false;
                    }
                },
            }
        }

        self.stop();
    }

    fn publish(&self, f: impl FnOnce(&mut PlayerStatus)) {
        self.status.send_modify(f);
    }

    fn set_phase(&self, phase: PlayerPhase) {
        self.publish(|s| s.phase = phase);
    }

    fn poll(&mut self) {
        self.retry = None;
        self.set_phase(PlayerPhase::Polling);

        let generation = self.generation;
        let source = self.context.readiness.clone();
        let events = self.events.clone();
        let handle = self.scheduler.spawn(move |_token| async move {
            let readiness = match source.fetch().await {
                Ok(readiness) => readiness,
                Err(e) => {
                    warn!("Readiness unavailable, assuming stream is ready: {}", e);
                    StreamReadiness::assumed()
                }
            };
            let _ = events.send(Event::Readiness {
                generation,
                readiness,
            });
        });
        self.polling = Some(handle);
    }

    fn schedule_retry(&mut self) {
        let generation = self.generation;
        let events = self.events.clone();
        let delay = millis(self.context.config.retry_interval_ms);
        debug!("Retrying in {:?}", delay);
        self.retry = Some(self.scheduler.after(delay, async move {
            let _ = events.send(Event::Retry { generation });
        }));
    }

    /// Protocols with an endpoint and decodable codecs, in priority order
    fn supported_protocols(&self, codecs: &[String]) -> Vec<StreamProtocol> {
        let config = &self.context.config;
        config
            .protocol_priority
            .iter()
            .copied()
            .filter(|p| config.endpoints.url_for(*p).is_some())
            .filter(|p| Transport::supported(*p, codecs, self.context.decoders.as_ref()))
            .collect()
    }

    fn on_readiness(&mut self, readiness: StreamReadiness) {
        self.polling = None;
        if !readiness.ready {
            debug!("Stream not ready");
            self.publish(|s| s.notice = Some(PlayerNotice::Offline));
            self.schedule_retry();
            return;
        }

        self.set_phase(PlayerPhase::SelectingProtocol);
        self.valid = self.supported_protocols(&readiness.codecs);
        let valid = self.valid.clone();
        let menu = visible_protocols(&valid, self.context.config.show_transport_variants);
        self.publish(|s| {
            s.valid_protocols = valid;
            s.menu_protocols = menu;
        });

        let preferred = self
            .requested
            .or_else(|| self.context.preferences.load());
        match resolve_preference(preferred, &self.context.config.protocol_priority, &self.valid) {
            Some(protocol) => self.negotiate(protocol),
            None => {
                warn!(
                    "No protocol supported for codecs {:?}",
                    readiness.codecs
                );
                self.protocol = None;
                self.publish(|s| {
                    s.protocol = None;
                    s.notice = Some(PlayerNotice::DeviceUnsupported);
                    s.phase = PlayerPhase::Polling;
                });
                self.schedule_retry();
            }
        }
    }

    fn negotiate(&mut self, protocol: StreamProtocol) {
        self.retire_transport();
        self.generation += 1;
        let generation = self.generation;
        self.protocol = Some(protocol);
        self.publish(|s| {
            s.phase = PlayerPhase::Negotiating;
            s.protocol = Some(protocol);
        });

        let Some(url) = self
            .context
            .config
            .endpoints
            .url_for(protocol)
            .map(str::to_string)
        else {
            self.fail(PlayerError::ProtocolUnavailable(protocol));
            return;
        };
        info!("Negotiating {} with {}", protocol, url);

        let errors = self.events.clone();
        let stats = self.events.clone();
        let config = ReaderConfiguration::new(url, protocol)
            .with_credentials(self.context.config.credentials.clone())
            .with_stats_interval(millis(self.context.config.stats_refresh_interval_ms))
            .on_error(move |error| {
                let _ = errors.send(Event::TransportError { generation, error });
            })
            .on_stats(move |records| {
                let _ = stats.send(Event::TransportStats {
                    generation,
                    records,
                });
            });

        let started = Transport::for_protocol(
            config,
            &self.context.transport,
            self.sink.clone(),
            self.debug,
        )
        .and_then(|transport| {
            transport.start()?;
            Ok(transport)
        });

        match started {
            Ok(transport) => self.active = Some(transport),
            Err(e) => self.fail(e),
        }
    }

    /// Close the active transport and detach it from the sink
    fn retire_transport(&mut self) {
        self.stall = None;
        if let Some(transport) = self.active.take() {
            transport.close();
            self.sink.reset();
        }
    }

    fn fail(&mut self, error: PlayerError) {
        match self.protocol {
            Some(protocol) => error!("{} playback failed: {}", protocol, error),
            None => error!("Playback failed: {}", error),
        }
        self.retire_transport();
        self.generation += 1;
        self.stats.clear();

        let notice = error.notice();
        self.publish(|s| {
            s.phase = PlayerPhase::Polling;
            s.notice = Some(notice);
            s.stats.clear();
        });

        if error.is_retryable() {
            self.schedule_retry();
        }
    }

    fn switch_protocol(&mut self, protocol: StreamProtocol) {
        info!("Switching to {}", protocol);
        self.requested = Some(protocol);
        self.save_preference(protocol);
        self.retry = None;
        self.polling = None;
        self.stats.clear();
        self.publish(|s| {
            s.notice = Some(PlayerNotice::Loading);
            s.stats.clear();
        });

        if self.valid.contains(&protocol) {
            self.negotiate(protocol);
        } else {
            self.retire_transport();
            self.generation += 1;
            self.poll();
        }
    }

    fn set_debug(&mut self, enabled: bool) {
        self.debug = enabled;
        if let Some(transport) = &self.active {
            transport.set_debug_state(enabled);
        }
        if !enabled {
            self.stats.clear();
        }
        let stats = self.stats.records().to_vec();
        self.publish(|s| {
            s.debug = enabled;
            s.stats = stats;
        });
    }

    fn save_preference(&self, protocol: StreamProtocol) {
        if self.context.preferences.load() == Some(protocol) {
            return;
        }
        let preferences = self.context.preferences.clone();
        tokio::spawn(async move {
            if let Err(e) = preferences.save(protocol).await {
                warn!("Failed to save protocol preference: {}", e);
            }
        });
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Readiness {
                generation,
                readiness,
            } if generation == self.generation => self.on_readiness(readiness),
            Event::TransportError { generation, error } if generation == self.generation => {
                self.fail(error)
            }
            Event::TransportStats {
                generation,
                records,
            } if generation == self.generation => {
                if self.debug {
                    self.stats.merge(records);
                    let stats = self.stats.records().to_vec();
                    self.publish(|s| s.stats = stats);
                }
            }
            Event::Retry { generation } if generation == self.generation => self.poll(),
            Event::StallTimeout { generation } if generation == self.generation => {
                if self.stall.take().is_some() {
                    warn!("Video stalled for {} ms", self.context.config.stall_timeout_ms);
                    self.fail(PlayerError::Stalled);
                }
            }
            _ => debug!("Dropping event from a previous attempt"),
        }
    }

    fn arm_stall_watchdog(&mut self) {
        if self.active.is_none() || self.stall.is_some() {
            return;
        }
        let generation = self.generation;
        let events = self.events.clone();
        let delay = millis(self.context.config.stall_timeout_ms);
        self.stall = Some(self.scheduler.after(delay, async move {
            let _ = events.send(Event::StallTimeout { generation });
        }));
    }

    fn handle_sink_event(&mut self, event: SinkEvent) {
        match event {
            SinkEvent::Play => {
                if let Some(transport) = &self.active {
                    transport.play();
                }
            }
            SinkEvent::Pause => {
                if let Some(transport) = &self.active {
                    transport.pause();
                }
            }
            SinkEvent::Waiting | SinkEvent::Stalled => self.arm_stall_watchdog(),
            SinkEvent::Playing => {
                self.stall = None;
                if self.active.is_none() {
                    return;
                }
                if let Some(protocol) = self.protocol {
                    if self.status.borrow().phase != PlayerPhase::Playing {
                        info!("Playing via {}", protocol);
                        self.save_preference(protocol);
                    }
                }
                self.publish(|s| {
                    s.phase = PlayerPhase::Playing;
                    s.notice = None;
                });
            }
            SinkEvent::LoadedData { width, height } => {
                self.global_stats.merge(vec![PlayerStatsRecord::value(
                    keys::RESOLUTION,
                    format!("{}x{}", width, height),
                )]);
                let global = self.global_stats.records().to_vec();
                self.publish(|s| s.global_stats = global);
            }
        }
    }

    fn stop(&mut self) {
        self.retire_transport();
        self.scheduler.cancel_all();
        self.polling = None;
        self.retry = None;
        self.generation += 1;
        self.publish(|s| {
            s.phase = PlayerPhase::Stopped;
            s.stats.clear();
        });
        info!("Stream orchestrator stopped");
    }
}
