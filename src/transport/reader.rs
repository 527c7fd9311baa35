//! Shared transport reader state
//!
//! [`ReaderCore`] carries what both transport variants need: the per-attempt
//! configuration, the monotonic [`ReaderState`], the single error path and
//! the stats sampling loop. All timers are owned by the core's scheduler and
//! die with `close()`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::Credentials;
use crate::error::{PlayerError, Result};
use crate::protocol::StreamProtocol;
use crate::scheduler::{Scheduler, TaskHandle};
use crate::stats::{normalize, PlayerStatsRecord, TransportSample};

/// Transport lifecycle: Initializing -> Running -> Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReaderState {
    Initializing,
    Running,
    Closed,
}

impl std::fmt::Display for ReaderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReaderState::Initializing => write!(f, "Initializing"),
            ReaderState::Running => write!(f, "Running"),
            ReaderState::Closed => write!(f, "Closed"),
        }
    }
}

pub type ErrorCallback = Arc<dyn Fn(PlayerError) + Send + Sync>;
pub type StatsCallback = Arc<dyn Fn(Vec<PlayerStatsRecord>) + Send + Sync>;

/// Immutable per-attempt configuration, owned by one transport
#[derive(Clone)]
pub struct ReaderConfiguration {
    pub url: String,
    pub protocol: StreamProtocol,
    pub credentials: Option<Credentials>,
    /// Stats sampling interval; `None` disables sampling entirely
    pub stats_interval: Option<Duration>,
    pub on_error: ErrorCallback,
    pub on_stats: StatsCallback,
}

impl ReaderConfiguration {
    pub fn new(url: impl Into<String>, protocol: StreamProtocol) -> Self {
        Self {
            url: url.into(),
            protocol,
            credentials: None,
            stats_interval: None,
            on_error: Arc::new(|_| {}),
            on_stats: Arc::new(|_| {}),
        }
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = Some(interval);
        self
    }

    pub fn on_error(mut self, f: impl Fn(PlayerError) + Send + Sync + 'static) -> Self {
        self.on_error = Arc::new(f);
        self
    }

    pub fn on_stats(mut self, f: impl Fn(Vec<PlayerStatsRecord>) + Send + Sync + 'static) -> Self {
        self.on_stats = Arc::new(f);
        self
    }

    /// `Authorization` header value for the configured credentials
    pub fn auth_header(&self) -> Option<String> {
        self.credentials.as_ref().map(Credentials::header_value)
    }
}

impl std::fmt::Debug for ReaderConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderConfiguration")
            .field("url", &self.url)
            .field("protocol", &self.protocol)
            .field("credentials", &self.credentials.is_some())
            .field("stats_interval", &self.stats_interval)
            .finish()
    }
}

/// Source of raw samples for the stats loop
#[async_trait]
pub(crate) trait StatsSource: Send + Sync + 'static {
    /// Read counters for one tick; `None` skips the tick
    async fn sample(&self, interval: Duration) -> Option<TransportSample>;

    /// Forget the bandwidth baseline (sampling was paused)
    fn reset_baseline(&self);
}

pub(crate) struct ReaderCore {
    config: ReaderConfiguration,
    state: Mutex<ReaderState>,
    debug: watch::Sender<bool>,
    scheduler: Scheduler,
    tasks: Mutex<Vec<TaskHandle>>,
}

impl ReaderCore {
    pub fn new(config: ReaderConfiguration, debug: bool) -> Self {
        let (debug_tx, _) = watch::channel(debug);
        Self {
            config,
            state: Mutex::new(ReaderState::Initializing),
            debug: debug_tx,
            scheduler: Scheduler::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ReaderConfiguration {
        &self.config
    }

    pub fn protocol(&self) -> StreamProtocol {
        self.config.protocol
    }

    pub fn state(&self) -> ReaderState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ReaderState::Running
    }

    /// Initializing -> Running
    pub fn begin(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != ReaderState::Initializing {
            return Err(PlayerError::InvalidState(*state));
        }
        *state = ReaderState::Running;
        Ok(())
    }

    /// Error out of a negotiation step if the reader was closed meanwhile
    pub fn ensure_running(&self) -> Result<()> {
        match self.state() {
            ReaderState::Running => Ok(()),
            other => Err(PlayerError::InvalidState(other)),
        }
    }

    /// Transition to Closed and cancel owned timers. Returns `false` if the
    /// reader was already closed.
    pub fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state == ReaderState::Closed {
                return false;
            }
            *state = ReaderState::Closed;
        }
        self.scheduler.cancel_all();
        self.tasks.lock().clear();
        true
    }

    /// Report a failure through the error callback and close. Only the first
    /// failure of a reader is reported; later ones return `false`.
    pub fn fail(&self, err: PlayerError) -> bool {
        if !self.close() {
            debug!("Dropping error on closed {} reader: {}", self.protocol(), err);
            return false;
        }
        warn!("{} transport failed: {}", self.protocol(), err);
        (self.config.on_error)(err);
        true
    }

    pub fn emit_stats(&self, records: Vec<PlayerStatsRecord>) {
        if self.is_running() {
            (self.config.on_stats)(records);
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Keep a task alive until the reader closes
    pub fn hold(&self, handle: TaskHandle) {
        if self.state() == ReaderState::Closed {
            handle.cancel();
            return;
        }
        self.tasks.lock().push(handle);
    }

    pub fn set_debug(&self, enabled: bool) {
        self.debug.send_replace(enabled);
    }

    pub fn debug_enabled(&self) -> bool {
        *self.debug.borrow()
    }

    /// Start the stats loop: one sample per interval while debug is enabled
    /// and the reader is running.
    pub fn spawn_stats_sampler(self: &Arc<Self>, source: Arc<dyn StatsSource>) {
        let Some(interval) = self.config.stats_interval else {
            return;
        };
        let core = self.clone();
        let mut debug_rx = self.debug.subscribe();

        let handle = self.scheduler.spawn(move |_token| async move {
            loop {
                while !*debug_rx.borrow_and_update() {
                    if debug_rx.changed().await.is_err() {
                        return;
                    }
                    source.reset_baseline();
                }

                tokio::time::sleep(interval).await;
                if core.state() == ReaderState::Closed {
                    return;
                }
                if !core.is_running() || !*debug_rx.borrow() {
                    continue;
                }

                if let Some(sample) = source.sample(interval).await {
                    core.emit_stats(normalize(core.protocol(), &sample));
                }
            }
        });
        self.hold(handle);
    }
}
