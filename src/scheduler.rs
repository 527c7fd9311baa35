//! Cancellable scheduled tasks
//!
//! Every timer in the player (retry, stats sampling, stall watchdog, HLS load
//! timeout) is spawned through a [`Scheduler`]. Scheduling returns a
//! [`TaskHandle`]; dropping or cancelling the handle cancels the task, and
//! cancelling the scheduler cancels everything it spawned.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Owner of a group of cancellable tasks
#[derive(Debug, Default)]
pub struct Scheduler {
    root: CancellationToken,
}

/// Handle to a single scheduled task. Cancels the task when dropped.
#[derive(Debug)]
#[must_use = "dropping a TaskHandle cancels the task"]
pub struct TaskHandle {
    token: CancellationToken,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
        }
    }

    /// Run `task` once after `delay` unless cancelled first.
    pub fn after<F>(&self, delay: Duration, task: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.root.child_token();
        let guard = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = guard.cancelled() => {
                    trace!("Scheduled task cancelled before firing");
                }
                _ = tokio::time::sleep(delay) => {
                    if !guard.is_cancelled() {
                        task.await;
                    }
                }
            }
        });
        TaskHandle { token }
    }

    /// Spawn a long-running task that receives its own cancellation token.
    ///
    /// The future is dropped as soon as the token is cancelled, so the task
    /// does not need to poll the token at every await point.
    pub fn spawn<F, Fut>(&self, task: F) -> TaskHandle
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.root.child_token();
        let guard = token.clone();
        let fut = task(token.clone());
        tokio::spawn(async move {
            tokio::select! {
                _ = guard.cancelled() => {}
                _ = fut => {}
            }
        });
        TaskHandle { token }
    }

    /// Cancel every task spawned by this scheduler, including future ones.
    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.root.is_cancelled()
    }
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Let the task run to completion even if the handle is dropped.
    pub fn detach(self) {
        std::mem::forget(self);
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Convenience for `Duration::from_millis`
pub fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}
