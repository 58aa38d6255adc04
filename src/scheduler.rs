//! Background refresh scheduling.
//!
//! Runs N independently-scheduled refresh tasks so that foreground
//! fetches are cache hits in the common case. Each task gets its own
//! tokio task: a slow or failing dataset never delays another. Each run
//! waits its nominal period plus a fresh uniform jitter sample, so
//! refreshes neither synchronise into bursts against upstreams nor
//! produce a predictable load pattern.
//!
//! Task bodies are expected to call
//! [`Munin::fetch_or_fallback`](crate::Munin::fetch_or_fallback) (or any
//! fetch-and-cache path) for their dataset. Errors are logged and
//! swallowed — a failed refresh leaves the existing entry to expire and
//! be served stale until the next attempt.
//!
//! Shutdown is cooperative: [`RefreshScheduler::shutdown`] signals the
//! group and waits; a body already running completes rather than being
//! aborted, so an already-dispatched provider call is not wasted.

use std::time::Duration;

use futures_util::future::BoxFuture;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::telemetry;

type TaskBody = Box<dyn Fn() -> BoxFuture<'static, crate::Result<()>> + Send + Sync>;

/// One periodic refresh job.
pub struct RefreshTask {
    name: String,
    period: Duration,
    jitter: Duration,
    immediate: bool,
    body: TaskBody,
}

impl RefreshTask {
    /// Create a task that runs `body` every `period` (plus jitter).
    pub fn new<F, Fut>(name: impl Into<String>, period: Duration, body: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = crate::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            period,
            jitter: Duration::ZERO,
            immediate: false,
            body: Box::new(move || Box::pin(body())),
        }
    }

    /// Set the jitter window; a fresh sample in `[0, jitter]` is added
    /// to every run's delay.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Also run once right after spawn (cache warming at startup).
    pub fn immediately(mut self) -> Self {
        self.immediate = true;
        self
    }

    async fn run_once(&self) {
        debug!(task = %self.name, "refresh run");
        match (self.body)().await {
            Ok(()) => {
                metrics::counter!(
                    telemetry::REFRESH_RUNS_TOTAL,
                    "task" => self.name.clone(),
                    "status" => "ok",
                )
                .increment(1);
            }
            Err(e) => {
                warn!(task = %self.name, error = %e, "scheduled refresh failed");
                metrics::counter!(
                    telemetry::REFRESH_RUNS_TOTAL,
                    "task" => self.name.clone(),
                    "status" => "error",
                )
                .increment(1);
            }
        }
    }
}

/// Driver for a set of refresh tasks.
pub struct RefreshScheduler {
    tasks: Vec<RefreshTask>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl RefreshScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            tasks: Vec::new(),
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// Add a task (takes effect at the next [`Self::spawn`]).
    pub fn task(mut self, task: RefreshTask) -> Self {
        self.tasks.push(task);
        self
    }

    /// Spawn every pending task onto the runtime.
    ///
    /// # Panics
    ///
    /// Requires a tokio runtime context.
    pub fn spawn(&mut self) {
        for task in self.tasks.drain(..) {
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            self.handles.push(tokio::spawn(async move {
                if task.immediate {
                    task.run_once().await;
                }
                loop {
                    let delay = task.period + jitter_sample(task.jitter);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => task.run_once().await,
                        _ = shutdown_rx.changed() => break,
                    }
                }
                debug!(task = %task.name, "refresh task stopped");
            }));
        }
    }

    /// Number of running tasks.
    pub fn running(&self) -> usize {
        self.handles.len()
    }

    /// Stop the group and wait for every task to wind down. Bodies
    /// already running complete first.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

impl Default for RefreshScheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn jitter_sample(window: Duration) -> Duration {
    if window.is_zero() {
        return Duration::ZERO;
    }
    let ms = rand::thread_rng().gen_range(0..=window.as_millis() as u64);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_sample_stays_in_window() {
        let window = Duration::from_secs(180);
        for _ in 0..100 {
            assert!(jitter_sample(window) <= window);
        }
        assert_eq!(jitter_sample(Duration::ZERO), Duration::ZERO);
    }
}
