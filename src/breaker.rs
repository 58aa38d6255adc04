//! Per-provider circuit breaker.
//!
//! Tracks failure streaks per upstream provider and stops calling a
//! provider that keeps failing, so the orchestrator can go straight to
//! its fallback chain instead of burning rate budget on a dead upstream.
//!
//! Three states:
//!
//! - **Closed** — calls pass through; `failure_threshold` consecutive
//!   failures open the circuit.
//! - **Open** — calls are short-circuited with [`MuninError::CircuitOpen`];
//!   after `recovery_timeout` the next admitted call flips to half-open.
//! - **HalfOpen** — at most `half_open_retries` probe calls are admitted.
//!   One success closes the circuit and zeroes the failure count; one
//!   failure reopens it and restarts the recovery timer.
//!
//! Thresholds are asymmetric by design: a provider with a strict quota
//! gets a low threshold and a long recovery window (e.g. 2 failures /
//! 10min), a generous one the opposite (5 failures / 1min). That lives in
//! per-provider configuration, not here.
//!
//! What counts as a failure is decided by the caller via
//! [`MuninError::is_upstream_failure`] — network errors, timeouts,
//! non-2xx statuses, and invalid/empty payloads all count.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::telemetry;
use crate::{MuninError, Result};

/// Configuration for one provider's circuit breaker.
///
/// ```rust
/// # use munin::BreakerConfig;
/// # use std::time::Duration;
/// let strict = BreakerConfig::new()
///     .failure_threshold(2)
///     .recovery_timeout(Duration::from_secs(600));
/// ```
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens. Default: 5.
    pub failure_threshold: u32,
    /// How long an open circuit waits before admitting a probe. Default: 60s.
    pub recovery_timeout: Duration,
    /// Probe calls admitted while half-open. Default: 1.
    pub half_open_retries: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_retries: 1,
        }
    }
}

impl BreakerConfig {
    /// Create a config with the defaults above.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the consecutive-failure threshold.
    pub fn failure_threshold(mut self, n: u32) -> Self {
        self.failure_threshold = n;
        self
    }

    /// Set the open-state recovery timeout.
    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Set the number of half-open probe calls.
    pub fn half_open_retries(mut self, n: u32) -> Self {
        self.half_open_retries = n;
        self
    }
}

/// Observable state of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Stable label for metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    half_open_budget: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    last_success_at: Option<Instant>,
}

/// Circuit breaker for one upstream provider.
///
/// Created once per provider at startup and shared; all methods take
/// `&self` and are safe to call from any task.
pub struct CircuitBreaker {
    provider: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a closed breaker for `provider`.
    pub fn new(provider: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            provider: provider.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                half_open_budget: 0,
                opened_at: None,
                last_failure_at: None,
                last_success_at: None,
            }),
        }
    }

    /// Ask to place a call.
    ///
    /// `Ok(())` admits the call; [`MuninError::CircuitOpen`] means the
    /// caller must go straight to its fallback path. An open circuit past
    /// its recovery timeout flips to half-open and admits the call as a
    /// probe.
    pub fn admit(&self) -> Result<()> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let recovered = inner
                    .opened_at
                    .is_some_and(|t| t.elapsed() >= self.config.recovery_timeout);
                if recovered {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.half_open_budget = self.config.half_open_retries;
                }
                self.take_probe_slot(&mut inner)
            }
            CircuitState::HalfOpen => self.take_probe_slot(&mut inner),
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.last_success_at = Some(Instant::now());
        inner.failure_count = 0;
        if inner.state == CircuitState::HalfOpen {
            info!(provider = %self.provider, "probe succeeded, closing circuit");
            self.transition(&mut inner, CircuitState::Closed);
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.last_failure_at = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                debug!(
                    provider = %self.provider,
                    failures = inner.failure_count,
                    threshold = self.config.failure_threshold,
                    "upstream failure"
                );
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        provider = %self.provider,
                        failures = inner.failure_count,
                        "failure threshold reached, opening circuit"
                    );
                    self.transition(&mut inner, CircuitState::Open);
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!(provider = %self.provider, "probe failed, reopening circuit");
                self.transition(&mut inner, CircuitState::Open);
                inner.opened_at = Some(Instant::now());
            }
            // A call admitted earlier may complete after the circuit
            // opened; the recovery timer is not restarted for it.
            CircuitState::Open => {}
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Consecutive failures observed while closed.
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Instant of the most recent failure.
    pub fn last_failure_at(&self) -> Option<Instant> {
        self.lock().last_failure_at
    }

    /// Instant of the most recent success.
    pub fn last_success_at(&self) -> Option<Instant> {
        self.lock().last_success_at
    }

    /// Provider this breaker guards.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    fn take_probe_slot(&self, inner: &mut Inner) -> Result<()> {
        if inner.state == CircuitState::HalfOpen && inner.half_open_budget > 0 {
            inner.half_open_budget -= 1;
            return Ok(());
        }
        metrics::counter!(
            telemetry::BREAKER_SHORT_CIRCUITS_TOTAL,
            "provider" => self.provider.clone(),
        )
        .increment(1);
        Err(MuninError::CircuitOpen {
            provider: self.provider.clone(),
        })
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        inner.state = to;
        metrics::counter!(
            telemetry::BREAKER_TRANSITIONS_TOTAL,
            "provider" => self.provider.clone(),
            "state" => to.as_str(),
        )
        .increment(1);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("breaker lock poisoned")
    }
}
