//! Per-provider rate limiter.
//!
//! Enforces a provider's request budget: a token bucket refilled on a
//! fixed interval, plus a minimum spacing between dispatches so bursts
//! are serialised even when tokens are available. Waiters are served in
//! arrival order — [`RateLimiter::acquire`] holds the gate across its
//! wait, and tokio's mutex queues waiters FIFO.
//!
//! A detected upstream rate-limit response (429-class) feeds adaptive
//! backoff: each signal grows an error streak, and the next dispatch is
//! pushed out by `backoff_base * 2^(streak-1)` (capped), or by the
//! upstream `Retry-After` hint when one was sent. This is independent of
//! the circuit breaker — the breaker decides *whether* to call at all,
//! the limiter decides *when*.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::telemetry;

/// Request budget for one upstream provider.
///
/// ```rust
/// # use munin::RateBudget;
/// # use std::time::Duration;
/// let budget = RateBudget::new()
///     .capacity(30)
///     .refill_interval(Duration::from_secs(60))
///     .min_spacing(Duration::from_millis(500));
/// ```
#[derive(Debug, Clone)]
pub struct RateBudget {
    /// Dispatches allowed per refill window. Default: 10.
    pub capacity: u32,
    /// Window length; tokens refill to `capacity` each window. Default: 60s.
    pub refill_interval: Duration,
    /// Minimum gap between consecutive dispatches. Default: 250ms.
    pub min_spacing: Duration,
    /// Base delay for adaptive backoff after a 429. Default: 500ms.
    pub backoff_base: Duration,
    /// Cap on the computed backoff delay. Default: 5min.
    pub backoff_cap: Duration,
}

impl Default for RateBudget {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_interval: Duration::from_secs(60),
            min_spacing: Duration::from_millis(250),
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(300),
        }
    }
}

impl RateBudget {
    /// Create a budget with the defaults above.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set dispatches allowed per window.
    pub fn capacity(mut self, n: u32) -> Self {
        self.capacity = n;
        self
    }

    /// Set the refill window length.
    pub fn refill_interval(mut self, interval: Duration) -> Self {
        self.refill_interval = interval;
        self
    }

    /// Set the minimum gap between dispatches.
    pub fn min_spacing(mut self, spacing: Duration) -> Self {
        self.min_spacing = spacing;
        self
    }

    /// Set the adaptive backoff base delay.
    pub fn backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Set the adaptive backoff cap.
    pub fn backoff_cap(mut self, cap: Duration) -> Self {
        self.backoff_cap = cap;
        self
    }

    /// Backoff delay for the nth consecutive rate-limit signal (1-indexed).
    ///
    /// Exponential: `backoff_base * 2^(streak-1)`, capped at `backoff_cap`.
    fn delay_for_streak(&self, streak: u32) -> Duration {
        let exp = streak.saturating_sub(1);
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.backoff_cap)
    }
}

// Token bucket state. Guarded by the async gate mutex, which acquire()
// holds across its sleeps — that is what makes the queue FIFO.
struct Gate {
    tokens: u32,
    window_started: Instant,
    last_dispatch: Option<Instant>,
}

// Adaptive backoff state. Kept outside the gate so a 429 observed while
// callers are queued takes effect before their next dispatch.
struct Backoff {
    until: Option<Instant>,
    streak: u32,
}

/// Rate limiter for one upstream provider.
pub struct RateLimiter {
    provider: String,
    budget: RateBudget,
    gate: tokio::sync::Mutex<Gate>,
    backoff: Mutex<Backoff>,
}

impl RateLimiter {
    /// Create a limiter with a full bucket.
    pub fn new(provider: impl Into<String>, budget: RateBudget) -> Self {
        Self {
            provider: provider.into(),
            gate: tokio::sync::Mutex::new(Gate {
                tokens: budget.capacity,
                window_started: Instant::now(),
                last_dispatch: None,
            }),
            backoff: Mutex::new(Backoff {
                until: None,
                streak: 0,
            }),
            budget,
        }
    }

    /// Wait for a dispatch slot.
    ///
    /// Suspends until a token is available, the minimum spacing since the
    /// previous dispatch has passed, and any active backoff has elapsed.
    /// Callers are released in arrival order.
    pub async fn acquire(&self) {
        let started = Instant::now();
        let mut gate = self.gate.lock().await;
        loop {
            let now = Instant::now();
            while now.duration_since(gate.window_started) >= self.budget.refill_interval {
                gate.window_started += self.budget.refill_interval;
                gate.tokens = self.budget.capacity;
            }

            let mut ready_at = now;
            if gate.tokens == 0 {
                ready_at = ready_at.max(gate.window_started + self.budget.refill_interval);
            }
            if let Some(last) = gate.last_dispatch {
                ready_at = ready_at.max(last + self.budget.min_spacing);
            }
            if let Some(until) = self.backoff_until() {
                ready_at = ready_at.max(until);
            }

            if ready_at <= now {
                gate.tokens -= 1;
                gate.last_dispatch = Some(now);
                break;
            }
            tokio::time::sleep_until(ready_at).await;
        }
        drop(gate);

        let waited = started.elapsed();
        if waited > Duration::ZERO {
            debug!(provider = %self.provider, waited_ms = waited.as_millis() as u64, "dispatch slot acquired");
        }
        metrics::histogram!(telemetry::LIMITER_WAIT_SECONDS, "provider" => self.provider.clone())
            .record(waited.as_secs_f64());
    }

    /// Record an upstream rate-limit signal (429-class).
    ///
    /// Grows the error streak and pushes the next dispatch out by the
    /// computed exponential delay, or by `retry_after` when the upstream
    /// sent one.
    pub fn note_rate_limited(&self, retry_after: Option<Duration>) {
        let mut backoff = self.backoff.lock().expect("backoff lock poisoned");
        backoff.streak += 1;
        let delay = retry_after.unwrap_or_else(|| self.budget.delay_for_streak(backoff.streak));
        let until = Instant::now() + delay;
        backoff.until = Some(backoff.until.map_or(until, |u| u.max(until)));
        warn!(
            provider = %self.provider,
            streak = backoff.streak,
            delay_ms = delay.as_millis() as u64,
            "upstream rate limit, backing off"
        );
        metrics::counter!(telemetry::LIMITER_BACKOFFS_TOTAL, "provider" => self.provider.clone())
            .increment(1);
    }

    /// Record a successful upstream call, clearing the error streak.
    pub fn note_success(&self) {
        let mut backoff = self.backoff.lock().expect("backoff lock poisoned");
        backoff.streak = 0;
    }

    /// Budget this limiter enforces.
    pub fn budget(&self) -> &RateBudget {
        &self.budget
    }

    /// Provider this limiter guards.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Current rolling rate-limit streak.
    pub fn error_streak(&self) -> u32 {
        self.backoff.lock().expect("backoff lock poisoned").streak
    }

    fn backoff_until(&self) -> Option<Instant> {
        self.backoff.lock().expect("backoff lock poisoned").until
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_doubles_and_caps() {
        let budget = RateBudget::new()
            .backoff_base(Duration::from_millis(500))
            .backoff_cap(Duration::from_secs(4));
        assert_eq!(budget.delay_for_streak(1), Duration::from_millis(500));
        assert_eq!(budget.delay_for_streak(2), Duration::from_secs(1));
        assert_eq!(budget.delay_for_streak(3), Duration::from_secs(2));
        assert_eq!(budget.delay_for_streak(4), Duration::from_secs(4));
        // Capped from here on.
        assert_eq!(budget.delay_for_streak(10), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn streak_resets_on_success() {
        let limiter = RateLimiter::new("coingecko", RateBudget::default());
        limiter.note_rate_limited(None);
        limiter.note_rate_limited(None);
        assert_eq!(limiter.error_streak(), 2);
        limiter.note_success();
        assert_eq!(limiter.error_streak(), 0);
    }
}
