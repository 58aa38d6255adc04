//! Telemetry metric name constants.
//!
//! Centralised metric names for munin operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `munin_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `provider` — upstream provider name (e.g. "coingecko", "fred")
//! - `tier` — cache tier ("realtime" | "frequent" | "stable")
//! - `source` — where a value came from ("cache", "fresh", "fallback", ...)
//! - `status` — outcome: "ok" or "error"
//! - `task` — scheduler task name

/// Total upstream requests dispatched through the orchestrator.
///
/// Labels: `provider`, `status` ("ok" | "error").
pub const REQUESTS_TOTAL: &str = "munin_requests_total";

/// Upstream request duration in seconds.
///
/// Labels: `provider`.
pub const REQUEST_DURATION_SECONDS: &str = "munin_request_duration_seconds";

/// Total fresh-tier cache hits.
///
/// Labels: `tier`.
pub const CACHE_HITS_TOTAL: &str = "munin_cache_hits_total";

/// Total fresh-tier cache misses (includes expired entries).
pub const CACHE_MISSES_TOTAL: &str = "munin_cache_misses_total";

/// Total callers coalesced onto another caller's in-flight fetch.
pub const COALESCED_FETCHES_TOTAL: &str = "munin_coalesced_fetches_total";

/// Total responses served from a degraded tier.
///
/// Labels: `source` ("fallback" | "golden" | "synthetic").
pub const FALLBACKS_TOTAL: &str = "munin_fallbacks_total";

/// Total circuit breaker state transitions.
///
/// Labels: `provider`, `state` ("open" | "half_open" | "closed").
pub const BREAKER_TRANSITIONS_TOTAL: &str = "munin_breaker_transitions_total";

/// Total calls short-circuited by an open breaker.
///
/// Labels: `provider`.
pub const BREAKER_SHORT_CIRCUITS_TOTAL: &str = "munin_breaker_short_circuits_total";

/// Time spent waiting for a rate limiter dispatch slot, in seconds.
///
/// Labels: `provider`.
pub const LIMITER_WAIT_SECONDS: &str = "munin_limiter_wait_seconds";

/// Total adaptive-backoff activations from upstream rate-limit signals.
///
/// Labels: `provider`.
pub const LIMITER_BACKOFFS_TOTAL: &str = "munin_limiter_backoffs_total";

/// Total scheduled refresh runs.
///
/// Labels: `task`, `status` ("ok" | "error").
pub const REFRESH_RUNS_TOTAL: &str = "munin_refresh_runs_total";
