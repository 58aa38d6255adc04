//! Fetch orchestration.
//!
//! [`Munin`] is the context object everything hangs off: the tiered
//! store, one circuit breaker and one rate limiter per provider, the
//! single-flight map, and the per-dataset synthetic generators. It is
//! built once at startup via [`MuninBuilder`] (or
//! [`Munin::from_config`]) and injected wherever fetches happen — there
//! are no process-wide singletons, so tests instantiate isolated
//! instances freely.
//!
//! # The fetch path
//!
//! [`Munin::fetch_or_fallback`] is the one road to upstream data:
//!
//! 1. a fresh cache hit returns immediately, with no suspension;
//! 2. concurrent misses for the same key coalesce onto a single
//!    upstream call ([`flight`] module);
//! 3. the leader goes breaker → limiter → `fetch` under the provider's
//!    hard timeout;
//! 4. success writes through cache, stale copy, and golden snapshot;
//! 5. failure degrades: stale copy → golden snapshot → synthetic
//!    generator → [`MuninError::FallbackExhausted`], the only
//!    upstream-related error a caller ever sees.
//!
//! Callers get the [`Source`] and age alongside the value so staleness
//! can be surfaced to end users.

mod flight;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::limiter::{RateBudget, RateLimiter};
use crate::store::{CacheTier, FileSnapshotStore, GoldenStore, TierTtls, TieredStore};
use crate::telemetry;
use crate::{MuninError, Result};
use flight::{Flight, FlightMap, FlightResult};

/// Default per-provider upstream timeout.
const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

/// Default maximum entries per cache layer.
const DEFAULT_MAX_ENTRIES: u64 = 10_000;

/// Where a fetched value came from, strongest to weakest.
///
/// Consumers are expected to show this (and the age) so end users can
/// tell live data from degraded data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Unexpired cache entry.
    Cache,
    /// Fetched from the upstream provider just now.
    Fresh,
    /// Expired per-key last-known-good copy.
    Fallback,
    /// Golden dataset snapshot.
    Golden,
    /// Generated data; nothing real was available.
    Synthetic,
}

impl Source {
    /// Stable label for metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Cache => "cache",
            Source::Fresh => "fresh",
            Source::Fallback => "fallback",
            Source::Golden => "golden",
            Source::Synthetic => "synthetic",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fetched value with its provenance and age.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub value: Value,
    pub source: Source,
    pub age: Duration,
}

/// Per-call options for [`Munin::fetch_or_fallback`].
///
/// ```rust
/// # use munin::{CacheTier, FetchOptions};
/// let opts = FetchOptions::new()
///     .tier(CacheTier::Stable)
///     .dataset("btc-history");
/// ```
#[derive(Clone)]
pub struct FetchOptions {
    tier: CacheTier,
    dataset_id: Option<String>,
    validate: Option<Arc<dyn Fn(&Value) -> bool + Send + Sync>>,
}

impl FetchOptions {
    /// Options with the frequent tier and no dataset.
    pub fn new() -> Self {
        Self {
            tier: CacheTier::Frequent,
            dataset_id: None,
            validate: None,
        }
    }

    /// Set the cache tier for the fetched value.
    pub fn tier(mut self, tier: CacheTier) -> Self {
        self.tier = tier;
        self
    }

    /// Associate the key with a dataset, enabling the golden snapshot
    /// and synthetic layers for it.
    pub fn dataset(mut self, dataset_id: impl Into<String>) -> Self {
        self.dataset_id = Some(dataset_id.into());
        self
    }

    /// Add a payload validator. A rejected payload counts as an upstream
    /// failure, exactly like a malformed one.
    pub fn validate(mut self, f: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        self.validate = Some(Arc::new(f));
        self
    }
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration spec for one upstream provider.
pub struct ProviderSpec {
    name: String,
    budget: RateBudget,
    breaker: BreakerConfig,
    timeout: Duration,
}

impl ProviderSpec {
    /// Spec with default budget, breaker, and timeout.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            budget: RateBudget::default(),
            breaker: BreakerConfig::default(),
            timeout: DEFAULT_PROVIDER_TIMEOUT,
        }
    }

    /// Set the rate budget.
    pub fn rate_budget(mut self, budget: RateBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Set the circuit breaker config.
    pub fn breaker(mut self, config: BreakerConfig) -> Self {
        self.breaker = config;
        self
    }

    /// Set the hard upstream timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

struct ProviderHandle {
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    timeout: Duration,
}

type SyntheticFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// The acquisition context: store, breakers, limiters, in-flight map.
pub struct Munin {
    store: Arc<TieredStore>,
    providers: HashMap<String, ProviderHandle>,
    synthetic: HashMap<String, SyntheticFn>,
    flights: FlightMap,
}

impl Munin {
    /// Create a new builder.
    pub fn builder() -> MuninBuilder {
        MuninBuilder::new()
    }

    /// Build a context from loaded configuration.
    pub async fn from_config(config: &crate::Config) -> Result<Self> {
        let mut builder = Munin::builder()
            .ttls(config.cache.ttls())
            .max_entries(config.cache.max_entries);
        if let Some(dir) = &config.cache.golden_dir {
            builder = builder.golden_dir(dir);
        }
        for (name, section) in &config.providers {
            builder = builder.provider(
                ProviderSpec::new(name)
                    .rate_budget(section.rate_budget())
                    .breaker(section.breaker())
                    .timeout(section.timeout()),
            );
        }
        builder.build().await
    }

    /// Fetch a key through the cache-first, fallback-always path.
    ///
    /// `fetch` is only invoked on a cache miss when this caller wins the
    /// single-flight race; it runs under the provider's hard timeout.
    /// Upstream failures never surface — the weakest available tier is
    /// returned instead, and only [`MuninError::FallbackExhausted`]
    /// (every tier empty) or invalid arguments produce an error.
    ///
    /// A fresh cache hit resolves without suspending; a miss costs at
    /// most one upstream round trip plus rate-limiter queueing.
    #[instrument(skip(self, opts, fetch))]
    pub async fn fetch_or_fallback<F, Fut>(
        &self,
        key: &str,
        provider: &str,
        opts: FetchOptions,
        fetch: F,
    ) -> Result<Fetched>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        if key.is_empty() {
            return Err(MuninError::InvalidInput("cache key must not be empty".into()));
        }
        let handle = self
            .providers
            .get(provider)
            .ok_or_else(|| MuninError::UnknownProvider(provider.to_owned()))?;

        if let Some((value, age)) = self.store.get(key) {
            return Ok(Fetched {
                value,
                source: Source::Cache,
                age,
            });
        }

        match self.flights.begin(key) {
            Flight::Follower(rx) => {
                metrics::counter!(telemetry::COALESCED_FETCHES_TOTAL).increment(1);
                debug!(key, "joining in-flight fetch");
                flight::await_shared(rx, key).await
            }
            Flight::Leader(guard) => {
                let result = self.fetch_fresh(key, handle, &opts, fetch).await;
                let shared: FlightResult = match &result {
                    Ok(fetched) => Ok(fetched.clone()),
                    Err(_) => Err(()),
                };
                guard.finish(shared);
                result
            }
        }
    }

    /// Drop a key from the fresh and stale cache layers.
    pub fn invalidate(&self, key: &str) {
        self.store.remove(key);
    }

    /// The tiered store.
    pub fn store(&self) -> &TieredStore {
        &self.store
    }

    /// Circuit breaker for a provider, if registered.
    pub fn breaker(&self, provider: &str) -> Option<Arc<CircuitBreaker>> {
        self.providers.get(provider).map(|h| Arc::clone(&h.breaker))
    }

    /// Rate limiter for a provider, if registered.
    pub fn limiter(&self, provider: &str) -> Option<Arc<RateLimiter>> {
        self.providers.get(provider).map(|h| Arc::clone(&h.limiter))
    }

    /// Names of registered providers.
    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    async fn fetch_fresh<F, Fut>(
        &self,
        key: &str,
        handle: &ProviderHandle,
        opts: &FetchOptions,
        fetch: F,
    ) -> Result<Fetched>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let provider = handle.breaker.provider();

        // An open circuit skips the limiter queue entirely.
        if let Err(e) = handle.breaker.admit() {
            debug!(key, provider, "circuit open, skipping upstream");
            return self.degrade(key, opts, &e).await;
        }

        handle.limiter.acquire().await;

        let as_of = Instant::now();
        let outcome = match tokio::time::timeout(handle.timeout, fetch()).await {
            Ok(Ok(value)) => validate_payload(key, value, opts),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MuninError::Timeout(handle.timeout)),
        };
        metrics::histogram!(
            telemetry::REQUEST_DURATION_SECONDS,
            "provider" => provider.to_owned(),
        )
        .record(as_of.elapsed().as_secs_f64());

        match outcome {
            Ok(value) => {
                handle.breaker.record_success();
                handle.limiter.note_success();
                metrics::counter!(
                    telemetry::REQUESTS_TOTAL,
                    "provider" => provider.to_owned(),
                    "status" => "ok",
                )
                .increment(1);

                self.store.insert_at(key, value.clone(), opts.tier, as_of);
                if let Some(dataset) = &opts.dataset_id
                    && let Err(e) = self.store.set_golden(dataset, value.clone()).await
                {
                    warn!(dataset = %dataset, error = %e, "failed to persist golden snapshot");
                }
                Ok(Fetched {
                    value,
                    source: Source::Fresh,
                    age: Duration::ZERO,
                })
            }
            Err(e) => {
                if e.is_rate_limit() {
                    handle.limiter.note_rate_limited(e.retry_after());
                }
                if e.is_upstream_failure() {
                    handle.breaker.record_failure();
                }
                metrics::counter!(
                    telemetry::REQUESTS_TOTAL,
                    "provider" => provider.to_owned(),
                    "status" => "error",
                )
                .increment(1);
                warn!(key, provider, error = %e, "upstream fetch failed");
                self.degrade(key, opts, &e).await
            }
        }
    }

    /// Walk the degraded tiers: stale copy → golden → synthetic.
    async fn degrade(&self, key: &str, opts: &FetchOptions, cause: &MuninError) -> Result<Fetched> {
        if let Some((value, age)) = self.store.get_stale(key) {
            metrics::counter!(telemetry::FALLBACKS_TOTAL, "source" => Source::Fallback.as_str())
                .increment(1);
            debug!(key, age_secs = age.as_secs(), "serving last-known-good copy");
            return Ok(Fetched {
                value,
                source: Source::Fallback,
                age,
            });
        }

        if let Some(dataset) = &opts.dataset_id {
            if let Some((value, age)) = self.store.get_golden(dataset).await {
                metrics::counter!(telemetry::FALLBACKS_TOTAL, "source" => Source::Golden.as_str())
                    .increment(1);
                debug!(key, dataset = %dataset, age_secs = age.as_secs(), "serving golden snapshot");
                return Ok(Fetched {
                    value,
                    source: Source::Golden,
                    age,
                });
            }
            if let Some(generate) = self.synthetic.get(dataset) {
                metrics::counter!(
                    telemetry::FALLBACKS_TOTAL,
                    "source" => Source::Synthetic.as_str(),
                )
                .increment(1);
                warn!(key, dataset = %dataset, "serving synthetic data");
                return Ok(Fetched {
                    value: generate(),
                    source: Source::Synthetic,
                    age: Duration::ZERO,
                });
            }
        }

        warn!(key, cause = %cause, "fallback exhausted");
        Err(MuninError::FallbackExhausted {
            key: key.to_owned(),
        })
    }
}

/// Null and empty payloads are failures; so is anything the caller's
/// validator rejects.
fn validate_payload(key: &str, value: Value, opts: &FetchOptions) -> Result<Value> {
    let empty = match &value {
        Value::Null => true,
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    };
    if empty {
        return Err(MuninError::EmptyResponse);
    }
    if let Some(validate) = &opts.validate
        && !validate(&value)
    {
        return Err(MuninError::InvalidPayload(format!(
            "validator rejected payload for '{key}'"
        )));
    }
    Ok(value)
}

/// Builder for [`Munin`] instances.
pub struct MuninBuilder {
    ttls: TierTtls,
    max_entries: u64,
    golden_dir: Option<PathBuf>,
    providers: Vec<ProviderSpec>,
    synthetic: HashMap<String, SyntheticFn>,
}

impl MuninBuilder {
    pub fn new() -> Self {
        Self {
            ttls: TierTtls::default(),
            max_entries: DEFAULT_MAX_ENTRIES,
            golden_dir: None,
            providers: Vec::new(),
            synthetic: HashMap::new(),
        }
    }

    /// Set the per-tier TTLs.
    pub fn ttls(mut self, ttls: TierTtls) -> Self {
        self.ttls = ttls;
        self
    }

    /// Set the max entries per cache layer.
    pub fn max_entries(mut self, max: u64) -> Self {
        self.max_entries = max;
        self
    }

    /// Persist golden snapshots under `dir`. Without this the golden
    /// layer is memory-only.
    pub fn golden_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.golden_dir = Some(dir.into());
        self
    }

    /// Register an upstream provider.
    pub fn provider(mut self, spec: ProviderSpec) -> Self {
        self.providers.push(spec);
        self
    }

    /// Register a synthetic generator as a dataset's last resort.
    pub fn synthetic(
        mut self,
        dataset_id: impl Into<String>,
        generate: impl Fn() -> Value + Send + Sync + 'static,
    ) -> Self {
        self.synthetic.insert(dataset_id.into(), Arc::new(generate));
        self
    }

    /// Build the context, loading persisted golden snapshots if a
    /// directory was configured.
    pub async fn build(self) -> Result<Munin> {
        if self.providers.is_empty() {
            return Err(MuninError::Configuration("no providers registered".into()));
        }

        let mut providers = HashMap::new();
        for spec in self.providers {
            if spec.budget.capacity == 0 {
                return Err(MuninError::Configuration(format!(
                    "provider '{}': rate capacity must be positive",
                    spec.name
                )));
            }
            if spec.budget.refill_interval.is_zero() {
                return Err(MuninError::Configuration(format!(
                    "provider '{}': refill interval must be positive",
                    spec.name
                )));
            }
            if spec.breaker.failure_threshold == 0 {
                return Err(MuninError::Configuration(format!(
                    "provider '{}': failure threshold must be positive",
                    spec.name
                )));
            }
            let handle = ProviderHandle {
                breaker: Arc::new(CircuitBreaker::new(spec.name.clone(), spec.breaker)),
                limiter: Arc::new(RateLimiter::new(spec.name.clone(), spec.budget)),
                timeout: spec.timeout,
            };
            if providers.insert(spec.name.clone(), handle).is_some() {
                return Err(MuninError::Configuration(format!(
                    "provider '{}' registered twice",
                    spec.name
                )));
            }
        }

        let golden = match self.golden_dir {
            Some(dir) => GoldenStore::open(Arc::new(FileSnapshotStore::new(dir))).await?,
            None => GoldenStore::in_memory(),
        };
        let store = TieredStore::with_max_entries(self.ttls, self.max_entries).with_golden(golden);

        Ok(Munin {
            store: Arc::new(store),
            providers,
            synthetic: self.synthetic,
            flights: FlightMap::new(),
        })
    }
}

impl Default for MuninBuilder {
    fn default() -> Self {
        Self::new()
    }
}
