//! Configuration loading.
//!
//! All knobs live in one TOML file: cache TTLs and capacity, the golden
//! snapshot directory, one `[providers.<name>]` table per upstream
//! (rate budget + breaker thresholds + timeout), and one
//! `[datasets.<id>]` table per scheduled dataset (tier + refresh
//! cadence). Every field has a default, so an empty file is a valid
//! configuration.
//!
//! ```toml
//! [cache]
//! realtime_ttl_secs = 60
//! golden_dir = "/var/lib/munin/golden"
//!
//! [providers.coingecko]
//! rate_capacity = 30
//! refill_interval_secs = 60
//! min_spacing_ms = 500
//! failure_threshold = 5
//! recovery_timeout_secs = 60
//!
//! [providers.fred]
//! rate_capacity = 5
//! failure_threshold = 2
//! recovery_timeout_secs = 600
//!
//! [datasets.btc-history]
//! tier = "stable"
//! refresh_period_secs = 3600
//! jitter_secs = 180
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::breaker::BreakerConfig;
use crate::limiter::RateBudget;
use crate::store::{CacheTier, TierTtls};
use crate::{MuninError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub providers: HashMap<String, ProviderSection>,
    #[serde(default)]
    pub datasets: HashMap<String, DatasetSection>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            MuninError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        toml::from_str(&text)
            .map_err(|e| MuninError::Configuration(format!("cannot parse {}: {e}", path.display())))
    }
}

/// Cache layer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    /// Realtime tier TTL in seconds (default: 60).
    #[serde(default = "default_realtime_ttl")]
    pub realtime_ttl_secs: u64,
    /// Frequent tier TTL in seconds (default: 300).
    #[serde(default = "default_frequent_ttl")]
    pub frequent_ttl_secs: u64,
    /// Stable tier TTL in seconds (default: 3600).
    #[serde(default = "default_stable_ttl")]
    pub stable_ttl_secs: u64,
    /// Maximum entries per cache layer (default: 10,000).
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
    /// Directory for golden snapshots. Unset = memory-only golden layer.
    #[serde(default)]
    pub golden_dir: Option<PathBuf>,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            realtime_ttl_secs: default_realtime_ttl(),
            frequent_ttl_secs: default_frequent_ttl(),
            stable_ttl_secs: default_stable_ttl(),
            max_entries: default_max_entries(),
            golden_dir: None,
        }
    }
}

impl CacheSection {
    /// Convert to store TTLs.
    pub fn ttls(&self) -> TierTtls {
        TierTtls::new()
            .realtime(Duration::from_secs(self.realtime_ttl_secs))
            .frequent(Duration::from_secs(self.frequent_ttl_secs))
            .stable(Duration::from_secs(self.stable_ttl_secs))
    }
}

fn default_realtime_ttl() -> u64 {
    60
}

fn default_frequent_ttl() -> u64 {
    300
}

fn default_stable_ttl() -> u64 {
    3600
}

fn default_max_entries() -> u64 {
    10_000
}

/// One upstream provider's budget and thresholds.
///
/// Defaults suit a generous provider; strict ones override with lower
/// thresholds and longer recovery windows.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSection {
    /// Requests allowed per refill window (default: 10).
    #[serde(default = "default_rate_capacity")]
    pub rate_capacity: u32,
    /// Refill window in seconds (default: 60).
    #[serde(default = "default_refill_interval")]
    pub refill_interval_secs: u64,
    /// Minimum gap between dispatches in milliseconds (default: 250).
    #[serde(default = "default_min_spacing")]
    pub min_spacing_ms: u64,
    /// Adaptive backoff base delay in milliseconds (default: 500).
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    /// Consecutive failures before the circuit opens (default: 5).
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Open-circuit recovery timeout in seconds (default: 60).
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: u64,
    /// Probe calls admitted while half-open (default: 1).
    #[serde(default = "default_half_open_retries")]
    pub half_open_retries: u32,
    /// Hard upstream timeout in seconds (default: 10).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            rate_capacity: default_rate_capacity(),
            refill_interval_secs: default_refill_interval(),
            min_spacing_ms: default_min_spacing(),
            backoff_base_ms: default_backoff_base(),
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout(),
            half_open_retries: default_half_open_retries(),
            timeout_secs: default_timeout(),
        }
    }
}

impl ProviderSection {
    /// Convert to a rate budget.
    pub fn rate_budget(&self) -> RateBudget {
        RateBudget::new()
            .capacity(self.rate_capacity)
            .refill_interval(Duration::from_secs(self.refill_interval_secs))
            .min_spacing(Duration::from_millis(self.min_spacing_ms))
            .backoff_base(Duration::from_millis(self.backoff_base_ms))
    }

    /// Convert to a breaker config.
    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig::new()
            .failure_threshold(self.failure_threshold)
            .recovery_timeout(Duration::from_secs(self.recovery_timeout_secs))
            .half_open_retries(self.half_open_retries)
    }

    /// Hard upstream timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_rate_capacity() -> u32 {
    10
}

fn default_refill_interval() -> u64 {
    60
}

fn default_min_spacing() -> u64 {
    250
}

fn default_backoff_base() -> u64 {
    500
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> u64 {
    60
}

fn default_half_open_retries() -> u32 {
    1
}

fn default_timeout() -> u64 {
    10
}

/// One dataset's cache tier and refresh cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetSection {
    /// Cache tier (default: frequent).
    #[serde(default = "default_tier")]
    pub tier: CacheTier,
    /// Nominal refresh period in seconds (default: 3600).
    #[serde(default = "default_refresh_period")]
    pub refresh_period_secs: u64,
    /// Jitter window in seconds, sampled per run (default: 180).
    #[serde(default = "default_jitter")]
    pub jitter_secs: u64,
}

impl Default for DatasetSection {
    fn default() -> Self {
        Self {
            tier: default_tier(),
            refresh_period_secs: default_refresh_period(),
            jitter_secs: default_jitter(),
        }
    }
}

impl DatasetSection {
    /// Nominal refresh period.
    pub fn refresh_period(&self) -> Duration {
        Duration::from_secs(self.refresh_period_secs)
    }

    /// Jitter window.
    pub fn jitter(&self) -> Duration {
        Duration::from_secs(self.jitter_secs)
    }
}

fn default_tier() -> CacheTier {
    CacheTier::Frequent
}

fn default_refresh_period() -> u64 {
    3600
}

fn default_jitter() -> u64 {
    180
}
