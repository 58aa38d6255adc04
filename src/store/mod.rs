//! Tiered cache store.
//!
//! Three freshness tiers plus two degraded layers:
//!
//! - **Fresh entries** — a bounded [`moka`] map of [`CacheEntry`] values,
//!   each stamped with its write time and tier. Freshness is checked at
//!   read time against the tier's TTL, so an expired entry simply stops
//!   being returned by [`TieredStore::get`].
//!
//! - **Stale copies** — every accepted write also refreshes a per-key
//!   last-known-good copy, served by [`TieredStore::get_stale`] when the
//!   fresh entry has expired or was evicted. This is what lets a miss
//!   degrade to "what we last saw for this key".
//!
//! - **Golden snapshots** — [`golden::GoldenStore`], a durable
//!   whole-dataset fallback of last resort with unbounded age. See the
//!   [`golden`] module docs.
//!
//! Writes are timestamp-guarded: each carries the `as_of` instant of the
//! fetch that produced it, and a write whose stamp is older than the
//! stored entry's is rejected. A slow fetch that completes after a
//! fresher one cannot clobber the newer data.

pub mod golden;

pub use golden::{FileSnapshotStore, GoldenSnapshot, GoldenStore, SnapshotBackend};

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::telemetry;

/// Default maximum number of fresh entries (the stale map is sized the same).
const DEFAULT_MAX_ENTRIES: u64 = 10_000;

/// Freshness class of a cache entry.
///
/// The tier decides how long an entry is served as fresh; the concrete
/// TTLs live in [`TierTtls`] configuration, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    /// Spot prices, order-book style data. Default TTL: 60s.
    Realtime,
    /// Funding rates, ETF flows. Default TTL: 5min.
    Frequent,
    /// Historical series, treasury yields. Default TTL: 1h.
    Stable,
}

impl CacheTier {
    /// Stable label for metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::Realtime => "realtime",
            CacheTier::Frequent => "frequent",
            CacheTier::Stable => "stable",
        }
    }
}

/// Per-tier time-to-live configuration.
///
/// ```rust
/// # use munin::TierTtls;
/// # use std::time::Duration;
/// let ttls = TierTtls::new()
///     .realtime(Duration::from_secs(30))
///     .stable(Duration::from_secs(6 * 3600));
/// ```
#[derive(Debug, Clone)]
pub struct TierTtls {
    /// TTL for [`CacheTier::Realtime`] entries. Default: 60s.
    pub realtime: Duration,
    /// TTL for [`CacheTier::Frequent`] entries. Default: 5min.
    pub frequent: Duration,
    /// TTL for [`CacheTier::Stable`] entries. Default: 1h.
    pub stable: Duration,
}

impl Default for TierTtls {
    fn default() -> Self {
        Self {
            realtime: Duration::from_secs(60),
            frequent: Duration::from_secs(300),
            stable: Duration::from_secs(3600),
        }
    }
}

impl TierTtls {
    /// Create TTLs with the defaults above.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the realtime-tier TTL.
    pub fn realtime(mut self, ttl: Duration) -> Self {
        self.realtime = ttl;
        self
    }

    /// Set the frequent-tier TTL.
    pub fn frequent(mut self, ttl: Duration) -> Self {
        self.frequent = ttl;
        self
    }

    /// Set the stable-tier TTL.
    pub fn stable(mut self, ttl: Duration) -> Self {
        self.stable = ttl;
        self
    }

    /// TTL for a given tier.
    pub fn ttl_for(&self, tier: CacheTier) -> Duration {
        match tier {
            CacheTier::Realtime => self.realtime,
            CacheTier::Frequent => self.frequent,
            CacheTier::Stable => self.stable,
        }
    }
}

/// A stored value with its tier and write stamp.
#[derive(Clone)]
struct CacheEntry {
    value: Value,
    tier: CacheTier,
    written_at: Instant,
}

/// Thread-safe tiered store: fresh entries, per-key stale copies, and the
/// golden dataset layer.
///
/// Reads never suspend; golden access is async because the snapshot map
/// is shared with the persistence path.
pub struct TieredStore {
    entries: moka::sync::Cache<String, CacheEntry>,
    stale: moka::sync::Cache<String, CacheEntry>,
    golden: GoldenStore,
    ttls: TierTtls,
    // Serialises the stamp-guard check against the insert that follows it.
    write_lock: std::sync::Mutex<()>,
}

impl TieredStore {
    /// Create a store with the given TTLs, default capacity, and an
    /// in-memory (non-durable) golden layer.
    pub fn new(ttls: TierTtls) -> Self {
        Self::with_max_entries(ttls, DEFAULT_MAX_ENTRIES)
    }

    /// Create a store with a custom max capacity per layer.
    pub fn with_max_entries(ttls: TierTtls, max: u64) -> Self {
        Self {
            entries: moka::sync::Cache::new(max),
            stale: moka::sync::Cache::new(max),
            golden: GoldenStore::in_memory(),
            ttls,
            write_lock: std::sync::Mutex::new(()),
        }
    }

    /// Replace the golden layer (e.g. with a file-backed one).
    pub fn with_golden(mut self, golden: GoldenStore) -> Self {
        self.golden = golden;
        self
    }

    /// Look up a fresh entry.
    ///
    /// Returns the value and its age, or `None` on miss or expiry —
    /// never an error. Expired entries are left for [`Self::get_stale`].
    pub fn get(&self, key: &str) -> Option<(Value, Duration)> {
        match self.entries.get(key) {
            Some(entry) => {
                let age = entry.written_at.elapsed();
                if age <= self.ttls.ttl_for(entry.tier) {
                    metrics::counter!(telemetry::CACHE_HITS_TOTAL, "tier" => entry.tier.as_str())
                        .increment(1);
                    Some((entry.value, age))
                } else {
                    debug!(key, tier = entry.tier.as_str(), age_secs = age.as_secs(), "entry expired");
                    metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
                    None
                }
            }
            None => {
                metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
                None
            }
        }
    }

    /// Look up the per-key last-known-good copy, regardless of expiry.
    pub fn get_stale(&self, key: &str) -> Option<(Value, Duration)> {
        self.stale
            .get(key)
            .map(|entry| (entry.value, entry.written_at.elapsed()))
    }

    /// Insert a value stamped now.
    pub fn insert(&self, key: &str, value: Value, tier: CacheTier) -> bool {
        self.insert_at(key, value, tier, Instant::now())
    }

    /// Insert a value stamped with the instant its fetch was dispatched.
    ///
    /// Returns `false` (and writes nothing) when the stored entry carries
    /// a newer stamp — the slow-fetch-overwrites-fresh-data guard.
    pub fn insert_at(&self, key: &str, value: Value, tier: CacheTier, as_of: Instant) -> bool {
        let _guard = self.write_lock.lock().expect("store write lock poisoned");
        if let Some(existing) = self.entries.get(key)
            && existing.written_at > as_of
        {
            debug!(key, "rejected write with older stamp than stored entry");
            return false;
        }
        let entry = CacheEntry {
            value,
            tier,
            written_at: as_of,
        };
        self.entries.insert(key.to_owned(), entry.clone());
        self.stale.insert(key.to_owned(), entry);
        true
    }

    /// Drop a key from the fresh and stale layers.
    pub fn remove(&self, key: &str) {
        self.entries.invalidate(key);
        self.stale.invalidate(key);
    }

    /// Look up a golden snapshot.
    pub async fn get_golden(&self, dataset_id: &str) -> Option<(Value, Duration)> {
        self.golden.get(dataset_id).await
    }

    /// Capture a golden snapshot for a dataset.
    pub async fn set_golden(&self, dataset_id: &str, payload: Value) -> crate::Result<()> {
        self.golden.set(dataset_id, payload).await
    }

    /// Delete a golden snapshot (explicit admin action only).
    pub async fn remove_golden(&self, dataset_id: &str) -> crate::Result<()> {
        self.golden.remove(dataset_id).await
    }

    /// Access the golden layer directly.
    pub fn golden(&self) -> &GoldenStore {
        &self.golden
    }

    /// TTL configuration in effect.
    pub fn ttls(&self) -> &TierTtls {
        &self.ttls
    }
}
