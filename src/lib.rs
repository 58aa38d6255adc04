//! Munin - resilient market-data acquisition and caching layer
//!
//! This crate shields dashboard consumers from upstream market-data
//! providers that rate-limit aggressively, fail intermittently, and
//! respond too slowly for a sub-second render budget. Every read goes
//! through a cache-first path that degrades gracefully — live data,
//! then cached, then a last-known-good copy, then a durable "golden"
//! snapshot, then synthetic data — and the caller is always told which
//! tier it got.
//!
//! The pieces: a tiered cache store with per-tier TTLs, a circuit
//! breaker and an adaptive rate limiter per provider, a single-flight
//! fetch orchestrator, and a jittered background scheduler that keeps
//! the cache warm so foreground fetches rarely touch an upstream at all.
//!
//! # Fetch Example
//!
//! ```rust,no_run
//! use munin::{CacheTier, FetchOptions, Munin, ProviderSpec, RateBudget, UpstreamClient};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> munin::Result<()> {
//!     let munin = Munin::builder()
//!         .provider(
//!             ProviderSpec::new("coingecko")
//!                 .rate_budget(RateBudget::new().capacity(30).min_spacing(Duration::from_millis(500)))
//!                 .timeout(Duration::from_secs(10)),
//!         )
//!         .golden_dir("/var/lib/munin/golden")
//!         .build()
//!         .await?;
//!
//!     let client = UpstreamClient::new();
//!     let fetched = munin
//!         .fetch_or_fallback(
//!             "btc:price",
//!             "coingecko",
//!             FetchOptions::new().tier(CacheTier::Realtime),
//!             || async move {
//!                 client
//!                     .get_json("https://api.coingecko.com/api/v3/simple/price?ids=bitcoin&vs_currencies=usd")
//!                     .await
//!             },
//!         )
//!         .await?;
//!
//!     println!("{} (source: {}, {}s old)", fetched.value, fetched.source, fetched.age.as_secs());
//!     Ok(())
//! }
//! ```
//!
//! # Background Refresh Example
//!
//! ```rust,no_run
//! use munin::{RefreshScheduler, RefreshTask};
//! use std::time::Duration;
//!
//! # async fn refresh_btc_history() -> munin::Result<()> { Ok(()) }
//! # async fn demo() {
//! let mut scheduler = RefreshScheduler::new()
//!     .task(
//!         RefreshTask::new("btc-history", Duration::from_secs(3600), || refresh_btc_history())
//!             .jitter(Duration::from_secs(180))
//!             .immediately(),
//!     );
//! scheduler.spawn();
//! # }
//! ```

pub mod breaker;
pub mod config;
pub mod error;
pub mod fetch;
#[cfg(feature = "http")]
pub mod http;
pub mod limiter;
pub mod scheduler;
pub mod store;
pub mod telemetry;

// Re-export main types at crate root
pub use error::{MuninError, Result};
pub use fetch::{FetchOptions, Fetched, Munin, MuninBuilder, ProviderSpec, Source};

#[cfg(feature = "http")]
pub use http::UpstreamClient;

// Re-export component types
pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use config::Config;
pub use limiter::{RateBudget, RateLimiter};
pub use scheduler::{RefreshScheduler, RefreshTask};
pub use store::{
    CacheTier, FileSnapshotStore, GoldenSnapshot, GoldenStore, SnapshotBackend, TierTtls,
    TieredStore,
};
