use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::{Value, json};

use munin::{
    BreakerConfig, CacheTier, CircuitState, FetchOptions, Munin, MuninError, ProviderSpec,
    RateBudget, Source,
};

/// A provider spec that never throttles, so fetch-path tests control
/// their own timing.
fn fast_provider(name: &str) -> ProviderSpec {
    ProviderSpec::new(name)
        .rate_budget(
            RateBudget::new()
                .capacity(1_000)
                .min_spacing(Duration::ZERO),
        )
        .breaker(
            BreakerConfig::new()
                .failure_threshold(3)
                .recovery_timeout(Duration::from_secs(60)),
        )
        .timeout(Duration::from_secs(5))
}

async fn munin() -> Munin {
    Munin::builder()
        .provider(fast_provider("mock"))
        .build()
        .await
        .unwrap()
}

fn counting_fetch(
    calls: &Arc<AtomicU32>,
    result: munin::Result<Value>,
) -> impl FnOnce() -> std::pin::Pin<Box<dyn Future<Output = munin::Result<Value>> + Send>> {
    let calls = Arc::clone(calls);
    move || {
        calls.fetch_add(1, Ordering::Relaxed);
        Box::pin(async move { result })
    }
}

// ============================================================================
// Cache-first behaviour
// ============================================================================

#[tokio::test]
async fn first_call_is_fresh_second_is_cache() {
    let munin = munin().await;
    let calls = Arc::new(AtomicU32::new(0));

    let first = munin
        .fetch_or_fallback(
            "btc:price",
            "mock",
            FetchOptions::new().tier(CacheTier::Realtime),
            counting_fetch(&calls, Ok(json!(67421.5))),
        )
        .await
        .unwrap();
    assert_eq!(first.source, Source::Fresh);
    assert_eq!(first.value, json!(67421.5));
    assert_eq!(first.age, Duration::ZERO);

    let second = munin
        .fetch_or_fallback(
            "btc:price",
            "mock",
            FetchOptions::new().tier(CacheTier::Realtime),
            counting_fetch(&calls, Ok(json!(0.0))),
        )
        .await
        .unwrap();
    assert_eq!(second.source, Source::Cache);
    assert_eq!(second.value, json!(67421.5));
    assert!(second.age < Duration::from_secs(1));

    assert_eq!(calls.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn unexpired_entry_never_invokes_fetch() {
    let munin = munin().await;
    munin
        .store()
        .insert("btc:price", json!(1.0), CacheTier::Stable);

    let calls = Arc::new(AtomicU32::new(0));
    let fetched = munin
        .fetch_or_fallback(
            "btc:price",
            "mock",
            FetchOptions::new(),
            counting_fetch(&calls, Ok(json!(2.0))),
        )
        .await
        .unwrap();

    assert_eq!(fetched.source, Source::Cache);
    assert_eq!(calls.load(Ordering::Relaxed), 0);
}

// ============================================================================
// Single-flight
// ============================================================================

#[tokio::test(start_paused = true)]
async fn concurrent_misses_coalesce_onto_one_call() {
    let munin = munin().await;
    let calls = Arc::new(AtomicU32::new(0));

    let futures: Vec<_> = (0..5)
        .map(|_| {
            let calls = Arc::clone(&calls);
            munin.fetch_or_fallback("btc:price", "mock", FetchOptions::new(), move || async move {
                calls.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(json!(67421.5))
            })
        })
        .collect();

    let results = join_all(futures).await;

    assert_eq!(calls.load(Ordering::Relaxed), 1);
    for result in results {
        let fetched = result.unwrap();
        assert_eq!(fetched.value, json!(67421.5));
        assert_eq!(fetched.source, Source::Fresh);
    }
}

// ============================================================================
// Circuit breaking
// ============================================================================

#[tokio::test(start_paused = true)]
async fn breaker_opens_and_short_circuits_without_upstream_calls() {
    let munin = munin().await;
    let calls = Arc::new(AtomicU32::new(0));

    for _ in 0..3 {
        let result = munin
            .fetch_or_fallback(
                "btc:price",
                "mock",
                FetchOptions::new(),
                counting_fetch(
                    &calls,
                    Err(MuninError::Api {
                        status: 503,
                        message: "unavailable".into(),
                    }),
                ),
            )
            .await;
        assert!(result.is_err());
    }
    assert_eq!(calls.load(Ordering::Relaxed), 3);

    let breaker = munin.breaker("mock").unwrap();
    assert_eq!(breaker.state(), CircuitState::Open);

    // Fourth call is short-circuited: no upstream attempt.
    let result = munin
        .fetch_or_fallback(
            "btc:price",
            "mock",
            FetchOptions::new(),
            counting_fetch(&calls, Ok(json!(1.0))),
        )
        .await;
    assert!(matches!(result, Err(MuninError::FallbackExhausted { .. })));
    assert_eq!(calls.load(Ordering::Relaxed), 3);

    // After the recovery timeout the next call is attempted as a probe.
    tokio::time::advance(Duration::from_secs(60)).await;
    let fetched = munin
        .fetch_or_fallback(
            "btc:price",
            "mock",
            FetchOptions::new(),
            counting_fetch(&calls, Ok(json!(1.0))),
        )
        .await
        .unwrap();
    assert_eq!(fetched.source, Source::Fresh);
    assert_eq!(calls.load(Ordering::Relaxed), 4);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn upstream_timeout_counts_as_breaker_failure() {
    let munin = Munin::builder()
        .provider(fast_provider("mock").timeout(Duration::from_secs(1)))
        .build()
        .await
        .unwrap();

    let result = munin
        .fetch_or_fallback("btc:price", "mock", FetchOptions::new(), || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(json!(1.0))
        })
        .await;

    assert!(matches!(result, Err(MuninError::FallbackExhausted { .. })));
    assert_eq!(munin.breaker("mock").unwrap().failure_count(), 1);
}

// ============================================================================
// Fallback chain
// ============================================================================

#[tokio::test(start_paused = true)]
async fn expired_entry_degrades_to_stale_copy() {
    let munin = munin().await;
    let calls = Arc::new(AtomicU32::new(0));

    munin
        .fetch_or_fallback(
            "btc:price",
            "mock",
            FetchOptions::new().tier(CacheTier::Realtime),
            counting_fetch(&calls, Ok(json!(67421.5))),
        )
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(120)).await;

    let fetched = munin
        .fetch_or_fallback(
            "btc:price",
            "mock",
            FetchOptions::new().tier(CacheTier::Realtime),
            counting_fetch(&calls, Err(MuninError::Http("connection reset".into()))),
        )
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::Relaxed), 2); // the retry was attempted
    assert_eq!(fetched.source, Source::Fallback);
    assert_eq!(fetched.value, json!(67421.5));
    assert_eq!(fetched.age, Duration::from_secs(120));
}

#[tokio::test]
async fn open_circuit_with_golden_snapshot_serves_golden() {
    let munin = munin().await;
    munin
        .store()
        .set_golden("btc-history", json!([67000.0, 67421.5]))
        .await
        .unwrap();

    let breaker = munin.breaker("mock").unwrap();
    for _ in 0..3 {
        breaker.record_failure();
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let calls = Arc::new(AtomicU32::new(0));
    let fetched = munin
        .fetch_or_fallback(
            "history:btc",
            "mock",
            FetchOptions::new()
                .tier(CacheTier::Stable)
                .dataset("btc-history"),
            counting_fetch(&calls, Ok(json!(0.0))),
        )
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::Relaxed), 0);
    assert_eq!(fetched.source, Source::Golden);
    assert_eq!(fetched.value, json!([67000.0, 67421.5]));
}

#[tokio::test(start_paused = true)]
async fn stale_copy_wins_over_golden_snapshot() {
    let munin = munin().await;
    let calls = Arc::new(AtomicU32::new(0));

    munin
        .store()
        .set_golden("btc-history", json!("golden"))
        .await
        .unwrap();
    munin
        .fetch_or_fallback(
            "history:btc",
            "mock",
            FetchOptions::new()
                .tier(CacheTier::Realtime)
                .dataset("btc-history"),
            counting_fetch(&calls, Ok(json!("live"))),
        )
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(120)).await;

    let fetched = munin
        .fetch_or_fallback(
            "history:btc",
            "mock",
            FetchOptions::new()
                .tier(CacheTier::Realtime)
                .dataset("btc-history"),
            counting_fetch(&calls, Err(MuninError::EmptyResponse)),
        )
        .await
        .unwrap();

    // The per-key copy is fresher than the whole-dataset snapshot.
    assert_eq!(fetched.source, Source::Fallback);
    assert_eq!(fetched.value, json!("live"));
}

#[tokio::test]
async fn synthetic_generator_is_the_last_resort() {
    let munin = Munin::builder()
        .provider(fast_provider("mock"))
        .synthetic("btc-history", || json!({"synthetic": true}))
        .build()
        .await
        .unwrap();

    let fetched = munin
        .fetch_or_fallback(
            "history:btc",
            "mock",
            FetchOptions::new().dataset("btc-history"),
            || async { Err(MuninError::Http("down".into())) },
        )
        .await
        .unwrap();

    assert_eq!(fetched.source, Source::Synthetic);
    assert_eq!(fetched.value, json!({"synthetic": true}));
}

#[tokio::test]
async fn exhausted_fallbacks_surface_a_single_error() {
    let munin = munin().await;

    let result = munin
        .fetch_or_fallback("btc:price", "mock", FetchOptions::new(), || async {
            Err(MuninError::Http("down".into()))
        })
        .await;

    assert!(matches!(
        result,
        Err(MuninError::FallbackExhausted { key }) if key == "btc:price"
    ));
}

#[tokio::test]
async fn successful_fetch_updates_the_golden_snapshot() {
    let munin = munin().await;

    munin
        .fetch_or_fallback(
            "history:btc",
            "mock",
            FetchOptions::new()
                .tier(CacheTier::Stable)
                .dataset("btc-history"),
            || async { Ok(json!([1, 2, 3])) },
        )
        .await
        .unwrap();

    let (payload, _) = munin.store().get_golden("btc-history").await.unwrap();
    assert_eq!(payload, json!([1, 2, 3]));
}

// ============================================================================
// Payload validation
// ============================================================================

#[tokio::test]
async fn empty_payload_counts_as_upstream_failure() {
    let munin = munin().await;

    let result = munin
        .fetch_or_fallback("btc:price", "mock", FetchOptions::new(), || async {
            Ok(json!({}))
        })
        .await;

    assert!(result.is_err());
    assert_eq!(munin.breaker("mock").unwrap().failure_count(), 1);
}

#[tokio::test]
async fn rejected_payload_counts_as_upstream_failure() {
    let munin = munin().await;

    let opts = FetchOptions::new().validate(|v| v.get("price").is_some());
    let result = munin
        .fetch_or_fallback("btc:price", "mock", opts, || async {
            Ok(json!({"error": "upstream maintenance"}))
        })
        .await;

    assert!(result.is_err());
    assert_eq!(munin.breaker("mock").unwrap().failure_count(), 1);
}

#[tokio::test]
async fn rate_limit_errors_feed_the_limiter_backoff() {
    let munin = munin().await;

    let _ = munin
        .fetch_or_fallback("btc:price", "mock", FetchOptions::new(), || async {
            Err(MuninError::RateLimited { retry_after: None })
        })
        .await;

    assert_eq!(munin.limiter("mock").unwrap().error_streak(), 1);
    assert_eq!(munin.breaker("mock").unwrap().failure_count(), 1);
}

// ============================================================================
// Programmer errors
// ============================================================================

#[tokio::test]
async fn empty_key_is_an_invalid_argument() {
    let munin = munin().await;
    let result = munin
        .fetch_or_fallback("", "mock", FetchOptions::new(), || async { Ok(json!(1)) })
        .await;
    assert!(matches!(result, Err(MuninError::InvalidInput(_))));
}

#[tokio::test]
async fn unregistered_provider_is_rejected() {
    let munin = munin().await;
    let result = munin
        .fetch_or_fallback("btc:price", "nope", FetchOptions::new(), || async {
            Ok(json!(1))
        })
        .await;
    assert!(matches!(result, Err(MuninError::UnknownProvider(p)) if p == "nope"));
}

// ============================================================================
// Builder validation
// ============================================================================

#[tokio::test]
async fn builder_rejects_empty_and_invalid_configurations() {
    assert!(matches!(
        Munin::builder().build().await,
        Err(MuninError::Configuration(_))
    ));

    assert!(matches!(
        Munin::builder()
            .provider(ProviderSpec::new("p").rate_budget(RateBudget::new().capacity(0)))
            .build()
            .await,
        Err(MuninError::Configuration(_))
    ));

    assert!(matches!(
        Munin::builder()
            .provider(ProviderSpec::new("p"))
            .provider(ProviderSpec::new("p"))
            .build()
            .await,
        Err(MuninError::Configuration(_))
    ));
}
