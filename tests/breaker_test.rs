use std::time::Duration;

use munin::{BreakerConfig, CircuitBreaker, CircuitState, MuninError};

fn breaker(threshold: u32, recovery: Duration, retries: u32) -> CircuitBreaker {
    CircuitBreaker::new(
        "test-provider",
        BreakerConfig::new()
            .failure_threshold(threshold)
            .recovery_timeout(recovery)
            .half_open_retries(retries),
    )
}

#[tokio::test]
async fn starts_closed_and_admits() {
    let breaker = breaker(3, Duration::from_secs(60), 1);
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert!(breaker.admit().is_ok());
    assert_eq!(breaker.failure_count(), 0);
}

#[tokio::test]
async fn opens_after_threshold_failures() {
    let breaker = breaker(3, Duration::from_secs(60), 1);
    breaker.record_failure();
    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Closed);

    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);

    let err = breaker.admit().unwrap_err();
    assert!(matches!(err, MuninError::CircuitOpen { provider } if provider == "test-provider"));
}

#[tokio::test]
async fn success_resets_the_failure_streak() {
    let breaker = breaker(3, Duration::from_secs(60), 1);
    breaker.record_failure();
    breaker.record_failure();
    breaker.record_success();
    assert_eq!(breaker.failure_count(), 0);

    // Two more failures are not enough to open after the reset.
    breaker.record_failure();
    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn short_circuits_until_recovery_timeout() {
    let breaker = breaker(1, Duration::from_secs(600), 1);
    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(599)).await;
    assert!(breaker.admit().is_err());
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(breaker.admit().is_ok());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
}

#[tokio::test(start_paused = true)]
async fn half_open_success_closes_and_resets() {
    let breaker = breaker(2, Duration::from_secs(60), 1);
    breaker.record_failure();
    breaker.record_failure();

    tokio::time::advance(Duration::from_secs(60)).await;
    assert!(breaker.admit().is_ok());
    breaker.record_success();

    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
    assert!(breaker.admit().is_ok());
}

#[tokio::test(start_paused = true)]
async fn half_open_failure_reopens_and_restarts_the_timer() {
    let breaker = breaker(1, Duration::from_secs(60), 1);
    breaker.record_failure();

    tokio::time::advance(Duration::from_secs(60)).await;
    assert!(breaker.admit().is_ok());
    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);

    // The recovery window restarts from the probe failure.
    tokio::time::advance(Duration::from_secs(59)).await;
    assert!(breaker.admit().is_err());
    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(breaker.admit().is_ok());
}

#[tokio::test(start_paused = true)]
async fn half_open_admits_at_most_the_probe_budget() {
    let breaker = breaker(1, Duration::from_secs(60), 2);
    breaker.record_failure();

    tokio::time::advance(Duration::from_secs(60)).await;
    assert!(breaker.admit().is_ok());
    assert!(breaker.admit().is_ok());
    // Third probe is refused while the first two are undecided.
    assert!(breaker.admit().is_err());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
}

#[tokio::test(start_paused = true)]
async fn late_failure_while_open_keeps_the_recovery_window() {
    let breaker = breaker(1, Duration::from_secs(60), 1);
    breaker.record_failure();

    // A call admitted before the circuit opened completes late with an
    // error; the recovery timer must not restart for it.
    tokio::time::advance(Duration::from_secs(30)).await;
    breaker.record_failure();

    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(breaker.admit().is_ok());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
}
