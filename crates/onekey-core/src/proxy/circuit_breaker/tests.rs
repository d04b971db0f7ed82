use super::*;
use onekey_types::CircuitBreakerConfig;
use std::time::Duration;

fn breaker(config: CircuitBreakerConfig) -> CircuitBreaker {
    CircuitBreaker::new(Arc::new(Store::local_only()), config)
}

fn fast_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: 3,
        success_threshold: 2,
        timeout_seconds: 0.05,
        half_open_requests: 1,
    }
}

#[tokio::test]
async fn opens_after_consecutive_failures() {
    let cb = breaker(fast_config());

    assert_eq!(cb.state("zerion").await, CircuitState::Closed);
    cb.record_failure("zerion").await;
    cb.record_failure("zerion").await;
    assert_eq!(cb.state("zerion").await, CircuitState::Closed);

    cb.record_failure("zerion").await;
    assert_eq!(cb.state("zerion").await, CircuitState::Open);

    let (allowed, state) = cb.allow_request("zerion").await;
    assert!(!allowed);
    assert_eq!(state, CircuitState::Open);
}

#[tokio::test]
async fn success_resets_failure_count_without_transition() {
    let cb = breaker(fast_config());

    cb.record_failure("zerion").await;
    cb.record_failure("zerion").await;
    cb.record_success("zerion").await;

    let stats = cb.stats("zerion").await;
    assert_eq!(stats.state, CircuitState::Closed);
    assert_eq!(stats.failures, 0);

    // The counter restarts from zero: two more failures don't trip it.
    cb.record_failure("zerion").await;
    cb.record_failure("zerion").await;
    assert_eq!(cb.state("zerion").await, CircuitState::Closed);
}

#[tokio::test]
async fn recovers_through_half_open() {
    let cb = breaker(fast_config());

    for _ in 0..3 {
        cb.record_failure("zerion").await;
    }
    assert_eq!(cb.state("zerion").await, CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(80)).await;

    let (allowed, state) = cb.allow_request("zerion").await;
    assert!(allowed);
    assert_eq!(state, CircuitState::HalfOpen);

    cb.record_success("zerion").await;
    cb.release_half_open_slot("zerion").await;
    assert_eq!(cb.state("zerion").await, CircuitState::HalfOpen);

    let (allowed, _) = cb.allow_request("zerion").await;
    assert!(allowed);
    cb.record_success("zerion").await;
    cb.release_half_open_slot("zerion").await;

    let stats = cb.stats("zerion").await;
    assert_eq!(stats.state, CircuitState::Closed);
    assert_eq!(stats.failures, 0);
    assert_eq!(stats.successes, 0);
    assert_eq!(stats.half_open_requests, 0);
}

#[tokio::test]
async fn half_open_probe_failure_reopens() {
    let cb = breaker(fast_config());

    for _ in 0..3 {
        cb.record_failure("zerion").await;
    }
    tokio::time::sleep(Duration::from_millis(80)).await;

    let (allowed, _) = cb.allow_request("zerion").await;
    assert!(allowed);

    cb.record_failure("zerion").await;
    // Release after the reopen must not drive the slot counter negative.
    cb.release_half_open_slot("zerion").await;

    let stats = cb.stats("zerion").await;
    assert_eq!(stats.state, CircuitState::Open);
    assert_eq!(stats.half_open_requests, 0);
}

#[tokio::test]
async fn half_open_concurrency_is_bounded() {
    let config = CircuitBreakerConfig { half_open_requests: 2, ..fast_config() };
    let cb = breaker(config);

    for _ in 0..3 {
        cb.record_failure("zerion").await;
    }
    tokio::time::sleep(Duration::from_millis(80)).await;

    // First admission performs the OPEN→HALF_OPEN transition.
    let (allowed, _) = cb.allow_request("zerion").await;
    assert!(allowed);

    let (a, _) = cb.allow_request("zerion").await;
    let (b, _) = cb.allow_request("zerion").await;
    let (c, _) = cb.allow_request("zerion").await;
    assert!(a && b);
    assert!(!c, "half-open admitted more probes than configured");

    assert_eq!(cb.stats("zerion").await.half_open_requests, 2);

    cb.release_half_open_slot("zerion").await;
    let (again, _) = cb.allow_request("zerion").await;
    assert!(again, "released slot should re-admit");
}

#[tokio::test]
async fn open_cannot_close_without_half_open() {
    let cb = breaker(fast_config());

    for _ in 0..3 {
        cb.record_failure("zerion").await;
    }
    // Successes recorded while OPEN (from requests admitted before the
    // trip) must not close the breaker.
    cb.record_success("zerion").await;
    cb.record_success("zerion").await;
    assert_eq!(cb.state("zerion").await, CircuitState::Open);
}

#[tokio::test]
async fn release_in_closed_is_a_noop() {
    let cb = breaker(fast_config());
    cb.release_half_open_slot("zerion").await;
    let stats = cb.stats("zerion").await;
    assert_eq!(stats.state, CircuitState::Closed);
    assert_eq!(stats.half_open_requests, 0);
}

#[tokio::test]
async fn providers_are_isolated() {
    let cb = breaker(fast_config());
    for _ in 0..3 {
        cb.record_failure("zerion").await;
    }
    assert_eq!(cb.state("zerion").await, CircuitState::Open);
    assert_eq!(cb.state("coingecko").await, CircuitState::Closed);
    let (allowed, _) = cb.allow_request("coingecko").await;
    assert!(allowed);
}

#[test]
fn health_values_match_dashboard_convention() {
    assert!((CircuitState::Closed.health_value() - 1.0).abs() < f64::EPSILON);
    assert!((CircuitState::HalfOpen.health_value() - 0.5).abs() < f64::EPSILON);
    assert!(CircuitState::Open.health_value().abs() < f64::EPSILON);
}
