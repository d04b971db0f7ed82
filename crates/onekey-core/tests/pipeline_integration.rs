#![allow(clippy::tests_outside_test_module, reason = "integration tests live in tests/ dir")]
#![allow(clippy::expect_used, clippy::unwrap_used, reason = "panics are the assertion mechanism")]

//! End-to-end pipeline tests against a mock upstream.
//!
//! Each test boots the full proxy router on a loopback listener with a
//! local-only store and drives it with a real HTTP client, so admission,
//! caching, breaker transitions and retries are exercised exactly as in
//! production minus Redis.

use onekey_core::proxy::server::build_proxy_router;
use onekey_core::{CircuitState, GatewayState, Store};
use onekey_types::{
    AppConfig, AuthType, CircuitBreakerConfig, ProviderConfig, RateRule, RetryConfig,
    TimeoutConfig,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(upstream: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.providers.insert(
        "zerion".to_string(),
        ProviderConfig {
            prefix: "zerion".to_string(),
            upstream: upstream.to_string(),
            auth_type: AuthType::Basic,
            auth_header: None,
            api_key: Some("zk_dev_123".to_string()),
            timeout: TimeoutConfig { connect_ms: 1_000, send_ms: 500, read_ms: 500 },
            retry: RetryConfig { times: 1, delay_ms: 50 },
            ssl_verify: true,
        },
    );
    config.circuit_breaker = CircuitBreakerConfig {
        failure_threshold: 3,
        success_threshold: 2,
        timeout_seconds: 0.3,
        half_open_requests: 1,
    };
    // Generous limits so only the rate-limit test trips them.
    config.rate_limit.global = RateRule { rate: 10_000.0, burst: 10_000.0 };
    config.rate_limit.per_ip = RateRule { rate: 10_000.0, burst: 10_000.0 };
    config
}

async fn spawn_gateway(config: AppConfig) -> (String, GatewayState) {
    let state = GatewayState::with_store(config, Arc::new(Store::local_only()));
    let app = build_proxy_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });
    (format!("http://{addr}"), state)
}

#[tokio::test]
async fn unknown_prefix_is_404_without_upstream_call() {
    let upstream = MockServer::start().await;
    let (base, state) = spawn_gateway(test_config(&upstream.uri())).await;

    let response = reqwest::get(format!("{base}/unknown/x")).await.unwrap();
    assert_eq!(response.status(), 404);
    let body = response.text().await.unwrap();
    assert!(body.contains("Provider not found"), "unexpected body: {body}");

    assert!(upstream.received_requests().await.unwrap().is_empty());
    assert_eq!(state.breaker.state("zerion").await, CircuitState::Closed);
}

#[tokio::test]
async fn rate_limit_denial_carries_scope_and_retry_after() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(".*"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let mut config = test_config(&upstream.uri());
    config.rate_limit.global = RateRule { rate: 0.0, burst: 1.0 };
    let (base, _state) = spawn_gateway(config).await;

    let first = reqwest::get(format!("{base}/zerion/v1/a")).await.unwrap();
    assert_eq!(first.status(), 200);

    let second = reqwest::get(format!("{base}/zerion/v1/a")).await.unwrap();
    assert_eq!(second.status(), 429);
    assert_eq!(second.headers().get("retry-after").unwrap(), "60");
    let body: serde_json::Value = second.json().await.unwrap();
    assert_eq!(body["error"], "Rate limit exceeded");
    assert_eq!(body["type"], "global");
}

#[tokio::test]
async fn breaker_trips_and_recovers_through_half_open() {
    let upstream = MockServer::start().await;
    let (base, state) = spawn_gateway(test_config(&upstream.uri())).await;
    let client = reqwest::Client::new();

    {
        let _guard = Mock::given(method("GET"))
            .and(path_regex(".*"))
            .respond_with(ResponseTemplate::new(500))
            .mount_as_scoped(&upstream)
            .await;

        for _ in 0..3 {
            let response = client.get(format!("{base}/zerion/status/500")).send().await.unwrap();
            assert_eq!(response.status(), 500);
        }
    }
    assert_eq!(state.breaker.state("zerion").await, CircuitState::Open);

    // Denied while open, no stale cache for this path.
    let denied = client.get(format!("{base}/zerion/status/500")).send().await.unwrap();
    assert_eq!(denied.status(), 503);
    assert_eq!(denied.headers().get("retry-after").unwrap(), "30");
    let body: serde_json::Value = denied.json().await.unwrap();
    assert_eq!(body["reason"], "circuit_breaker");

    tokio::time::sleep(Duration::from_millis(400)).await;

    Mock::given(method("GET"))
        .and(path_regex(".*"))
        .respond_with(ResponseTemplate::new(200).set_body_string("recovered"))
        .mount(&upstream)
        .await;

    // First probe: admitted via OPEN → HALF_OPEN, succeeds.
    let probe = client.get(format!("{base}/zerion/probe-a")).send().await.unwrap();
    assert_eq!(probe.status(), 200);
    assert_eq!(state.breaker.state("zerion").await, CircuitState::HalfOpen);

    // Second success closes the breaker and zeroes its counters.
    let probe = client.get(format!("{base}/zerion/probe-b")).send().await.unwrap();
    assert_eq!(probe.status(), 200);

    let stats = state.breaker.stats("zerion").await;
    assert_eq!(stats.state, CircuitState::Closed);
    assert_eq!(stats.failures, 0);
    assert_eq!(stats.successes, 0);
    assert_eq!(stats.half_open_requests, 0);
}

#[tokio::test]
async fn open_breaker_serves_stale_cache_with_degraded_marker() {
    let upstream = MockServer::start().await;
    let (base, state) = spawn_gateway(test_config(&upstream.uri())).await;
    let client = reqwest::Client::new();

    {
        let _guard = Mock::given(method("GET"))
            .and(path_regex("/data"))
            .respond_with(ResponseTemplate::new(200).set_body_string("cached-payload"))
            .mount_as_scoped(&upstream)
            .await;
        let warm = client.get(format!("{base}/zerion/data")).send().await.unwrap();
        assert_eq!(warm.status(), 200);
    }

    {
        let _guard = Mock::given(method("GET"))
            .and(path_regex(".*"))
            .respond_with(ResponseTemplate::new(500))
            .mount_as_scoped(&upstream)
            .await;
        for _ in 0..3 {
            client.get(format!("{base}/zerion/failing")).send().await.unwrap();
        }
    }
    assert_eq!(state.breaker.state("zerion").await, CircuitState::Open);

    let degraded = client.get(format!("{base}/zerion/data")).send().await.unwrap();
    assert_eq!(degraded.status(), 200);
    assert_eq!(degraded.headers().get("x-degraded").unwrap(), "cache");
    let age: f64 = degraded
        .headers()
        .get("x-cache-age")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(age >= 0.0);
    assert_eq!(degraded.text().await.unwrap(), "cached-payload");
}

#[tokio::test]
async fn get_timeout_is_retried_once_and_succeeds() {
    let upstream = MockServer::start().await;
    // First attempt exceeds the 1 s request deadline; the retry hits the
    // instant mock mounted below it.
    Mock::given(method("GET"))
        .and(path_regex(".*"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(1_500)))
        .up_to_n_times(1)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(".*"))
        .respond_with(ResponseTemplate::new(200).set_body_string("second-attempt"))
        .mount(&upstream)
        .await;

    let (base, _state) = spawn_gateway(test_config(&upstream.uri())).await;

    let started = std::time::Instant::now();
    let response = reqwest::get(format!("{base}/zerion/slow")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "second-attempt");
    // One timed-out attempt plus the backoff sleep.
    assert!(started.elapsed() >= Duration::from_millis(550));

    assert_eq!(upstream.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn post_is_never_retried() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex(".*"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(1_500)))
        .mount(&upstream)
        .await;

    let (base, _state) = spawn_gateway(test_config(&upstream.uri())).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/zerion/v1/tx"))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Upstream service error");
    assert_eq!(body["type"], "timeout");

    assert_eq!(upstream.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn credentials_are_injected_and_inbound_authorization_overwritten() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(".*"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let (base, _state) = spawn_gateway(test_config(&upstream.uri())).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{base}/zerion/v1/portfolio"))
        .header("authorization", "Bearer leaked")
        .header("connection", "keep-alive")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.headers().get("x-proxy-request-id").is_some());
    assert_eq!(response.headers().get("x-provider").unwrap(), "zerion");

    let requests = upstream.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let seen = &requests[0];

    // basic base64("zk_dev_123:")
    let auth = seen.headers.get("authorization").unwrap().to_str().unwrap();
    assert_eq!(auth, "Basic emtfZGV2XzEyMzo=");
    assert!(seen.headers.get("x-onekey-request-id").is_some());
}

#[tokio::test]
async fn fresh_cache_hit_skips_upstream() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(".*"))
        .respond_with(ResponseTemplate::new(200).set_body_string("cacheable"))
        .mount(&upstream)
        .await;

    let (base, _state) = spawn_gateway(test_config(&upstream.uri())).await;
    let client = reqwest::Client::new();

    let miss = client.get(format!("{base}/zerion/cache-test-1")).send().await.unwrap();
    assert_eq!(miss.status(), 200);
    assert!(miss.headers().get("x-cache").is_none());

    let hit = client.get(format!("{base}/zerion/cache-test-1")).send().await.unwrap();
    assert_eq!(hit.status(), 200);
    assert_eq!(hit.headers().get("x-cache").unwrap(), "HIT");
    assert_eq!(hit.text().await.unwrap(), "cacheable");

    assert_eq!(upstream.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn oversize_request_body_is_rejected_before_forwarding() {
    let upstream = MockServer::start().await;
    let mut config = test_config(&upstream.uri());
    config.proxy.max_body_size = 64;
    let (base, _state) = spawn_gateway(config).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/zerion/v1/tx"))
        .body(vec![b'x'; 1024])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 413);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["type"], "request_too_large");

    assert!(upstream.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_credential_is_a_configuration_error() {
    let upstream = MockServer::start().await;
    let mut config = test_config(&upstream.uri());
    config.providers.get_mut("zerion").unwrap().api_key = None;
    let (base, _state) = spawn_gateway(config).await;

    let response = reqwest::get(format!("{base}/zerion/v1/a")).await.unwrap();
    assert_eq!(response.status(), 500);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Service configuration error");

    assert!(upstream.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn upstream_4xx_passes_through_without_tripping_breaker() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(".*"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not here"))
        .mount(&upstream)
        .await;

    let (base, state) = spawn_gateway(test_config(&upstream.uri())).await;
    let client = reqwest::Client::new();

    for _ in 0..5 {
        let response = client.get(format!("{base}/zerion/missing")).send().await.unwrap();
        assert_eq!(response.status(), 404);
    }
    assert_eq!(state.breaker.state("zerion").await, CircuitState::Closed);
}
