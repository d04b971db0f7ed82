//! Admin and metrics endpoints.

use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use onekey_core::{BreakerStats, GatewayState};
use std::collections::HashMap;

pub fn router() -> Router<GatewayState> {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/circuit-breaker-stats", get(circuit_breaker_stats))
        .route("/rate-limit-stats", get(rate_limit_stats))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn metrics(State(state): State<GatewayState>) -> Response {
    // Health gauges reflect breaker state at scrape time.
    for id in state.provider_ids() {
        let breaker_state = state.breaker.state(&id).await;
        state.metrics.set_provider_health(&id, breaker_state.health_value());
    }

    let body = state.metrics.render();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")], body).into_response()
}

/// Per-provider breaker records, keyed by provider id. The state names
/// (`closed` / `open` / `half_open`) are consumed by the test suite and
/// operator tooling.
async fn circuit_breaker_stats(
    State(state): State<GatewayState>,
) -> Json<HashMap<String, BreakerStats>> {
    let mut stats = HashMap::new();
    for id in state.provider_ids() {
        stats.insert(id.clone(), state.breaker.stats(&id).await);
    }
    Json(stats)
}

async fn rate_limit_stats(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let ids = state.provider_ids();
    let stats = state.limiter.stats(&ids).await;
    Json(serde_json::to_value(stats).unwrap_or_else(|_| serde_json::json!({})))
}
