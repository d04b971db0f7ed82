//! OneKey Gateway - Headless Daemon
//!
//! A pure Rust reverse proxy that:
//! - Mediates requests to configured providers on /{prefix}/*
//! - Enforces rate limits and per-provider circuit breakers
//! - Serves admin and metrics endpoints on /health, /metrics,
//!   /circuit-breaker-stats and /rate-limit-stats

use anyhow::Result;
use axum::Router;
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod api;
mod config_loader;

use onekey_core::proxy::server::build_proxy_router;
use onekey_core::GatewayState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = config_loader::load()?;
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;

    info!(
        providers = config.providers.len(),
        redis = config.redis.enabled,
        "starting OneKey gateway"
    );

    let state = GatewayState::from_config(config).await;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("gateway listening on http://{addr}");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}

fn build_router(state: GatewayState) -> Router {
    // Admin routes take precedence; everything else falls through to the
    // mediation pipeline.
    api::router()
        .with_state(state.clone())
        .merge(build_proxy_router(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
}
