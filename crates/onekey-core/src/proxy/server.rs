//! Gateway state wiring and the proxy router.

use crate::proxy::cache::ResponseCache;
use crate::proxy::circuit_breaker::CircuitBreaker;
use crate::proxy::metrics::MetricsRegistry;
use crate::proxy::pipeline::handle_proxy;
use crate::proxy::rate_limit::RateLimiter;
use crate::proxy::upstream::UpstreamClient;
use crate::store::Store;
use axum::Router;
use onekey_types::AppConfig;
use std::sync::Arc;

/// Shared state for the proxy path and the admin endpoints.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<AppConfig>,
    pub store: Arc<Store>,
    pub limiter: Arc<RateLimiter>,
    pub breaker: Arc<CircuitBreaker>,
    pub cache: Arc<ResponseCache>,
    pub upstream: Arc<UpstreamClient>,
    pub metrics: Arc<MetricsRegistry>,
}

impl GatewayState {
    /// Wire every subsystem from the loaded configuration. Connects the
    /// Redis backend when enabled; a Redis that is down at boot degrades
    /// to local-only rather than failing startup.
    pub async fn from_config(config: AppConfig) -> Self {
        let store = Arc::new(Store::connect(&config.redis).await);
        Self::with_store(config, store)
    }

    /// Wire against an explicit store. Used by tests and by deployments
    /// that force local-only coordination.
    pub fn with_store(config: AppConfig, store: Arc<Store>) -> Self {
        let limiter = Arc::new(RateLimiter::new(store.clone(), config.rate_limit.clone()));
        let breaker = Arc::new(CircuitBreaker::new(store.clone(), config.circuit_breaker));
        let cache = Arc::new(ResponseCache::new(
            store.clone(),
            config.proxy.cache_ttl,
            config.proxy.cache_max_body_size,
        ));
        let upstream = Arc::new(UpstreamClient::new(&config.providers));

        Self {
            config: Arc::new(config),
            store,
            limiter,
            breaker,
            cache,
            upstream,
            metrics: Arc::new(MetricsRegistry::new()),
        }
    }

    /// Provider ids, for endpoints that iterate all providers.
    pub fn provider_ids(&self) -> Vec<String> {
        self.config.providers.keys().cloned().collect()
    }
}

/// The proxy router: every request that is not an admin route falls
/// through to the mediation pipeline.
pub fn build_proxy_router(state: GatewayState) -> Router {
    Router::new().fallback(handle_proxy).with_state(state)
}
