//! Core request-mediation pipeline for the OneKey gateway.
//!
//! The gateway fronts several third-party HTTP APIs ("providers") and
//! mediates every request through a fixed sequence of protections:
//! route match → rate limiting → response cache → circuit breaker →
//! upstream forward with retry → observability.
//!
//! All coordination state (breaker records, token buckets, cache entries)
//! lives in the [`store`] layer, which offers a process-local backend and a
//! Redis backend behind one interface with per-call degradation. Running
//! several gateway instances against the same Redis yields a consistent
//! shared view of breakers and buckets.

pub mod proxy;
pub mod store;

pub use proxy::cache::ResponseCache;
pub use proxy::circuit_breaker::{BreakerStats, CircuitBreaker, CircuitState};
pub use proxy::metrics::MetricsRegistry;
pub use proxy::pipeline::handle_proxy;
pub use proxy::rate_limit::{RateDecision, RateLimiter, RateScope};
pub use proxy::server::GatewayState;
pub use proxy::upstream::UpstreamClient;
pub use store::Store;
