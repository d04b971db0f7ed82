//! Shared types for the OneKey gateway.
//!
//! This crate holds the pieces every other crate agrees on:
//!
//! - **Configuration models**: serde structs loaded once at startup and
//!   frozen (no hot-reload).
//! - **Typed errors**: a structured error hierarchy with stable,
//!   dashboard-visible classification labels.

pub mod config;
pub mod error;

pub use config::{
    AppConfig, AuthType, CircuitBreakerConfig, LoggingConfig, ProviderConfig, ProxyLimits,
    RateLimitConfig, RateRule, RedisConfig, RetryConfig, ServerConfig, TimeoutConfig,
};
pub use error::{ErrorKind, GatewayError, StoreError};
