//! The request-mediation pipeline and its subsystems.

pub mod cache;
pub mod circuit_breaker;
pub mod events;
pub mod metrics;
pub mod pipeline;
pub mod rate_limit;
pub mod server;
pub mod upstream;
