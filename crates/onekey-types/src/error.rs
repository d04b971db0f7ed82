//! Typed error definitions for the OneKey gateway.
//!
//! Two layers:
//!
//! - [`ErrorKind`]: the stable classification label set. These strings are
//!   ABI for dashboards: they appear as the `error_type` metric label and in
//!   structured logs, so renaming one breaks downstream alerting.
//! - [`GatewayError`]: the pipeline-level error carrying enough context to
//!   render the client-facing JSON body and pick an HTTP status.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Request outcome classification.
///
/// Covers transport failures, status-derived outcomes, and pipeline-level
/// rejections. `CacheHit` is not an error but is recorded under the same
/// label dimension so dashboards can stack all outcomes on one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidProvider,
    RateLimit,
    CircuitBreaker,
    MissingApiKey,
    RequestTooLarge,
    Timeout,
    ConnectionRefused,
    ConnectFailure,
    SslError,
    ConnectionBroken,
    UpstreamError,
    Upstream4xx,
    Upstream5xx,
    DegradedCache,
    CacheHit,
}

impl ErrorKind {
    /// The stable label used in metrics and structured logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidProvider => "invalid_provider",
            Self::RateLimit => "rate_limit",
            Self::CircuitBreaker => "circuit_breaker",
            Self::MissingApiKey => "missing_api_key",
            Self::RequestTooLarge => "request_too_large",
            Self::Timeout => "timeout",
            Self::ConnectionRefused => "connection_refused",
            Self::ConnectFailure => "connect_failure",
            Self::SslError => "ssl_error",
            Self::ConnectionBroken => "connection_broken",
            Self::UpstreamError => "upstream_error",
            Self::Upstream4xx => "upstream_4xx",
            Self::Upstream5xx => "upstream_5xx",
            Self::DegradedCache => "degraded_cache",
            Self::CacheHit => "cache_hit",
        }
    }

    /// Whether this is a transport-level failure (as opposed to a
    /// status-derived or pipeline-level outcome).
    pub const fn is_transport(self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::ConnectionRefused
                | Self::ConnectFailure
                | Self::SslError
                | Self::ConnectionBroken
                | Self::UpstreamError
        )
    }

    /// Whether a failed attempt with this classification may be retried.
    ///
    /// Only transport failures are candidates at all; of those, TLS
    /// handshake failures are deterministic and excluded.
    pub const fn is_retryable(self) -> bool {
        self.is_transport() && !matches!(self, Self::SslError)
    }

    /// Whether this outcome counts as a circuit-breaker failure.
    /// 4xx responses are the caller's problem, not the provider's.
    pub const fn is_breaker_failure(self) -> bool {
        self.is_transport() || matches!(self, Self::Upstream5xx)
    }

    /// Classify an upstream HTTP status code.
    pub const fn from_status(status: u16) -> Option<Self> {
        match status {
            400..=499 => Some(Self::Upstream4xx),
            500..=599 => Some(Self::Upstream5xx),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors the request pipeline itself produces.
///
/// Upstream-originated responses (including 4xx/5xx bodies) are passed
/// through verbatim and never take this form; these variants cover the
/// rejections and failures the gateway reports in its own voice.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "details")]
pub enum GatewayError {
    /// No configured provider matches the request path prefix.
    #[error("no provider matches prefix {prefix}")]
    ProviderNotFound { prefix: String },

    /// A rate-limit scope denied the request.
    #[error("rate limit exceeded ({scope})")]
    RateLimited { scope: String },

    /// The provider's circuit breaker denied the request and no stale
    /// cache entry was available.
    #[error("circuit breaker {state} for {provider}")]
    CircuitOpen { provider: String, state: String },

    /// Provider requires a credential but none is configured.
    #[error("no API key configured for {provider}")]
    MissingCredential { provider: String },

    /// Inbound request body exceeds the configured maximum.
    #[error("request body exceeds {max_bytes} bytes")]
    RequestTooLarge { max_bytes: usize },

    /// All upstream attempts failed at the transport level.
    #[error("upstream {provider} unreachable: {message}")]
    UpstreamUnreachable { provider: String, kind: ErrorKind, message: String },
}

impl GatewayError {
    /// HTTP status the pipeline maps this error to.
    pub const fn http_status(&self) -> u16 {
        match *self {
            Self::ProviderNotFound { .. } => 404,
            Self::RateLimited { .. } => 429,
            Self::CircuitOpen { .. } => 503,
            Self::MissingCredential { .. } => 500,
            Self::RequestTooLarge { .. } => 413,
            Self::UpstreamUnreachable { .. } => 502,
        }
    }

    /// Classification label recorded for this error.
    pub const fn kind(&self) -> ErrorKind {
        match *self {
            Self::ProviderNotFound { .. } => ErrorKind::InvalidProvider,
            Self::RateLimited { .. } => ErrorKind::RateLimit,
            Self::CircuitOpen { .. } => ErrorKind::CircuitBreaker,
            Self::MissingCredential { .. } => ErrorKind::MissingApiKey,
            Self::RequestTooLarge { .. } => ErrorKind::RequestTooLarge,
            Self::UpstreamUnreachable { kind, .. } => kind,
        }
    }
}

/// Errors from the KV backend.
///
/// These never reach a client: the store facade degrades a failed
/// distributed call to the local backend and logs a warning.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("backend authentication failed: {0}")]
    AuthFailed(String),

    #[error("script execution failed: {0}")]
    Script(String),

    #[error("backend connection failed: {0}")]
    Connection(String),

    #[error("stored value malformed: {0}")]
    Malformed(String),
}
