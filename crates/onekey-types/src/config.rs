//! Gateway configuration.
//!
//! Loaded once at startup from a JSON file and frozen; provider descriptors
//! are immutable after load. `STRESS_TEST_MODE=1` applies a single toggle
//! that multiplies rate limits and relaxes breaker thresholds so load tests
//! don't trip the protections they are trying to measure.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use validator::Validate;

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AppConfig {
    #[serde(default)]
    #[validate(nested)]
    pub server: ServerConfig,
    #[serde(default)]
    #[validate(nested)]
    pub redis: RedisConfig,
    /// Provider descriptors keyed by provider id; each is validated
    /// individually at load time.
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    #[validate(nested)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub proxy: ProxyLimits,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            redis: RedisConfig::default(),
            providers: HashMap::new(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            proxy: ProxyLimits::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Apply the stress-test overrides: rate limits ×10 and a breaker that
    /// takes four times as many failures to trip.
    pub fn apply_stress_mode(&mut self) {
        tracing::warn!("STRESS_TEST_MODE active: rate limits x10, breaker thresholds relaxed");
        self.rate_limit.global.rate *= 10.0;
        self.rate_limit.global.burst *= 10.0;
        self.rate_limit.per_ip.rate *= 10.0;
        self.rate_limit.per_ip.burst *= 10.0;
        for rule in self.rate_limit.per_provider.values_mut() {
            rule.rate *= 10.0;
            rule.burst *= 10.0;
        }
        self.circuit_breaker.failure_threshold *= 4;
    }

    /// Look up a provider by its URL prefix (the first path segment).
    pub fn provider_by_prefix(&self, prefix: &str) -> Option<(&str, &ProviderConfig)> {
        self.providers
            .iter()
            .find(|(_, p)| p.prefix == prefix)
            .map(|(id, p)| (id.as_str(), p))
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[validate(range(min = 1_u16))]
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: default_host(), port: default_port() }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    8080
}

/// Distributed backend settings. Disabled by default; when disabled all
/// coordination state lives in the process-local store.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RedisConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub db: i64,
    #[serde(default)]
    pub password: Option<String>,
    /// Per-operation deadline in milliseconds; an operation that exceeds it
    /// degrades to the local backend.
    #[validate(range(min = 10_u64, max = 60_000_u64))]
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
    /// Number of multiplexed connections to round-robin over.
    #[validate(range(min = 1_usize, max = 64_usize))]
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,
    /// TCP keepalive interval in seconds.
    #[serde(default = "default_redis_keepalive")]
    pub keepalive_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_redis_host(),
            port: default_redis_port(),
            db: 0,
            password: None,
            timeout_ms: default_redis_timeout_ms(),
            pool_size: default_redis_pool_size(),
            keepalive_secs: default_redis_keepalive(),
        }
    }
}

impl RedisConfig {
    /// Connection URL in the form `redis://[:password@]host:port/db`.
    pub fn url(&self) -> String {
        match &self.password {
            Some(pw) => format!("redis://:{}@{}:{}/{}", pw, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_redis_port() -> u16 {
    6379
}

const fn default_redis_timeout_ms() -> u64 {
    500
}

const fn default_redis_pool_size() -> usize {
    4
}

const fn default_redis_keepalive() -> u64 {
    60
}

/// How the provider credential is attached to the outgoing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    /// `Authorization: Basic base64("{key}:")`
    Basic,
    /// The configured header name carries the key verbatim.
    Header,
    /// The key is interpolated into the upstream URL path.
    Url,
    /// No credential injection.
    #[default]
    None,
}

/// One upstream provider. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ProviderConfig {
    /// URL prefix (first path segment) that routes to this provider.
    #[validate(length(min = 1_u64))]
    pub prefix: String,
    /// Upstream base URL, no trailing slash.
    #[validate(length(min = 1_u64))]
    pub upstream: String,
    #[serde(default)]
    pub auth_type: AuthType,
    /// Header name for `auth_type = header`.
    #[serde(default)]
    pub auth_header: Option<String>,
    /// Credential. Absent means the env var `ONEKEY_API_KEY_{ID}` is
    /// consulted at load time.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub timeout: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_true")]
    pub ssl_verify: bool,
}

const fn default_true() -> bool {
    true
}

/// Per-attempt timeouts in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,
    #[serde(default = "default_send_ms")]
    pub send_ms: u64,
    #[serde(default = "default_read_ms")]
    pub read_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            send_ms: default_send_ms(),
            read_ms: default_read_ms(),
        }
    }
}

const fn default_connect_ms() -> u64 {
    3_000
}

const fn default_send_ms() -> u64 {
    10_000
}

const fn default_read_ms() -> u64 {
    10_000
}

/// Bounded exponential-backoff retry policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Additional attempts after the first (so `times = 2` means at most
    /// three attempts for an idempotent method).
    #[serde(default = "default_retry_times")]
    pub times: u32,
    /// Base delay before the first retry, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { times: default_retry_times(), delay_ms: default_retry_delay_ms() }
    }
}

const fn default_retry_times() -> u32 {
    2
}

const fn default_retry_delay_ms() -> u64 {
    100
}

/// Circuit breaker thresholds, shared by all providers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in CLOSED before the breaker opens.
    #[validate(range(min = 1_u32))]
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive successes in HALF_OPEN before the breaker closes.
    #[validate(range(min = 1_u32))]
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Seconds the breaker stays OPEN before probing.
    #[serde(default = "default_open_timeout")]
    pub timeout_seconds: f64,
    /// Probe requests admitted concurrently while HALF_OPEN.
    #[validate(range(min = 1_u32))]
    #[serde(default = "default_half_open_requests")]
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_seconds: default_open_timeout(),
            half_open_requests: default_half_open_requests(),
        }
    }
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_success_threshold() -> u32 {
    2
}

const fn default_open_timeout() -> f64 {
    30.0
}

const fn default_half_open_requests() -> u32 {
    1
}

/// A token-bucket rule: refill rate in tokens/second and bucket capacity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateRule {
    pub rate: f64,
    pub burst: f64,
}

/// Rate limiting across the three admission scopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_global_rule")]
    pub global: RateRule,
    /// Per-provider rules keyed by provider id; a provider with no rule is
    /// admitted by default.
    #[serde(default)]
    pub per_provider: HashMap<String, RateRule>,
    #[serde(default = "default_ip_rule")]
    pub per_ip: RateRule,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global: default_global_rule(),
            per_provider: HashMap::new(),
            per_ip: default_ip_rule(),
        }
    }
}

const fn default_global_rule() -> RateRule {
    RateRule { rate: 50.0, burst: 100.0 }
}

const fn default_ip_rule() -> RateRule {
    RateRule { rate: 20.0, burst: 40.0 }
}

/// Body-size and cache limits for the proxy path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProxyLimits {
    /// Largest inbound request body forwarded upstream, in bytes.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    /// Freshness window for cached responses, in seconds. Entries remain
    /// eligible for stale fallback until twice this age.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: f64,
    /// Largest response body eligible for caching, in bytes.
    #[serde(default = "default_cache_max_body_size")]
    pub cache_max_body_size: usize,
}

impl Default for ProxyLimits {
    fn default() -> Self {
        Self {
            max_body_size: default_max_body_size(),
            cache_ttl: default_cache_ttl(),
            cache_max_body_size: default_cache_max_body_size(),
        }
    }
}

const fn default_max_body_size() -> usize {
    10 * 1024 * 1024
}

const fn default_cache_ttl() -> f64 {
    300.0
}

const fn default_cache_max_body_size() -> usize {
    1024 * 1024
}

/// What the structured event log is allowed to show.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Bodies longer than this are truncated in events, in bytes.
    #[serde(default = "default_log_max_body")]
    pub max_body_size: usize,
    /// Header names (lower-cased compare) replaced by a sentinel in events.
    #[serde(default = "default_sensitive_headers")]
    pub sensitive_headers: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            max_body_size: default_log_max_body(),
            sensitive_headers: default_sensitive_headers(),
        }
    }
}

const fn default_log_max_body() -> usize {
    2048
}

fn default_sensitive_headers() -> Vec<String> {
    ["authorization", "proxy-authorization", "x-api-key", "api-key", "cookie", "set-cookie"]
        .into_iter()
        .map(str::to_string)
        .collect()
}
