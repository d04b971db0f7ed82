//! Key/value coordination substrate.
//!
//! A narrow interface with two implementations:
//!
//! - [`LocalBackend`]: an in-process map; scripts run under one mutex so
//!   multi-key operations are atomic.
//! - [`RedisBackend`]: Redis with the same operations, scripts executed
//!   server-side as Lua so multiple gateway instances agree.
//!
//! [`Store`] is the facade callers use. When Redis is enabled it is tried
//! first; any Redis error degrades *that single call* to the local backend
//! with a warning. A logical operation is never split across backends.
//!
//! Both backends must produce byte-identical stored values (bucket records
//! are `"{tokens:.6}:{last:.6}"` in both) so that degradation mid-lifetime
//! does not corrupt live state.

mod local;
mod redis_backend;
mod scripts;

pub use local::LocalBackend;
pub use redis_backend::RedisBackend;
pub use scripts::Script;

use async_trait::async_trait;
use onekey_types::{RedisConfig, StoreError};
use std::time::Duration;

/// The operations every backend implements.
///
/// `eval` runs one of the fixed catalogue of atomic scripts in
/// [`Script`]; arbitrary scripts are not accepted.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;
    async fn setex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;
    /// Increment by `delta`, initializing an absent key to `default` first.
    async fn incr_by(&self, key: &str, delta: i64, default: i64) -> Result<i64, StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    async fn eval(
        &self,
        script: Script,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<String>, StoreError>;
}

/// Degrading facade over the two backends.
pub struct Store {
    local: LocalBackend,
    redis: Option<RedisBackend>,
}

impl Store {
    /// Local-only store (Redis disabled).
    pub fn local_only() -> Self {
        Self { local: LocalBackend::new(), redis: None }
    }

    /// Connect the Redis backend if enabled; a connection failure at
    /// startup logs a warning and leaves the store local-only rather than
    /// failing the boot.
    pub async fn connect(config: &RedisConfig) -> Self {
        if !config.enabled {
            return Self::local_only();
        }
        match RedisBackend::connect(config).await {
            Ok(redis) => {
                tracing::info!(host = %config.host, port = config.port, "redis backend connected");
                Self { local: LocalBackend::new(), redis: Some(redis) }
            }
            Err(err) => {
                tracing::warn!(error = %err, "redis unavailable at startup, running local-only");
                Self::local_only()
            }
        }
    }

    pub fn is_distributed(&self) -> bool {
        self.redis.is_some()
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        if let Some(redis) = &self.redis {
            match redis.get(key).await {
                Ok(v) => return Ok(v),
                Err(err) => Self::warn_degraded("get", key, &err),
            }
        }
        self.local.get(key).await
    }

    pub async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        if let Some(redis) = &self.redis {
            match redis.set(key, value, ttl).await {
                Ok(()) => return Ok(()),
                Err(err) => Self::warn_degraded("set", key, &err),
            }
        }
        self.local.set(key, value, ttl).await
    }

    pub async fn setex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        if let Some(redis) = &self.redis {
            match redis.setex(key, value, ttl).await {
                Ok(()) => return Ok(()),
                Err(err) => Self::warn_degraded("setex", key, &err),
            }
        }
        self.local.setex(key, value, ttl).await
    }

    pub async fn incr_by(&self, key: &str, delta: i64, default: i64) -> Result<i64, StoreError> {
        if let Some(redis) = &self.redis {
            match redis.incr_by(key, delta, default).await {
                Ok(v) => return Ok(v),
                Err(err) => Self::warn_degraded("incr_by", key, &err),
            }
        }
        self.local.incr_by(key, delta, default).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        if let Some(redis) = &self.redis {
            match redis.delete(key).await {
                Ok(()) => return Ok(()),
                Err(err) => Self::warn_degraded("delete", key, &err),
            }
        }
        self.local.delete(key).await
    }

    pub async fn eval(
        &self,
        script: Script,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<String>, StoreError> {
        if let Some(redis) = &self.redis {
            match redis.eval(script, keys, args).await {
                Ok(v) => return Ok(v),
                Err(err) => {
                    tracing::warn!(
                        script = script.name(),
                        error = %err,
                        "distributed eval failed, degrading to local backend"
                    );
                }
            }
        }
        self.local.eval(script, keys, args).await
    }

    fn warn_degraded(op: &str, key: &str, err: &StoreError) {
        tracing::warn!(op, key, error = %err, "distributed call failed, degrading to local backend");
    }
}

/// Wall-clock seconds with fractional precision.
///
/// One timestamp is taken per logical operation and passed into the script
/// so both backends (and both sides of a degradation) compute against the
/// same instant.
pub fn wall_clock_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
