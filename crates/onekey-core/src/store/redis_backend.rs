//! Redis backend.
//!
//! Holds `pool_size` multiplexed connection managers and round-robins
//! across them. Every operation runs under the configured deadline; a
//! deadline miss surfaces as [`StoreError::Timeout`] so the facade can
//! degrade that call to the local backend.

use super::scripts::Script;
use super::KvBackend;
use async_trait::async_trait;
use onekey_types::{RedisConfig, StoreError};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

// TODO: plumb tcp keepalive (config.keepalive_secs) once redis-rs exposes
// socket options on ConnectionManager.
pub struct RedisBackend {
    connections: Vec<ConnectionManager>,
    next: AtomicUsize,
    op_timeout: Duration,
}

impl RedisBackend {
    pub async fn connect(config: &RedisConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.url())
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let mut connections = Vec::with_capacity(config.pool_size);
        for _ in 0..config.pool_size.max(1) {
            let conn = tokio::time::timeout(
                Duration::from_millis(config.timeout_ms),
                client.get_connection_manager(),
            )
            .await
            .map_err(|_| StoreError::Timeout(Duration::from_millis(config.timeout_ms)))?
            .map_err(map_redis_err)?;
            connections.push(conn);
        }

        Ok(Self {
            connections,
            next: AtomicUsize::new(0),
            op_timeout: Duration::from_millis(config.timeout_ms),
        })
    }

    fn connection(&self) -> ConnectionManager {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        self.connections[idx].clone()
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        tokio::time::timeout(self.op_timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout(self.op_timeout))?
            .map_err(map_redis_err)
    }
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection();
        self.bounded(async move { conn.get(key).await }).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.connection();
        match ttl {
            Some(ttl) => {
                let secs = ttl.as_secs().max(1);
                self.bounded(async move { conn.set_ex(key, value, secs).await }).await
            }
            None => self.bounded(async move { conn.set(key, value).await }).await,
        }
    }

    async fn setex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.set(key, value, Some(ttl)).await
    }

    async fn incr_by(&self, key: &str, delta: i64, default: i64) -> Result<i64, StoreError> {
        // SET NX seeds the default atomically before the increment.
        let mut conn = self.connection();
        self.bounded(async move {
            let _: bool = redis::cmd("SET")
                .arg(key)
                .arg(default)
                .arg("NX")
                .query_async(&mut conn)
                .await?;
            conn.incr(key, delta).await
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection();
        self.bounded(async move { conn.del(key).await }).await
    }

    async fn eval(
        &self,
        script: Script,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection();
        let script = redis::Script::new(script.lua());
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(key.as_str());
        }
        for arg in args {
            invocation.arg(arg.as_str());
        }
        self.bounded(async move { invocation.invoke_async(&mut conn).await }).await
    }
}

fn map_redis_err(err: redis::RedisError) -> StoreError {
    if err.kind() == redis::ErrorKind::AuthenticationFailed {
        StoreError::AuthFailed(err.to_string())
    } else if err.is_timeout() {
        StoreError::Timeout(Duration::ZERO)
    } else if matches!(
        err.kind(),
        redis::ErrorKind::NoScriptError | redis::ErrorKind::ExtensionError
    ) {
        StoreError::Script(err.to_string())
    } else {
        StoreError::Connection(err.to_string())
    }
}
