//! Read-through response cache with stale fallback.
//!
//! Only safe methods (GET/HEAD) with 2xx or 404 upstream status and a
//! bounded body are cached. Two read windows over the same record:
//!
//! - **fresh** (age ≤ ttl): served before contacting upstream while the
//!   provider's breaker is closed;
//! - **stale** (age ≤ 2×ttl): served as a degraded fallback when the
//!   breaker denies or the upstream attempt ultimately fails.
//!
//! Records are stored with a physical expiry of 2×ttl; freshness inside
//! that window is judged by the `cached_at` timestamp so the stale window
//! survives the fresh one. Cache failures never surface: a malformed or
//! oversize entry logs at debug and the request proceeds to upstream.

use crate::store::{wall_clock_seconds, Store};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
struct CacheRecord {
    status: u16,
    body_b64: String,
    content_type: Option<String>,
    cached_at: f64,
}

/// A cached upstream response plus its age in seconds.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub body: Bytes,
    pub content_type: Option<String>,
    pub age: f64,
}

pub struct ResponseCache {
    store: Arc<Store>,
    ttl: f64,
    max_body_size: usize,
}

impl ResponseCache {
    pub fn new(store: Arc<Store>, ttl: f64, max_body_size: usize) -> Self {
        Self { store, ttl, max_body_size }
    }

    /// Whether a response with this shape may be stored.
    pub fn is_cacheable(&self, method: &str, status: u16, body_len: usize) -> bool {
        matches!(method, "GET" | "HEAD")
            && ((200..300).contains(&status) || status == 404)
            && body_len <= self.max_body_size
    }

    /// Entry younger than the ttl, or nothing.
    pub async fn fresh_read(
        &self,
        provider: &str,
        method: &str,
        path: &str,
        query: Option<&str>,
    ) -> Option<CachedResponse> {
        self.read(provider, method, path, query, self.ttl).await
    }

    /// Entry younger than twice the ttl, or nothing. Responses served from
    /// this window carry the degraded marker.
    pub async fn stale_read(
        &self,
        provider: &str,
        method: &str,
        path: &str,
        query: Option<&str>,
    ) -> Option<CachedResponse> {
        self.read(provider, method, path, query, self.ttl * 2.0).await
    }

    async fn read(
        &self,
        provider: &str,
        method: &str,
        path: &str,
        query: Option<&str>,
        max_age: f64,
    ) -> Option<CachedResponse> {
        let key = cache_key(provider, method, path, query);
        let raw = self.store.get(&key).await.ok().flatten()?;

        let record: CacheRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(err) => {
                tracing::debug!(key, error = %err, "discarding malformed cache record");
                return None;
            }
        };

        let age = wall_clock_seconds() - record.cached_at;
        if age > max_age {
            return None;
        }

        let body = match BASE64.decode(&record.body_b64) {
            Ok(body) => Bytes::from(body),
            Err(err) => {
                tracing::debug!(key, error = %err, "discarding undecodable cache body");
                return None;
            }
        };

        Some(CachedResponse {
            status: record.status,
            body,
            content_type: record.content_type,
            age: age.max(0.0),
        })
    }

    /// Store a response if it is eligible. Errors are swallowed; caching
    /// is best-effort.
    pub async fn store_response(
        &self,
        provider: &str,
        method: &str,
        path: &str,
        query: Option<&str>,
        status: u16,
        body: &Bytes,
        content_type: Option<&str>,
    ) {
        if !self.is_cacheable(method, status, body.len()) {
            return;
        }

        let record = CacheRecord {
            status,
            body_b64: BASE64.encode(body),
            content_type: content_type.map(str::to_string),
            cached_at: wall_clock_seconds(),
        };

        let raw = match serde_json::to_string(&record) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::debug!(error = %err, "cache record serialization failed");
                return;
            }
        };

        let key = cache_key(provider, method, path, query);
        let physical_ttl = Duration::from_secs_f64((self.ttl * 2.0).max(1.0));
        if let Err(err) = self.store.setex(&key, &raw, physical_ttl).await {
            tracing::debug!(key, error = %err, "cache write failed");
        }
    }
}

/// `cache:{provider}:{METHOD}:{path}[?{query}]`, the shared namespace all
/// instances key on.
fn cache_key(provider: &str, method: &str, path: &str, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("cache:{provider}:{method}:{path}?{q}"),
        _ => format!("cache:{provider}:{method}:{path}"),
    }
}
