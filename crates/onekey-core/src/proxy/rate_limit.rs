//! Token-bucket rate limiting over three admission scopes.
//!
//! Bucket state lives in the store under `ratelimit:{scope}:{id}` and is
//! mutated only by the atomic `RateLimitCheck` script, so concurrent
//! requests (including requests on other gateway instances sharing the
//! same Redis) agree on the token count. A denied request does not touch
//! the bucket.

use crate::store::{wall_clock_seconds, Script, Store};
use onekey_types::{RateLimitConfig, RateRule};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Which bucket denied (or would be charged for) a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateScope {
    Global,
    Provider,
    ClientIp,
}

impl RateScope {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Provider => "provider",
            Self::ClientIp => "ip",
        }
    }
}

/// Outcome of one bucket check.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub burst: f64,
    pub used: f64,
}

/// Point-in-time consumption of one bucket, for the admin endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BucketStats {
    pub used: f64,
    pub burst: f64,
    pub rate: f64,
}

pub struct RateLimiter {
    store: Arc<Store>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<Store>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    /// Run one bucket check. Buckets materialize full on first sight and
    /// re-materialize full after 60 s idle (the record expires).
    pub async fn check(
        &self,
        scope: RateScope,
        identifier: &str,
        rule: RateRule,
    ) -> RateDecision {
        let key = bucket_key(scope, identifier);
        let now = wall_clock_seconds();
        let reply = self
            .store
            .eval(
                Script::RateLimitCheck,
                &[key],
                &[rule.rate.to_string(), rule.burst.to_string(), now.to_string()],
            )
            .await;

        match reply {
            Ok(reply) => {
                let allowed = reply.first().map(String::as_str) == Some("1");
                let used = reply
                    .get(1)
                    .and_then(|v| v.parse::<f64>().ok())
                    .unwrap_or(if allowed { 0.0 } else { rule.burst });
                RateDecision { allowed, burst: rule.burst, used }
            }
            Err(err) => {
                // Admission control must not become an outage amplifier.
                tracing::warn!(scope = scope.as_str(), error = %err, "rate check failed open");
                RateDecision { allowed: true, burst: rule.burst, used: 0.0 }
            }
        }
    }

    /// Apply the configured scopes in order (global → provider → ip) and
    /// return the first denying scope, if any. A provider with no
    /// configured rule is admitted by default.
    pub async fn check_request(&self, provider_id: &str, client_ip: &str) -> Option<RateScope> {
        let decision = self.check(RateScope::Global, "global", self.config.global).await;
        if !decision.allowed {
            return Some(RateScope::Global);
        }

        if let Some(rule) = self.config.per_provider.get(provider_id) {
            let decision = self.check(RateScope::Provider, provider_id, *rule).await;
            if !decision.allowed {
                return Some(RateScope::Provider);
            }
        }

        let decision = self.check(RateScope::ClientIp, client_ip, self.config.per_ip).await;
        if !decision.allowed {
            return Some(RateScope::ClientIp);
        }

        None
    }

    /// Current consumption per scope, computed read-only (no token is
    /// charged and no refill is persisted).
    pub async fn stats(&self, provider_ids: &[String]) -> RateLimitStats {
        let global = self.peek(RateScope::Global, "global", self.config.global).await;
        let mut per_provider = HashMap::new();
        for id in provider_ids {
            if let Some(rule) = self.config.per_provider.get(id) {
                per_provider.insert(id.clone(), self.peek(RateScope::Provider, id, *rule).await);
            }
        }
        RateLimitStats { global, per_provider }
    }

    async fn peek(&self, scope: RateScope, identifier: &str, rule: RateRule) -> BucketStats {
        let key = bucket_key(scope, identifier);
        let now = wall_clock_seconds();
        let tokens = match self.store.get(&key).await {
            Ok(Some(raw)) => raw
                .split_once(':')
                .and_then(|(tokens, last)| {
                    let tokens = tokens.parse::<f64>().ok()?;
                    let last = last.parse::<f64>().ok()?;
                    Some((tokens + (now - last).max(0.0) * rule.rate).min(rule.burst))
                })
                .unwrap_or(rule.burst),
            _ => rule.burst,
        };
        BucketStats { used: (rule.burst - tokens).max(0.0), burst: rule.burst, rate: rule.rate }
    }
}

/// Per-scope consumption snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStats {
    pub global: BucketStats,
    pub per_provider: HashMap<String, BucketStats>,
}

fn bucket_key(scope: RateScope, identifier: &str) -> String {
    let escaped = utf8_percent_encode(identifier, NON_ALPHANUMERIC);
    format!("ratelimit:{}:{}", scope.as_str(), escaped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use onekey_types::RateLimitConfig;

    fn limiter(config: RateLimitConfig) -> RateLimiter {
        RateLimiter::new(Arc::new(Store::local_only()), config)
    }

    #[tokio::test]
    async fn global_denial_short_circuits() {
        let config = RateLimitConfig {
            global: RateRule { rate: 0.0, burst: 1.0 },
            ..RateLimitConfig::default()
        };
        let limiter = limiter(config);

        assert_eq!(limiter.check_request("zerion", "10.0.0.1").await, None);
        assert_eq!(
            limiter.check_request("zerion", "10.0.0.1").await,
            Some(RateScope::Global)
        );
    }

    #[tokio::test]
    async fn provider_without_rule_admits() {
        let config = RateLimitConfig {
            global: RateRule { rate: 100.0, burst: 100.0 },
            per_ip: RateRule { rate: 100.0, burst: 100.0 },
            ..RateLimitConfig::default()
        };
        let limiter = limiter(config);
        assert_eq!(limiter.check_request("unconfigured", "10.0.0.1").await, None);
    }

    #[tokio::test]
    async fn per_ip_buckets_are_independent() {
        let mut config = RateLimitConfig {
            global: RateRule { rate: 100.0, burst: 100.0 },
            per_ip: RateRule { rate: 0.0, burst: 1.0 },
            ..RateLimitConfig::default()
        };
        config.per_provider.clear();
        let limiter = limiter(config);

        assert_eq!(limiter.check_request("p", "10.0.0.1").await, None);
        assert_eq!(limiter.check_request("p", "10.0.0.2").await, None);
        assert_eq!(limiter.check_request("p", "10.0.0.1").await, Some(RateScope::ClientIp));
    }

    #[tokio::test]
    async fn ipv6_identifiers_escape_into_the_key() {
        let key = bucket_key(RateScope::ClientIp, "2001:db8::1");
        assert!(!key["ratelimit:ip:".len()..].contains(':'));
    }

    #[tokio::test]
    async fn stats_peek_does_not_consume() {
        let config = RateLimitConfig {
            global: RateRule { rate: 0.0, burst: 2.0 },
            ..RateLimitConfig::default()
        };
        let limiter = limiter(config);
        limiter.check(RateScope::Global, "global", limiter.config.global).await;

        let stats = limiter.stats(&[]).await;
        assert!((stats.global.used - 1.0).abs() < 1e-6);
        // Peeking twice reports the same consumption.
        let stats = limiter.stats(&[]).await;
        assert!((stats.global.used - 1.0).abs() < 1e-6);
    }
}
