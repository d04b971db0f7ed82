//! Per-provider circuit breaker.
//!
//! Three states:
//! - **Closed**: normal operation, requests pass through.
//! - **Open**: the provider is failing; requests are denied until the
//!   timeout elapses.
//! - **HalfOpen**: a bounded number of probe requests test recovery.
//!
//! The transition table is encoded once, in the four store scripts
//! (`CbAllow`, `CbRecordSuccess`, `CbRecordFailure`, `CbReleaseHalfOpen`),
//! so every gateway instance sharing the store observes identical
//! transitions. This module wraps the scripts, supplies the timestamp, and
//! logs state changes.
//!
//! `release_half_open_slot` is deliberately separate from outcome
//! recording: it runs on *every* exit path of an admitted request, and is
//! a no-op unless the breaker is still half-open with a positive slot
//! count (a failure that reopened the breaker already reset the counter).

#[cfg(test)]
mod tests;

use crate::store::{wall_clock_seconds, Script, Store};
use onekey_types::CircuitBreakerConfig;
use serde::Serialize;
use std::sync::Arc;

/// State of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "open" => Self::Open,
            "half_open" => Self::HalfOpen,
            _ => Self::Closed,
        }
    }

    /// Health gauge value exported for this state.
    pub const fn health_value(self) -> f64 {
        match self {
            Self::Closed => 1.0,
            Self::HalfOpen => 0.5,
            Self::Open => 0.0,
        }
    }
}

/// Snapshot of one provider's breaker record, for the admin endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub failures: u64,
    pub successes: u64,
    pub last_failure: f64,
    pub half_open_requests: u64,
}

pub struct CircuitBreaker {
    store: Arc<Store>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(store: Arc<Store>, config: CircuitBreakerConfig) -> Self {
        Self { store, config }
    }

    /// Whether a request may proceed. May itself perform the
    /// OPEN→HALF_OPEN transition when the open timeout has elapsed.
    pub async fn allow_request(&self, provider: &str) -> (bool, CircuitState) {
        let now = wall_clock_seconds();
        let reply = self
            .store
            .eval(
                Script::CbAllow,
                &breaker_keys(provider),
                &[
                    self.config.timeout_seconds.to_string(),
                    self.config.half_open_requests.to_string(),
                    now.to_string(),
                ],
            )
            .await;

        match reply {
            Ok(reply) => {
                let allowed = reply.first().map(String::as_str) == Some("1");
                let state =
                    CircuitState::parse(reply.get(1).map(String::as_str).unwrap_or("closed"));
                if allowed && state == CircuitState::HalfOpen {
                    tracing::debug!(provider, "probe admitted in half-open state");
                }
                (allowed, state)
            }
            Err(err) => {
                tracing::warn!(provider, error = %err, "breaker allow failed open");
                (true, CircuitState::Closed)
            }
        }
    }

    pub async fn record_success(&self, provider: &str) {
        let reply = self
            .store
            .eval(
                Script::CbRecordSuccess,
                &breaker_keys(provider),
                &[self.config.success_threshold.to_string()],
            )
            .await;

        if let Ok(reply) = reply {
            if transition(&reply) == Some((CircuitState::HalfOpen, CircuitState::Closed)) {
                tracing::info!(provider, "circuit breaker closing, provider recovered");
            }
        }
    }

    pub async fn record_failure(&self, provider: &str) {
        let now = wall_clock_seconds();
        let reply = self
            .store
            .eval(
                Script::CbRecordFailure,
                &breaker_keys(provider),
                &[self.config.failure_threshold.to_string(), now.to_string()],
            )
            .await;

        if let Ok(reply) = reply {
            match transition(&reply) {
                Some((CircuitState::Closed, CircuitState::Open)) => {
                    tracing::warn!(
                        provider,
                        failures = self.config.failure_threshold,
                        "circuit breaker opening, too many failures"
                    );
                }
                Some((CircuitState::HalfOpen, CircuitState::Open)) => {
                    tracing::warn!(provider, "circuit breaker re-opening, probe failed");
                }
                _ => {}
            }
        }
    }

    /// Release a half-open probe slot. Runs unconditionally on every exit
    /// path of an admitted request; decrements only while half-open with a
    /// positive count.
    pub async fn release_half_open_slot(&self, provider: &str) {
        let _ = self
            .store
            .eval(Script::CbReleaseHalfOpen, &breaker_keys(provider), &[])
            .await;
    }

    /// Current state without any side effects.
    pub async fn state(&self, provider: &str) -> CircuitState {
        match self.store.get(&format!("cb:state:{provider}")).await {
            Ok(Some(raw)) => CircuitState::parse(&raw),
            _ => CircuitState::Closed,
        }
    }

    /// Full record snapshot for the admin endpoint.
    pub async fn stats(&self, provider: &str) -> BreakerStats {
        let get_u64 = |v: Option<String>| v.and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
        let keys = breaker_keys(provider);

        BreakerStats {
            state: self.state(provider).await,
            failures: get_u64(self.store.get(&keys[1]).await.unwrap_or(None)),
            successes: get_u64(self.store.get(&keys[2]).await.unwrap_or(None)),
            last_failure: self
                .store
                .get(&keys[3])
                .await
                .unwrap_or(None)
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0),
            half_open_requests: get_u64(self.store.get(&keys[4]).await.unwrap_or(None)),
        }
    }
}

/// The five keys of one provider's breaker record, in script order.
fn breaker_keys(provider: &str) -> Vec<String> {
    vec![
        format!("cb:state:{provider}"),
        format!("cb:failures:{provider}"),
        format!("cb:success:{provider}"),
        format!("cb:last_failure:{provider}"),
        format!("cb:half_open_count:{provider}"),
    ]
}

fn transition(reply: &[String]) -> Option<(CircuitState, CircuitState)> {
    let prev = CircuitState::parse(reply.first()?);
    let next = CircuitState::parse(reply.get(1)?);
    (prev != next).then_some((prev, next))
}
