//! In-process metrics registry.
//!
//! Counters and gauges keyed by label tuples, held in lock-free maps and
//! atomics; the `/metrics` endpoint renders them in Prometheus text
//! exposition format under the `api_proxy_` prefix. The series names are
//! ABI for the dashboards that scrape them; in particular
//! `api_proxy_requests_total` and `api_proxy_latency_avg_ms` must keep
//! their names.
//!
//! Latency percentiles are derived by a linear scan over the bucket CDF
//! and reported as the containing bucket's upper bound (saturating at
//! 1000 ms). Consumers should treat them as approximations.

use dashmap::DashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Upper bounds of the latency histogram, in milliseconds. The final
/// bucket is unbounded.
pub const LATENCY_BUCKETS_MS: [u64; 5] = [10, 50, 100, 500, 1000];

#[derive(Default)]
struct ProviderMetrics {
    by_method: DashMap<String, u64>,
    by_status: DashMap<(String, u16), u64>,
    success_total: AtomicU64,
    failure_total: AtomicU64,
    errors: DashMap<&'static str, u64>,
    /// One slot per bound in [`LATENCY_BUCKETS_MS`] plus the overflow slot.
    latency_buckets: [AtomicU64; 6],
    latency_sum_ms: AtomicU64,
    latency_count: AtomicU64,
    active_connections: AtomicI64,
    health: AtomicU64,
}

#[derive(Default)]
pub struct MetricsRegistry {
    providers: DashMap<String, ProviderMetrics>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished request.
    pub fn record_request(
        &self,
        provider: &str,
        method: &str,
        status: u16,
        error_type: Option<&'static str>,
        latency_ms: u64,
    ) {
        let entry = self.providers.entry(provider.to_string()).or_default();

        *entry.by_method.entry(method.to_string()).or_insert(0) += 1;
        *entry.by_status.entry((method.to_string(), status)).or_insert(0) += 1;

        if (200..400).contains(&status) {
            entry.success_total.fetch_add(1, Ordering::Relaxed);
        } else {
            entry.failure_total.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(error_type) = error_type {
            *entry.errors.entry(error_type).or_insert(0) += 1;
        }

        let slot = LATENCY_BUCKETS_MS
            .iter()
            .position(|bound| latency_ms < *bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        entry.latency_buckets[slot].fetch_add(1, Ordering::Relaxed);
        entry.latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        entry.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self, provider: &str) {
        self.providers
            .entry(provider.to_string())
            .or_default()
            .active_connections
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self, provider: &str) {
        if let Some(entry) = self.providers.get(provider) {
            entry.active_connections.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Health gauge per provider: 1 closed, 0.5 half-open, 0 open.
    /// Stored ×100 so the slot can stay an integer atomic.
    pub fn set_provider_health(&self, provider: &str, health: f64) {
        self.providers
            .entry(provider.to_string())
            .or_default()
            .health
            .store((health * 100.0) as u64, Ordering::Relaxed);
    }

    /// Approximate percentile in milliseconds for one provider: the upper
    /// bound of the bucket containing the quantile, saturating at 1000.
    pub fn latency_percentile(&self, provider: &str, quantile: f64) -> Option<u64> {
        let entry = self.providers.get(provider)?;
        let counts: Vec<u64> =
            entry.latency_buckets.iter().map(|b| b.load(Ordering::Relaxed)).collect();
        percentile_from_buckets(&counts, quantile)
    }

    /// Render every series in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(4096);

        let _ = writeln!(out, "# HELP api_proxy_requests_total Total requests by provider and method");
        let _ = writeln!(out, "# TYPE api_proxy_requests_total counter");
        for entry in self.providers.iter() {
            let provider = entry.key();
            for method in entry.by_method.iter() {
                let _ = writeln!(
                    out,
                    "api_proxy_requests_total{{provider=\"{provider}\",method=\"{}\"}} {}",
                    method.key(),
                    method.value()
                );
            }
        }

        let _ = writeln!(out, "# TYPE api_proxy_requests_by_status counter");
        for entry in self.providers.iter() {
            let provider = entry.key();
            for status in entry.by_status.iter() {
                let (method, code) = status.key();
                let _ = writeln!(
                    out,
                    "api_proxy_requests_by_status{{provider=\"{provider}\",method=\"{method}\",status=\"{code}\"}} {}",
                    status.value()
                );
            }
        }

        let _ = writeln!(out, "# TYPE api_proxy_requests_success_total counter");
        let _ = writeln!(out, "# TYPE api_proxy_requests_failure_total counter");
        for entry in self.providers.iter() {
            let provider = entry.key();
            let _ = writeln!(
                out,
                "api_proxy_requests_success_total{{provider=\"{provider}\"}} {}",
                entry.success_total.load(Ordering::Relaxed)
            );
            let _ = writeln!(
                out,
                "api_proxy_requests_failure_total{{provider=\"{provider}\"}} {}",
                entry.failure_total.load(Ordering::Relaxed)
            );
        }

        let _ = writeln!(out, "# TYPE api_proxy_requests_error_total counter");
        for entry in self.providers.iter() {
            let provider = entry.key();
            for error in entry.errors.iter() {
                let _ = writeln!(
                    out,
                    "api_proxy_requests_error_total{{provider=\"{provider}\",error_type=\"{}\"}} {}",
                    error.key(),
                    error.value()
                );
            }
        }

        let _ = writeln!(out, "# TYPE api_proxy_latency_bucket counter");
        for entry in self.providers.iter() {
            let provider = entry.key();
            let mut cumulative = 0u64;
            for (idx, bound) in LATENCY_BUCKETS_MS.iter().enumerate() {
                cumulative += entry.latency_buckets[idx].load(Ordering::Relaxed);
                let _ = writeln!(
                    out,
                    "api_proxy_latency_bucket{{provider=\"{provider}\",le=\"{bound}\"}} {cumulative}"
                );
            }
            cumulative += entry.latency_buckets[LATENCY_BUCKETS_MS.len()].load(Ordering::Relaxed);
            let _ = writeln!(
                out,
                "api_proxy_latency_bucket{{provider=\"{provider}\",le=\"+Inf\"}} {cumulative}"
            );
        }

        let _ = writeln!(out, "# TYPE api_proxy_latency_sum_ms counter");
        let _ = writeln!(out, "# TYPE api_proxy_latency_count counter");
        let _ = writeln!(out, "# TYPE api_proxy_latency_avg_ms gauge");
        for entry in self.providers.iter() {
            let provider = entry.key();
            let sum = entry.latency_sum_ms.load(Ordering::Relaxed);
            let count = entry.latency_count.load(Ordering::Relaxed);
            let avg = if count > 0 { sum as f64 / count as f64 } else { 0.0 };
            let _ = writeln!(out, "api_proxy_latency_sum_ms{{provider=\"{provider}\"}} {sum}");
            let _ = writeln!(out, "api_proxy_latency_count{{provider=\"{provider}\"}} {count}");
            let _ = writeln!(out, "api_proxy_latency_avg_ms{{provider=\"{provider}\"}} {avg:.2}");
        }

        let _ = writeln!(out, "# TYPE api_proxy_latency_percentile_ms gauge");
        for entry in self.providers.iter() {
            let provider = entry.key();
            let counts: Vec<u64> =
                entry.latency_buckets.iter().map(|b| b.load(Ordering::Relaxed)).collect();
            for (label, quantile) in [("p50", 0.50), ("p95", 0.95), ("p99", 0.99)] {
                if let Some(value) = percentile_from_buckets(&counts, quantile) {
                    let _ = writeln!(
                        out,
                        "api_proxy_latency_percentile_ms{{provider=\"{provider}\",quantile=\"{label}\"}} {value}"
                    );
                }
            }
        }

        let _ = writeln!(out, "# TYPE api_proxy_active_connections gauge");
        let _ = writeln!(out, "# TYPE api_proxy_provider_health gauge");
        for entry in self.providers.iter() {
            let provider = entry.key();
            let _ = writeln!(
                out,
                "api_proxy_active_connections{{provider=\"{provider}\"}} {}",
                entry.active_connections.load(Ordering::Relaxed)
            );
            let _ = writeln!(
                out,
                "api_proxy_provider_health{{provider=\"{provider}\"}} {}",
                entry.health.load(Ordering::Relaxed) as f64 / 100.0
            );
        }

        out
    }
}

/// Linear scan over the bucket CDF: the upper bound of the bucket where
/// the cumulative count crosses the quantile. The overflow bucket reports
/// the last finite bound.
fn percentile_from_buckets(counts: &[u64], quantile: f64) -> Option<u64> {
    let total: u64 = counts.iter().sum();
    if total == 0 {
        return None;
    }
    let target = (total as f64 * quantile).ceil() as u64;
    let mut cumulative = 0u64;
    for (idx, count) in counts.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return Some(
                LATENCY_BUCKETS_MS
                    .get(idx)
                    .copied()
                    .unwrap_or(LATENCY_BUCKETS_MS[LATENCY_BUCKETS_MS.len() - 1]),
            );
        }
    }
    Some(LATENCY_BUCKETS_MS[LATENCY_BUCKETS_MS.len() - 1])
}
