//! Process-local backend.
//!
//! One mutex guards the whole map; every operation, including multi-key
//! scripts, runs under it. That mirrors the atomicity Redis gives scripts
//! server-side, so the two backends cannot diverge under concurrency.

use super::scripts::{Script, BUCKET_IDLE_TTL_SECS};
use super::KvBackend;
use async_trait::async_trait;
use onekey_types::StoreError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

/// In-process KV backend.
pub struct LocalBackend {
    map: Mutex<HashMap<String, Entry>>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self { map: Mutex::new(HashMap::new()) }
    }

    fn read(map: &mut HashMap<String, Entry>, key: &str) -> Option<String> {
        match map.get(key) {
            Some(entry) if entry.live() => Some(entry.value.clone()),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    fn write(map: &mut HashMap<String, Entry>, key: &str, value: String, ttl: Option<Duration>) {
        map.insert(
            key.to_string(),
            Entry { value, expires_at: ttl.map(|t| Instant::now() + t) },
        );
    }

    fn run_script(
        map: &mut HashMap<String, Entry>,
        script: Script,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<String>, StoreError> {
        match script {
            Script::RateLimitCheck => {
                let rate = parse_f64(args, 0)?;
                let burst = parse_f64(args, 1)?;
                let now = parse_f64(args, 2)?;
                let bucket_key = script_key(keys, 0)?;

                let (mut tokens, last) = match Self::read(map, bucket_key) {
                    Some(raw) => parse_bucket(&raw)?,
                    None => (burst, now),
                };
                let elapsed = (now - last).max(0.0);
                tokens = (tokens + elapsed * rate).min(burst);
                if tokens >= 1.0 {
                    tokens -= 1.0;
                    Self::write(
                        map,
                        bucket_key,
                        format!("{tokens:.6}:{now:.6}"),
                        Some(Duration::from_secs(BUCKET_IDLE_TTL_SECS)),
                    );
                    Ok(vec!["1".into(), format!("{:.6}", burst - tokens)])
                } else {
                    Ok(vec!["0".into(), format!("{burst:.6}")])
                }
            }
            Script::CbAllow => {
                let timeout = parse_f64(args, 0)?;
                let half_open_max = parse_f64(args, 1)? as u64;
                let now = parse_f64(args, 2)?;
                let state = Self::read(map, script_key(keys, 0)?)
                    .unwrap_or_else(|| "closed".to_string());

                match state.as_str() {
                    "closed" => Ok(vec!["1".into(), "closed".into()]),
                    "open" => {
                        let last = Self::read(map, script_key(keys, 3)?)
                            .and_then(|v| v.parse::<f64>().ok())
                            .unwrap_or(0.0);
                        if now - last > timeout {
                            Self::write(map, script_key(keys, 0)?, "half_open".into(), None);
                            Self::write(map, script_key(keys, 2)?, "0".into(), None);
                            Self::write(map, script_key(keys, 4)?, "0".into(), None);
                            Ok(vec!["1".into(), "half_open".into()])
                        } else {
                            Ok(vec!["0".into(), "open".into()])
                        }
                    }
                    _ => {
                        let inflight = Self::read(map, script_key(keys, 4)?)
                            .and_then(|v| v.parse::<u64>().ok())
                            .unwrap_or(0);
                        if inflight < half_open_max {
                            Self::write(
                                map,
                                script_key(keys, 4)?,
                                (inflight + 1).to_string(),
                                None,
                            );
                            Ok(vec!["1".into(), "half_open".into()])
                        } else {
                            Ok(vec!["0".into(), "half_open".into()])
                        }
                    }
                }
            }
            Script::CbRecordSuccess => {
                let threshold = parse_f64(args, 0)? as u64;
                let state = Self::read(map, script_key(keys, 0)?)
                    .unwrap_or_else(|| "closed".to_string());

                match state.as_str() {
                    "closed" => {
                        Self::write(map, script_key(keys, 1)?, "0".into(), None);
                        Ok(vec!["closed".into(), "closed".into()])
                    }
                    "half_open" => {
                        let succ = Self::read(map, script_key(keys, 2)?)
                            .and_then(|v| v.parse::<u64>().ok())
                            .unwrap_or(0)
                            + 1;
                        if succ >= threshold {
                            Self::write(map, script_key(keys, 0)?, "closed".into(), None);
                            Self::write(map, script_key(keys, 1)?, "0".into(), None);
                            Self::write(map, script_key(keys, 2)?, "0".into(), None);
                            Self::write(map, script_key(keys, 4)?, "0".into(), None);
                            Ok(vec!["half_open".into(), "closed".into()])
                        } else {
                            Self::write(map, script_key(keys, 2)?, succ.to_string(), None);
                            Ok(vec!["half_open".into(), "half_open".into()])
                        }
                    }
                    _ => Ok(vec!["open".into(), "open".into()]),
                }
            }
            Script::CbRecordFailure => {
                let threshold = parse_f64(args, 0)? as u64;
                let now = args.get(1).cloned().unwrap_or_default();
                let state = Self::read(map, script_key(keys, 0)?)
                    .unwrap_or_else(|| "closed".to_string());

                match state.as_str() {
                    "half_open" => {
                        Self::write(map, script_key(keys, 0)?, "open".into(), None);
                        Self::write(map, script_key(keys, 3)?, now, None);
                        Self::write(map, script_key(keys, 4)?, "0".into(), None);
                        Ok(vec!["half_open".into(), "open".into()])
                    }
                    "closed" => {
                        let fails = Self::read(map, script_key(keys, 1)?)
                            .and_then(|v| v.parse::<u64>().ok())
                            .unwrap_or(0)
                            + 1;
                        Self::write(map, script_key(keys, 1)?, fails.to_string(), None);
                        if fails >= threshold {
                            Self::write(map, script_key(keys, 0)?, "open".into(), None);
                            Self::write(map, script_key(keys, 3)?, now, None);
                            Ok(vec!["closed".into(), "open".into()])
                        } else {
                            Ok(vec!["closed".into(), "closed".into()])
                        }
                    }
                    _ => Ok(vec!["open".into(), "open".into()]),
                }
            }
            Script::CbReleaseHalfOpen => {
                let state = Self::read(map, script_key(keys, 0)?)
                    .unwrap_or_else(|| "closed".to_string());
                if state == "half_open" {
                    let count = Self::read(map, script_key(keys, 4)?)
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(0);
                    if count > 0 {
                        Self::write(map, script_key(keys, 4)?, (count - 1).to_string(), None);
                    }
                }
                Ok(vec![state])
            }
        }
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvBackend for LocalBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(Self::read(&mut self.map.lock(), key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        Self::write(&mut self.map.lock(), key, value.to_string(), ttl);
        Ok(())
    }

    async fn setex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.set(key, value, Some(ttl)).await
    }

    async fn incr_by(&self, key: &str, delta: i64, default: i64) -> Result<i64, StoreError> {
        let mut map = self.map.lock();
        let current = Self::read(&mut map, key)
            .map(|raw| {
                raw.parse::<i64>()
                    .map_err(|_| StoreError::Malformed(format!("non-integer counter at {key}")))
            })
            .transpose()?
            .unwrap_or(default);
        let next = current + delta;
        Self::write(&mut map, key, next.to_string(), None);
        Ok(next)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.map.lock().remove(key);
        Ok(())
    }

    async fn eval(
        &self,
        script: Script,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<String>, StoreError> {
        Self::run_script(&mut self.map.lock(), script, keys, args)
    }
}

fn script_key<'a>(keys: &'a [String], idx: usize) -> Result<&'a str, StoreError> {
    keys.get(idx)
        .map(String::as_str)
        .ok_or_else(|| StoreError::Script(format!("missing KEYS[{}]", idx + 1)))
}

fn parse_f64(args: &[String], idx: usize) -> Result<f64, StoreError> {
    args.get(idx)
        .and_then(|v| v.parse::<f64>().ok())
        .ok_or_else(|| StoreError::Script(format!("missing or non-numeric ARGV[{}]", idx + 1)))
}

fn parse_bucket(raw: &str) -> Result<(f64, f64), StoreError> {
    let (tokens, last) = raw
        .split_once(':')
        .ok_or_else(|| StoreError::Malformed(format!("bucket record {raw:?}")))?;
    let tokens = tokens
        .parse::<f64>()
        .map_err(|_| StoreError::Malformed(format!("bucket tokens {tokens:?}")))?;
    let last = last
        .parse::<f64>()
        .map_err(|_| StoreError::Malformed(format!("bucket timestamp {last:?}")))?;
    Ok((tokens, last))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket_keys() -> Vec<String> {
        vec!["ratelimit:global:global".to_string()]
    }

    fn cb_keys() -> Vec<String> {
        ["state", "failures", "success", "last_failure", "half_open_count"]
            .iter()
            .map(|suffix| format!("cb:{suffix}:zerion"))
            .collect()
    }

    async fn check(backend: &LocalBackend, rate: f64, burst: f64, now: f64) -> (bool, f64) {
        let reply = backend
            .eval(
                Script::RateLimitCheck,
                &bucket_keys(),
                &[rate.to_string(), burst.to_string(), now.to_string()],
            )
            .await
            .unwrap();
        (reply[0] == "1", reply[1].parse().unwrap())
    }

    #[tokio::test]
    async fn bucket_admits_up_to_burst_then_denies() {
        let backend = LocalBackend::new();
        let now = 1000.0;
        for _ in 0..3 {
            let (allowed, _) = check(&backend, 0.0, 3.0, now).await;
            assert!(allowed);
        }
        let (allowed, used) = check(&backend, 0.0, 3.0, now).await;
        assert!(!allowed);
        assert!((used - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn bucket_refills_over_elapsed_time() {
        let backend = LocalBackend::new();
        let (allowed, _) = check(&backend, 2.0, 1.0, 1000.0).await;
        assert!(allowed);
        let (allowed, _) = check(&backend, 2.0, 1.0, 1000.0).await;
        assert!(!allowed);
        // 0.6s at 2 tokens/s recovers 1.2 tokens.
        let (allowed, _) = check(&backend, 2.0, 1.0, 1000.6).await;
        assert!(allowed);
    }

    #[tokio::test]
    async fn bucket_never_exceeds_burst() {
        let backend = LocalBackend::new();
        check(&backend, 100.0, 5.0, 1000.0).await;
        // A long idle period must clamp at burst, not accumulate.
        let (_, used) = check(&backend, 100.0, 5.0, 9999.0).await;
        assert!((used - 1.0).abs() < 1e-6, "bucket refilled past burst: used={used}");
    }

    #[tokio::test]
    async fn denial_leaves_bucket_state_untouched() {
        let backend = LocalBackend::new();
        check(&backend, 0.0, 1.0, 1000.0).await;
        let before = backend.get(&bucket_keys()[0]).await.unwrap();
        let (allowed, _) = check(&backend, 0.0, 1.0, 1000.5).await;
        assert!(!allowed);
        let after = backend.get(&bucket_keys()[0]).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn bucket_record_format_is_stable() {
        let backend = LocalBackend::new();
        check(&backend, 1.5, 10.0, 1234.5).await;
        let raw = backend.get(&bucket_keys()[0]).await.unwrap().unwrap();
        assert_eq!(raw, "9.000000:1234.500000");
    }

    async fn cb_allow(backend: &LocalBackend, timeout: f64, max: u32, now: f64) -> (bool, String) {
        let reply = backend
            .eval(
                Script::CbAllow,
                &cb_keys(),
                &[timeout.to_string(), max.to_string(), now.to_string()],
            )
            .await
            .unwrap();
        (reply[0] == "1", reply[1].clone())
    }

    async fn cb_fail(backend: &LocalBackend, threshold: u32, now: f64) -> (String, String) {
        let reply = backend
            .eval(Script::CbRecordFailure, &cb_keys(), &[threshold.to_string(), now.to_string()])
            .await
            .unwrap();
        (reply[0].clone(), reply[1].clone())
    }

    async fn cb_success(backend: &LocalBackend, threshold: u32) -> (String, String) {
        let reply = backend
            .eval(Script::CbRecordSuccess, &cb_keys(), &[threshold.to_string()])
            .await
            .unwrap();
        (reply[0].clone(), reply[1].clone())
    }

    #[tokio::test]
    async fn breaker_full_cycle() {
        let backend = LocalBackend::new();

        // CLOSED: admit, count failures up to the threshold.
        assert_eq!(cb_allow(&backend, 30.0, 1, 100.0).await, (true, "closed".into()));
        assert_eq!(cb_fail(&backend, 3, 100.0).await, ("closed".into(), "closed".into()));
        assert_eq!(cb_fail(&backend, 3, 101.0).await, ("closed".into(), "closed".into()));
        assert_eq!(cb_fail(&backend, 3, 102.0).await, ("closed".into(), "open".into()));

        // OPEN: deny until the timeout elapses.
        assert_eq!(cb_allow(&backend, 30.0, 1, 110.0).await, (false, "open".into()));
        // OPEN + failure leaves the record alone.
        assert_eq!(cb_fail(&backend, 3, 111.0).await, ("open".into(), "open".into()));

        // Timeout elapsed: probe admitted, state half_open.
        assert_eq!(cb_allow(&backend, 30.0, 1, 133.0).await, (true, "half_open".into()));

        // Two successes close it.
        assert_eq!(cb_success(&backend, 2).await, ("half_open".into(), "half_open".into()));
        assert_eq!(cb_success(&backend, 2).await, ("half_open".into(), "closed".into()));

        let failures = backend.get(&cb_keys()[1]).await.unwrap().unwrap();
        assert_eq!(failures, "0");
    }

    #[tokio::test]
    async fn half_open_gates_concurrent_probes() {
        let backend = LocalBackend::new();
        cb_fail(&backend, 1, 100.0).await;
        assert_eq!(cb_allow(&backend, 10.0, 2, 111.0).await, (true, "half_open".into()));
        // The transition itself resets inflight; two more slots admit, then deny.
        assert_eq!(cb_allow(&backend, 10.0, 2, 111.1).await, (true, "half_open".into()));
        assert_eq!(cb_allow(&backend, 10.0, 2, 111.2).await, (true, "half_open".into()));
        assert_eq!(cb_allow(&backend, 10.0, 2, 111.3).await, (false, "half_open".into()));
    }

    #[tokio::test]
    async fn half_open_failure_reopens_and_release_is_noop() {
        let backend = LocalBackend::new();
        cb_fail(&backend, 1, 100.0).await;
        cb_allow(&backend, 10.0, 1, 120.0).await;
        assert_eq!(cb_fail(&backend, 1, 121.0).await, ("half_open".into(), "open".into()));

        // The reopen already zeroed the slot counter; the release that runs
        // on the probe's exit path must not drive it negative.
        backend.eval(Script::CbReleaseHalfOpen, &cb_keys(), &[]).await.unwrap();
        let count = backend.get(&cb_keys()[4]).await.unwrap().unwrap();
        assert_eq!(count, "0");
    }

    #[tokio::test]
    async fn success_in_closed_only_zeroes_failures() {
        let backend = LocalBackend::new();
        cb_fail(&backend, 5, 100.0).await;
        cb_fail(&backend, 5, 101.0).await;
        assert_eq!(cb_success(&backend, 2).await, ("closed".into(), "closed".into()));
        let failures = backend.get(&cb_keys()[1]).await.unwrap().unwrap();
        assert_eq!(failures, "0");
        let state = backend.get(&cb_keys()[0]).await.unwrap();
        assert!(state.is_none() || state.as_deref() == Some("closed"));
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let backend = LocalBackend::new();
        backend.set("k", "v", Some(Duration::from_millis(10))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
    }
}
