//! Structured lifecycle events.
//!
//! Every request emits a fixed sequence of JSON events with a stable
//! schema: `request_start`, `upstream_request`, `upstream_response`,
//! `request_end`, plus an access log line and discrete events for errors,
//! breaker transitions, and rate-limit denials. Header values whose
//! lower-cased name is in the configured sensitive list are replaced by a
//! sentinel before anything reaches the log; long bodies are truncated.
//!
//! Event emission is fire-and-forget: a failure here never affects the
//! request.

use onekey_types::LoggingConfig;
use reqwest::header::HeaderMap;
use serde_json::{json, Value};

/// Sentinel written in place of a sensitive header value.
pub const REDACTED: &str = "[REDACTED]";

/// Suffix appended when a logged body is cut at the configured limit.
pub const TRUNCATION_MARKER: &str = "...[truncated]";

/// Header map → JSON object with sensitive values replaced.
///
/// `extra` names sensitive headers known only at the call site, such as a
/// provider's configured credential header.
pub fn redact_headers(headers: &HeaderMap, config: &LoggingConfig, extra: &[&str]) -> Value {
    let mut out = serde_json::Map::new();
    for (name, value) in headers {
        let name_lc = name.as_str().to_ascii_lowercase();
        let sensitive = config.sensitive_headers.iter().any(|s| s.eq_ignore_ascii_case(&name_lc))
            || extra.iter().any(|s| s.eq_ignore_ascii_case(&name_lc));
        let shown = if sensitive {
            REDACTED.to_string()
        } else {
            value.to_str().unwrap_or("<binary>").to_string()
        };
        out.insert(name_lc, Value::String(shown));
    }
    Value::Object(out)
}

/// Body → loggable string, truncated at the configured limit.
pub fn truncate_body(body: &[u8], config: &LoggingConfig) -> String {
    let text = String::from_utf8_lossy(body);
    if text.len() <= config.max_body_size {
        return text.into_owned();
    }
    let mut cut = config.max_body_size;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &text[..cut], TRUNCATION_MARKER)
}

pub fn request_start(request_id: &str, provider: &str, method: &str, path: &str) {
    emit(
        "request_start",
        json!({
            "request_id": request_id,
            "provider": provider,
            "method": method,
            "path": path,
        }),
    );
}

pub fn upstream_request(
    request_id: &str,
    provider: &str,
    url: &str,
    headers: &HeaderMap,
    body: &[u8],
    config: &LoggingConfig,
    extra_sensitive: &[&str],
) {
    emit(
        "upstream_request",
        json!({
            "request_id": request_id,
            "provider": provider,
            "url": url,
            "headers": redact_headers(headers, config, extra_sensitive),
            "body": truncate_body(body, config),
        }),
    );
}

pub fn upstream_response(request_id: &str, provider: &str, status: u16, attempts: u32) {
    emit(
        "upstream_response",
        json!({
            "request_id": request_id,
            "provider": provider,
            "status": status,
            "attempts": attempts,
        }),
    );
}

pub fn request_end(
    request_id: &str,
    provider: &str,
    status: u16,
    upstream_status: Option<u16>,
    latency_ms: u64,
    error_type: Option<&str>,
) {
    emit(
        "request_end",
        json!({
            "request_id": request_id,
            "provider": provider,
            "status": status,
            "upstream_status": upstream_status,
            "latency_ms": latency_ms,
            "error_type": error_type,
        }),
    );
}

pub fn rate_limit_denied(request_id: &str, provider: &str, scope: &str) {
    emit(
        "rate_limit_denied",
        json!({
            "request_id": request_id,
            "provider": provider,
            "scope": scope,
        }),
    );
}

pub fn access_log(
    method: &str,
    path: &str,
    status: u16,
    latency_ms: u64,
    client_ip: &str,
    request_id: &str,
) {
    emit(
        "access",
        json!({
            "method": method,
            "path": path,
            "status": status,
            "latency_ms": latency_ms,
            "client_ip": client_ip,
            "request_id": request_id,
        }),
    );
}

fn emit(event: &str, payload: Value) {
    tracing::info!(target: "onekey::events", event, payload = %payload);
}
