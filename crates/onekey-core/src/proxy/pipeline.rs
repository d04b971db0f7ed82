//! The request-mediation pipeline.
//!
//! One straight-line function per request:
//!
//! 1. derive a request id, resolve the provider from the path prefix
//! 2. rate-limit checks: global → provider → client ip
//! 3. fresh cache read (breaker closed, safe methods only)
//! 4. circuit-breaker admission, with stale-cache fallback on denial
//! 5. credential presence check
//! 6. request body size check
//! 7. forward with retry; record the outcome on the breaker; cache
//!    eligible responses; stale-cache fallback on transport failure
//! 8. release the half-open slot and emit the latency metric on every
//!    exit path, including client disconnect (the slot is guarded by a
//!    drop guard so cancellation cannot leak it)
//!
//! The only shared mutable state is the store; everything here is a pure
//! orchestration over it.

use crate::proxy::cache::CachedResponse;
use crate::proxy::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::proxy::events;
use crate::proxy::server::GatewayState;
use crate::proxy::upstream::UpstreamClient;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use onekey_types::{AuthType, ErrorKind, GatewayError, ProviderConfig};
use rand::Rng;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

const HEADER_REQUEST_ID: &str = "x-proxy-request-id";
const HEADER_PROVIDER: &str = "x-provider";
const HEADER_CACHE: &str = "x-cache";
const HEADER_DEGRADED: &str = "x-degraded";
const HEADER_CACHE_AGE: &str = "x-cache-age";

/// Per-request bookkeeping, created at entry and dropped on flush.
struct RequestContext {
    request_id: String,
    provider_id: String,
    started: Instant,
    upstream_status: Option<u16>,
    error: Option<ErrorKind>,
}

/// Releases a half-open probe slot exactly once per admitted request.
///
/// Normal exit paths call [`release`](Self::release); if the request
/// future is dropped instead (client disconnect), `Drop` spawns the
/// release so cancellation cannot leak the slot.
struct HalfOpenSlotGuard {
    breaker: Arc<CircuitBreaker>,
    provider: String,
    released: bool,
}

impl HalfOpenSlotGuard {
    fn new(breaker: Arc<CircuitBreaker>, provider: &str) -> Self {
        Self { breaker, provider: provider.to_string(), released: false }
    }

    async fn release(mut self) {
        self.released = true;
        self.breaker.release_half_open_slot(&self.provider).await;
    }
}

impl Drop for HalfOpenSlotGuard {
    fn drop(&mut self) {
        if !self.released {
            let breaker = self.breaker.clone();
            let provider = std::mem::take(&mut self.provider);
            tokio::spawn(async move {
                breaker.release_half_open_slot(&provider).await;
            });
        }
    }
}

/// The axum fallback handler carrying the whole pipeline.
pub async fn handle_proxy(State(state): State<GatewayState>, request: Request) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(str::to_string);
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    // Step 1: request id + provider resolution.
    let request_id = new_request_id();
    let trimmed = path.strip_prefix('/').unwrap_or(&path);
    let (prefix, path_after_prefix) = match trimmed.split_once('/') {
        Some((prefix, rest)) => (prefix, format!("/{rest}")),
        None => (trimmed, String::new()),
    };
    let Some((provider_id, provider)) = state.config.provider_by_prefix(prefix) else {
        let err = GatewayError::ProviderNotFound { prefix: prefix.to_string() };
        let response = error_response(&err, &request_id, prefix);
        state.metrics.record_request(
            "unknown",
            method.as_str(),
            404,
            Some(ErrorKind::InvalidProvider.as_str()),
            elapsed_ms(started),
        );
        events::access_log(method.as_str(), &path, 404, elapsed_ms(started), &client_ip, &request_id);
        return response;
    };
    let provider = provider.clone();
    let provider_id = provider_id.to_string();

    let mut ctx = RequestContext {
        request_id,
        provider_id: provider_id.clone(),
        started,
        upstream_status: None,
        error: None,
    };

    events::request_start(&ctx.request_id, &provider_id, method.as_str(), &path);
    state.metrics.connection_opened(&provider_id);

    let response = mediate(
        &state,
        &mut ctx,
        &provider,
        method.as_str(),
        &path_after_prefix,
        query.as_deref(),
        &client_ip,
        request,
    )
    .await;

    // Step 8: latency metric and end-of-life events, on every path.
    let latency = elapsed_ms(ctx.started);
    let status = response.status().as_u16();
    state.metrics.record_request(
        &ctx.provider_id,
        method.as_str(),
        status,
        ctx.error.map(ErrorKind::as_str),
        latency,
    );
    events::request_end(
        &ctx.request_id,
        &ctx.provider_id,
        status,
        ctx.upstream_status,
        latency,
        ctx.error.map(ErrorKind::as_str),
    );
    events::access_log(method.as_str(), &path, status, latency, &client_ip, &ctx.request_id);
    state.metrics.connection_closed(&ctx.provider_id);

    response
}

/// Steps 2–7. Returns the response to flush; `ctx` carries the outcome
/// classification for the caller's metric emission.
#[allow(clippy::too_many_arguments)]
async fn mediate(
    state: &GatewayState,
    ctx: &mut RequestContext,
    provider: &ProviderConfig,
    method: &str,
    path_after_prefix: &str,
    query: Option<&str>,
    client_ip: &str,
    request: Request,
) -> Response {
    let provider_id = ctx.provider_id.clone();
    let safe_method = matches!(method, "GET" | "HEAD");

    // Step 2: rate limits, global → provider → ip. First denial wins.
    if let Some(scope) = state.limiter.check_request(&provider_id, client_ip).await {
        events::rate_limit_denied(&ctx.request_id, &provider_id, scope.as_str());
        let err = GatewayError::RateLimited { scope: scope.as_str().to_string() };
        ctx.error = Some(err.kind());
        return error_response(&err, &ctx.request_id, &provider_id);
    }

    // Step 3: fresh cache read while the breaker is closed.
    if safe_method && state.breaker.state(&provider_id).await == CircuitState::Closed {
        if let Some(hit) =
            state.cache.fresh_read(&provider_id, method, path_after_prefix, query).await
        {
            ctx.error = Some(ErrorKind::CacheHit);
            return cached_response(&hit, &ctx.request_id, &provider_id, false);
        }
    }

    // Step 4: breaker admission, stale fallback on denial.
    let (admitted, cb_state) = state.breaker.allow_request(&provider_id).await;
    if !admitted {
        if safe_method {
            if let Some(stale) =
                state.cache.stale_read(&provider_id, method, path_after_prefix, query).await
            {
                ctx.error = Some(ErrorKind::DegradedCache);
                return cached_response(&stale, &ctx.request_id, &provider_id, true);
            }
        }
        let err = GatewayError::CircuitOpen {
            provider: provider_id.clone(),
            state: cb_state.as_str().to_string(),
        };
        ctx.error = Some(err.kind());
        return error_response(&err, &ctx.request_id, &provider_id);
    }

    // Admitted: from here on the half-open slot must be released on every
    // exit path, exactly once.
    let guard = HalfOpenSlotGuard::new(state.breaker.clone(), &provider_id);

    // Step 5: credential presence.
    if provider.auth_type != AuthType::None && provider.api_key.is_none() {
        tracing::error!(provider = %provider_id, "provider has no API key configured");
        guard.release().await;
        let err = GatewayError::MissingCredential { provider: provider_id.clone() };
        ctx.error = Some(err.kind());
        return error_response(&err, &ctx.request_id, &provider_id);
    }

    // Step 6: request body size, by declared length then by actual read.
    let max_body = state.config.proxy.max_body_size;
    let declared_len = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared_len.is_some_and(|len| len > max_body) {
        guard.release().await;
        let err = GatewayError::RequestTooLarge { max_bytes: max_body };
        ctx.error = Some(err.kind());
        return error_response(&err, &ctx.request_id, &provider_id);
    }

    let inbound_headers = request.headers().clone();
    let body = match axum::body::to_bytes(request.into_body(), max_body).await {
        Ok(body) => body,
        Err(_) => {
            guard.release().await;
            let err = GatewayError::RequestTooLarge { max_bytes: max_body };
            ctx.error = Some(err.kind());
            return error_response(&err, &ctx.request_id, &provider_id);
        }
    };

    // Step 7: forward with retry.
    let url = UpstreamClient::build_url(provider, path_after_prefix, query);
    let upstream_headers =
        UpstreamClient::build_headers(provider, &inbound_headers, &ctx.request_id);
    // The logged URL is rebuilt without credential interpolation so a
    // url-auth key never reaches the event stream.
    let display_url =
        format!("{}{}", provider.upstream.trim_end_matches('/'), path_after_prefix);
    let extra_sensitive: Vec<&str> = provider.auth_header.as_deref().into_iter().collect();
    events::upstream_request(
        &ctx.request_id,
        &provider_id,
        &display_url,
        &upstream_headers,
        &body,
        &state.config.logging,
        &extra_sensitive,
    );

    let reqwest_method = match reqwest::Method::from_bytes(method.as_bytes()) {
        Ok(m) => m,
        Err(_) => reqwest::Method::GET,
    };

    let outcome = state
        .upstream
        .forward_with_retry(&provider_id, provider, reqwest_method, &url, upstream_headers, body)
        .await;

    match outcome {
        Ok(upstream) => {
            ctx.upstream_status = Some(upstream.status);
            events::upstream_response(
                &ctx.request_id,
                &provider_id,
                upstream.status,
                upstream.attempts,
            );

            if upstream.status >= 500 {
                ctx.error = Some(ErrorKind::Upstream5xx);
                state.breaker.record_failure(&provider_id).await;
            } else {
                ctx.error = ErrorKind::from_status(upstream.status);
                state.breaker.record_success(&provider_id).await;
                let content_type = upstream
                    .headers
                    .get(header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                state
                    .cache
                    .store_response(
                        &provider_id,
                        method,
                        path_after_prefix,
                        query,
                        upstream.status,
                        &upstream.body,
                        content_type.as_deref(),
                    )
                    .await;
            }

            guard.release().await;

            // Upstream body verbatim; only headers are augmented. The
            // hop-by-hop set was already stripped by the upstream client.
            let mut builder = Response::builder()
                .status(StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY));
            if let Some(headers) = builder.headers_mut() {
                for (name, value) in &upstream.headers {
                    headers.append(name.clone(), value.clone());
                }
                annotate(headers, &ctx.request_id, &provider_id);
            }
            builder
                .body(Body::from(upstream.body))
                .unwrap_or_else(|_| fallback_500())
        }
        Err(failure) => {
            ctx.error = Some(failure.kind);
            state.breaker.record_failure(&provider_id).await;
            guard.release().await;

            if safe_method {
                if let Some(stale) =
                    state.cache.stale_read(&provider_id, method, path_after_prefix, query).await
                {
                    ctx.error = Some(ErrorKind::DegradedCache);
                    return cached_response(&stale, &ctx.request_id, &provider_id, true);
                }
            }

            tracing::warn!(
                provider = %provider_id,
                kind = failure.kind.as_str(),
                attempts = failure.attempts,
                error = %failure.message,
                "upstream transport failure"
            );
            let err = GatewayError::UpstreamUnreachable {
                provider: provider_id.clone(),
                kind: failure.kind,
                message: failure.message,
            };
            error_response(&err, &ctx.request_id, &provider_id)
        }
    }
}

fn new_request_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "onekey".to_string());
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let entropy: u32 = rand::thread_rng().gen_range(0..0xff_ffff);
    format!("{host}-{millis:x}-{entropy:06x}")
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn annotate(headers: &mut axum::http::HeaderMap, request_id: &str, provider_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(HeaderName::from_static(HEADER_REQUEST_ID), value);
    }
    if let Ok(value) = HeaderValue::from_str(provider_id) {
        headers.insert(HeaderName::from_static(HEADER_PROVIDER), value);
    }
}

/// Render a gateway-originated error as the client-facing JSON contract:
/// status from the error, body shape per variant, `Retry-After` on the
/// admission rejections.
fn error_response(err: &GatewayError, request_id: &str, provider_id: &str) -> Response {
    let status = StatusCode::from_u16(err.http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let (body, retry_after) = match err {
        GatewayError::ProviderNotFound { .. } => (json!({"error": "Provider not found"}), None),
        GatewayError::RateLimited { scope } => {
            (json!({"error": "Rate limit exceeded", "type": scope}), Some("60"))
        }
        GatewayError::CircuitOpen { state, .. } => (
            json!({
                "error": "Service temporarily unavailable",
                "reason": "circuit_breaker",
                "state": state,
            }),
            Some("30"),
        ),
        GatewayError::MissingCredential { .. } => {
            (json!({"error": "Service configuration error"}), None)
        }
        GatewayError::RequestTooLarge { .. } => (
            json!({"error": "Request body too large", "type": "request_too_large"}),
            None,
        ),
        GatewayError::UpstreamUnreachable { kind, .. } => (
            json!({"error": "Upstream service error", "type": kind.as_str()}),
            None,
        ),
    };

    let mut response = json_response(status, body, request_id, provider_id);
    if let Some(seconds) = retry_after {
        response.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from_static(seconds));
    }
    response
}

fn json_response(status: StatusCode, body: Value, request_id: &str, provider_id: &str) -> Response {
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(headers) = builder.headers_mut() {
        annotate(headers, request_id, provider_id);
    }
    builder.body(Body::from(body.to_string())).unwrap_or_else(|_| fallback_500())
}

fn cached_response(
    hit: &CachedResponse,
    request_id: &str,
    provider_id: &str,
    degraded: bool,
) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(hit.status).unwrap_or(StatusCode::OK));
    if let Some(headers) = builder.headers_mut() {
        if let Some(ct) = &hit.content_type {
            if let Ok(value) = HeaderValue::from_str(ct) {
                headers.insert(header::CONTENT_TYPE, value);
            }
        }
        annotate(headers, request_id, provider_id);
        if degraded {
            headers.insert(HeaderName::from_static(HEADER_DEGRADED), HeaderValue::from_static("cache"));
            if let Ok(value) = HeaderValue::from_str(&format!("{:.2}", hit.age)) {
                headers.insert(HeaderName::from_static(HEADER_CACHE_AGE), value);
            }
        } else {
            headers.insert(HeaderName::from_static(HEADER_CACHE), HeaderValue::from_static("HIT"));
        }
    }
    builder.body(Body::from(hit.body.clone())).unwrap_or_else(|_| fallback_500())
}

fn fallback_500() -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}
