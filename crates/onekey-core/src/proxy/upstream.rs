//! Upstream HTTP client: credential injection, header filtering, timeouts,
//! classified transport errors, and bounded exponential-backoff retry.
//!
//! One `reqwest` client is built per provider at startup (timeouts and TLS
//! verification differ per provider); the pools are process-wide and safe
//! for concurrent use.

use bytes::Bytes;
use onekey_types::{AuthType, ErrorKind, ProviderConfig};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use std::collections::HashMap;
use std::error::Error as _;
use std::time::Duration;

/// Headers terminated at each proxy hop, never forwarded in either
/// direction.
pub const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Trace header attached to every outgoing upstream request.
pub const TRACE_HEADER: &str = "x-onekey-request-id";

/// Cap on any single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Methods safe to replay against an upstream.
pub fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS | Method::TRACE
    )
}

/// A completed upstream exchange.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Attempts actually made, including the successful one.
    pub attempts: u32,
}

/// Transport-level failure after all permitted attempts.
#[derive(Debug)]
pub struct UpstreamFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub attempts: u32,
}

pub struct UpstreamClient {
    clients: HashMap<String, Client>,
}

impl UpstreamClient {
    /// Build one pooled client per provider. A provider whose client fails
    /// to build is dropped with a warning rather than failing the boot.
    pub fn new(providers: &HashMap<String, ProviderConfig>) -> Self {
        let mut clients = HashMap::new();
        for (id, provider) in providers {
            let builder = Client::builder()
                .connect_timeout(Duration::from_millis(provider.timeout.connect_ms))
                .timeout(Duration::from_millis(
                    provider.timeout.send_ms + provider.timeout.read_ms,
                ))
                .pool_max_idle_per_host(16)
                .pool_idle_timeout(Duration::from_secs(90))
                .tcp_keepalive(Duration::from_secs(60))
                .danger_accept_invalid_certs(!provider.ssl_verify);

            match builder.build() {
                Ok(client) => {
                    clients.insert(id.clone(), client);
                }
                Err(err) => {
                    tracing::warn!(provider = %id, error = %err, "failed to build upstream client, provider disabled");
                }
            }
        }
        Self { clients }
    }

    /// Build the outgoing URL: upstream base plus the path after the
    /// prefix, with the credential interpolated for `url` auth mode and
    /// the inbound raw query appended.
    pub fn build_url(provider: &ProviderConfig, path_after_prefix: &str, query: Option<&str>) -> String {
        let base = provider.upstream.trim_end_matches('/');
        let mut url = match provider.auth_type {
            AuthType::Url => {
                let key = provider.api_key.as_deref().unwrap_or_default();
                format!("{base}/v2/{key}{path_after_prefix}")
            }
            _ => format!("{base}{path_after_prefix}"),
        };
        if let Some(q) = query {
            if !q.is_empty() {
                url.push('?');
                url.push_str(q);
            }
        }
        url
    }

    /// Copy inbound headers minus the hop-by-hop set, add the trace
    /// header, and inject the provider credential.
    pub fn build_headers(
        provider: &ProviderConfig,
        inbound: &HeaderMap,
        request_id: &str,
    ) -> HeaderMap {
        let mut headers = strip_hop_by_hop(inbound);

        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert(HeaderName::from_static(TRACE_HEADER), value);
        }

        match provider.auth_type {
            AuthType::Basic => {
                if let Some(key) = &provider.api_key {
                    use base64::engine::general_purpose::STANDARD as BASE64;
                    use base64::Engine;
                    let encoded = BASE64.encode(format!("{key}:"));
                    if let Ok(value) = HeaderValue::from_str(&format!("Basic {encoded}")) {
                        headers.insert(reqwest::header::AUTHORIZATION, value);
                    }
                }
            }
            AuthType::Header => {
                if let (Some(name), Some(key)) = (&provider.auth_header, &provider.api_key) {
                    if let (Ok(name), Ok(value)) = (
                        HeaderName::from_bytes(name.as_bytes()),
                        HeaderValue::from_str(key),
                    ) {
                        headers.insert(name, value);
                    }
                }
            }
            // Credential already in the URL, or no credential at all.
            AuthType::Url | AuthType::None => {}
        }

        headers
    }

    /// Forward with bounded retry.
    ///
    /// Attempt count is `retry.times + 1` for idempotent methods and
    /// exactly 1 otherwise. Between attempts `k` and `k+1` the client
    /// sleeps `min(2 s, delay × 2^(k−1))`. TLS failures are deterministic
    /// and abort the loop immediately.
    pub async fn forward_with_retry(
        &self,
        provider_id: &str,
        provider: &ProviderConfig,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<UpstreamResponse, UpstreamFailure> {
        let client = match self.clients.get(provider_id) {
            Some(client) => client,
            None => {
                return Err(UpstreamFailure {
                    kind: ErrorKind::UpstreamError,
                    message: format!("no client for provider {provider_id}"),
                    attempts: 0,
                })
            }
        };

        let max_attempts = if is_idempotent(&method) { provider.retry.times + 1 } else { 1 };
        let base_delay = Duration::from_millis(provider.retry.delay_ms);
        let mut last_failure: Option<UpstreamFailure> = None;

        for attempt in 1..=max_attempts {
            let request = client
                .request(method.clone(), url)
                .headers(headers.clone())
                .body(body.clone());

            match request.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let resp_headers = strip_hop_by_hop(response.headers());
                    match response.bytes().await {
                        Ok(bytes) => {
                            return Ok(UpstreamResponse {
                                status,
                                headers: resp_headers,
                                body: bytes,
                                attempts: attempt,
                            });
                        }
                        Err(err) => {
                            let kind = classify_transport(&err);
                            tracing::debug!(
                                provider = provider_id,
                                attempt,
                                kind = kind.as_str(),
                                "upstream body read failed"
                            );
                            last_failure = Some(UpstreamFailure {
                                kind,
                                message: err.to_string(),
                                attempts: attempt,
                            });
                        }
                    }
                }
                Err(err) => {
                    let kind = classify_transport(&err);
                    tracing::debug!(
                        provider = provider_id,
                        attempt,
                        kind = kind.as_str(),
                        error = %err,
                        "upstream attempt failed"
                    );
                    last_failure = Some(UpstreamFailure {
                        kind,
                        message: err.to_string(),
                        attempts: attempt,
                    });
                }
            }

            let Some(failure) = last_failure.as_ref() else { break };
            if !failure.kind.is_retryable() || attempt >= max_attempts {
                break;
            }

            let backoff = base_delay
                .checked_mul(1 << (attempt - 1).min(16))
                .unwrap_or(MAX_BACKOFF)
                .min(MAX_BACKOFF);
            tokio::time::sleep(backoff).await;
        }

        Err(last_failure.unwrap_or_else(|| UpstreamFailure {
            kind: ErrorKind::UpstreamError,
            message: "no attempt executed".into(),
            attempts: 0,
        }))
    }
}

/// Classify a reqwest transport error into the stable label set.
///
/// The io::Error chain is consulted first; message sniffing is the
/// fallback for error shapes reqwest does not expose structurally.
pub fn classify_transport(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        return ErrorKind::Timeout;
    }

    let mut source: Option<&(dyn std::error::Error + 'static)> = err.source();
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::ConnectionRefused => return ErrorKind::ConnectionRefused,
                std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof => return ErrorKind::ConnectionBroken,
                _ => {}
            }
        }
        source = inner.source();
    }

    let message = format!("{err:?}").to_lowercase();
    if message.contains("certificate") || message.contains("tls") || message.contains("ssl") {
        ErrorKind::SslError
    } else if message.contains("connection refused") {
        ErrorKind::ConnectionRefused
    } else if message.contains("connection reset")
        || message.contains("broken pipe")
        || message.contains("incomplete message")
    {
        ErrorKind::ConnectionBroken
    } else if err.is_connect() {
        ErrorKind::ConnectFailure
    } else if err.is_body() || err.is_decode() {
        ErrorKind::ConnectionBroken
    } else {
        ErrorKind::UpstreamError
    }
}

/// Remove the hop-by-hop set from a header map (case-insensitive).
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if !HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}
