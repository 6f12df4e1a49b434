//! Reverse-proxy engine.
//!
//! Forwards one HTTP request to an upstream over a shared connection-pooled
//! client. GET/HEAD responses are buffered up to 64 KiB so a connection
//! refused, an upstream 502, or a read error early in the body can be
//! retried without the client ever seeing the failure; past the buffer limit
//! the response switches to streaming and retry is off for the rest of the
//! call. WebSocket upgrades are hijacked and relayed byte-for-byte
//! (`upgrade` module).
//!
//! `trust_forwarded_headers` and `disable_compression` are process-wide at
//! runtime; they live here as atomics and are written only by the lifecycle
//! controller on startup and reload.

pub mod upgrade;

use crate::config::Config;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use axum::response::IntoResponse;
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Response bytes held for transparent replay before streaming kicks in.
pub const RETRY_BUFFER_LIMIT: usize = 64 * 1024;

const RETRY_BACKOFF_START: Duration = Duration::from_millis(100);
const RETRY_BACKOFF_CAP: Duration = Duration::from_millis(500);
const POOL_MAX_IDLE_PER_HOST: usize = 10;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Hop-by-hop headers never forwarded in either direction (RFC 7230 §6.1).
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct ProxyEngine {
    client: reqwest::Client,
    trust_forwarded_headers: AtomicBool,
    disable_compression: AtomicBool,
    live_websockets: Arc<AtomicUsize>,
    retries_total: AtomicU64,
}

impl ProxyEngine {
    pub fn new() -> anyhow::Result<Self> {
        // No compression features are compiled in, and we never set
        // Accept-Encoding ourselves, so upstream bodies pass through
        // byte-identical with Content-Encoding and Content-Length intact.
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            trust_forwarded_headers: AtomicBool::new(false),
            disable_compression: AtomicBool::new(false),
            live_websockets: Arc::new(AtomicUsize::new(0)),
            retries_total: AtomicU64::new(0),
        })
    }

    /// Install the snapshot's proxy knobs. Called on startup and on reload.
    pub fn apply_config(&self, config: &Config) {
        self.trust_forwarded_headers
            .store(config.trust_forwarded_headers, Ordering::Relaxed);
        self.disable_compression
            .store(config.disable_compression, Ordering::Relaxed);
    }

    /// Live relayed WebSocket connections.
    pub fn live_websockets(&self) -> usize {
        self.live_websockets.load(Ordering::Relaxed)
    }

    /// Whether upstream bodies must pass through without any transparent
    /// content-coding work. The client is built without compression support,
    /// so this holds unconditionally; the knob is kept for reload parity and
    /// observability.
    pub fn compression_disabled(&self) -> bool {
        self.disable_compression.load(Ordering::Relaxed)
    }

    /// Total upstream retries since startup.
    pub fn retries_total(&self) -> u64 {
        self.retries_total.load(Ordering::Relaxed)
    }

    /// Forward `req` to `upstream_base` (scheme://host:port, no trailing
    /// slash). `deadline` bounds the whole retry window.
    pub async fn forward(
        &self,
        req: Request<Body>,
        upstream_base: &str,
        peer: SocketAddr,
        deadline: Duration,
    ) -> Response<Body> {
        if upgrade::is_websocket_request(req.headers()) {
            return upgrade::proxy_websocket(self, req, upstream_base).await;
        }

        let (parts, body) = req.into_parts();
        let url = match parts.uri.path_and_query() {
            Some(pq) => format!("{upstream_base}{pq}"),
            None => upstream_base.to_string(),
        };
        let headers = self.outbound_headers(&parts.headers, peer);
        let method = parts.method;

        if method == Method::GET || method == Method::HEAD {
            self.forward_with_retry(method, &url, headers, deadline).await
        } else {
            self.forward_once(method, &url, headers, body).await
        }
    }

    // ── Safe methods: buffered attempts inside the retry window ──────────────

    async fn forward_with_retry(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        deadline: Duration,
    ) -> Response<Body> {
        let started = Instant::now();
        let mut backoff = RETRY_BACKOFF_START;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self.attempt(method.clone(), url, headers.clone()).await {
                Ok(response) => {
                    if attempt > 1 {
                        debug!(url, attempt, "upstream recovered after retry");
                    }
                    return response;
                }
                Err(failure) => {
                    let next_try = started.elapsed() + backoff;
                    if next_try >= deadline {
                        warn!(url, attempt, failure = %failure, "retry budget exhausted");
                        return bad_gateway();
                    }
                    debug!(url, attempt, failure = %failure, backoff_ms = backoff.as_millis() as u64, "retrying upstream");
                    self.retries_total.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RETRY_BACKOFF_CAP);
                }
            }
        }
    }

    /// One buffered attempt. `Err` means retry-eligible: nothing has been
    /// committed to the client yet.
    async fn attempt(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
    ) -> Result<Response<Body>, AttemptFailure> {
        let resp = match self
            .client
            .request(method, url)
            .headers(headers)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_connect() => return Err(AttemptFailure::Connect(e)),
            Err(e) => return Err(AttemptFailure::NoResponse(e)),
        };

        // Upstream 502s are part of the retry window — the worker may still
        // be settling. They must not leak to the client until the budget is
        // spent.
        if resp.status() == StatusCode::BAD_GATEWAY {
            return Err(AttemptFailure::UpstreamBadGateway);
        }

        let status = resp.status();
        let resp_headers = inbound_headers(resp.headers());
        let mut stream = resp.bytes_stream();
        let mut buffered: Vec<bytes::Bytes> = Vec::new();
        let mut total = 0usize;

        loop {
            match stream.next().await {
                None => {
                    // Whole body fits the replay buffer — deliver it intact.
                    let mut response = Response::builder()
                        .status(status)
                        .body(Body::from(concat_bytes(buffered, total)))
                        .unwrap_or_else(|_| bad_gateway());
                    *response.headers_mut() = resp_headers;
                    return Ok(response);
                }
                Some(Ok(chunk)) => {
                    total += chunk.len();
                    buffered.push(chunk);
                    if total > RETRY_BUFFER_LIMIT {
                        // Past the limit: commit what we have and stream the
                        // rest; no further retry on this call.
                        let prefix = futures_util::stream::iter(
                            buffered.into_iter().map(Ok::<_, std::io::Error>),
                        );
                        let rest = stream.map(|r| {
                            r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
                        });
                        let mut response = Response::builder()
                            .status(status)
                            .body(Body::from_stream(prefix.chain(rest)))
                            .unwrap_or_else(|_| bad_gateway());
                        *response.headers_mut() = resp_headers;
                        return Ok(response);
                    }
                }
                Some(Err(e)) => return Err(AttemptFailure::BodyRead(e)),
            }
        }
    }

    // ── Unsafe methods: a single streamed attempt ────────────────────────────

    async fn forward_once(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Body,
    ) -> Response<Body> {
        let outbound = reqwest::Body::wrap_stream(body.into_data_stream());
        let resp = match self
            .client
            .request(method, url)
            .headers(headers)
            .body(outbound)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(url, err = %e, "upstream request failed");
                return bad_gateway();
            }
        };

        let status = resp.status();
        let resp_headers = inbound_headers(resp.headers());
        let stream = resp
            .bytes_stream()
            .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
        let mut response = Response::builder()
            .status(status)
            .body(Body::from_stream(stream))
            .unwrap_or_else(|_| bad_gateway());
        *response.headers_mut() = resp_headers;
        response
    }

    // ── Header rewriting ─────────────────────────────────────────────────────

    fn outbound_headers(&self, inbound: &HeaderMap, peer: SocketAddr) -> HeaderMap {
        let mut out = HeaderMap::with_capacity(inbound.len() + 3);
        for (name, value) in inbound {
            if is_hop_by_hop(name.as_str())
                || name == header::HOST
                || name == header::CONTENT_LENGTH
            {
                continue;
            }
            out.append(name.clone(), value.clone());
        }

        if !out.contains_key("x-forwarded-for") {
            if let Ok(v) = HeaderValue::from_str(&peer.ip().to_string()) {
                out.insert("x-forwarded-for", v);
            }
        }

        let trust = self.trust_forwarded_headers.load(Ordering::Relaxed);
        let keep_inbound_xfh = trust && out.contains_key("x-forwarded-host");
        if !keep_inbound_xfh {
            match inbound.get(header::HOST) {
                Some(host) => {
                    out.insert("x-forwarded-host", host.clone());
                }
                None => {
                    out.remove("x-forwarded-host");
                }
            }
        }

        if !out.contains_key("x-forwarded-proto") {
            out.insert("x-forwarded-proto", HeaderValue::from_static("http"));
        }

        out
    }
}

#[derive(Debug, thiserror::Error)]
enum AttemptFailure {
    #[error("connect: {0}")]
    Connect(reqwest::Error),
    #[error("no usable response: {0}")]
    NoResponse(reqwest::Error),
    #[error("upstream returned 502")]
    UpstreamBadGateway,
    #[error("body read inside replay buffer: {0}")]
    BodyRead(reqwest::Error),
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

fn inbound_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn concat_bytes(chunks: Vec<bytes::Bytes>, total: usize) -> bytes::Bytes {
    if chunks.len() == 1 {
        return chunks.into_iter().next().unwrap_or_default();
    }
    let mut out = Vec::with_capacity(total);
    for c in chunks {
        out.extend_from_slice(&c);
    }
    out.into()
}

fn bad_gateway() -> Response<Body> {
    (StatusCode::BAD_GATEWAY, "upstream unavailable").into_response()
}
