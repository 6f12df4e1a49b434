//! WebSocket hijack for proxied tenants.
//!
//! When a proxied request carries `Connection: upgrade` + `Upgrade:
//! websocket`, the handshake is forwarded to the worker; on a 101 the
//! client socket is taken over from hyper and relayed byte-for-byte against
//! the upstream socket until either side closes. Frames are never parsed —
//! the worker speaks WebSocket, Navigator just moves bytes.

use super::ProxyEngine;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Request, Response, StatusCode, Version};
use axum::response::IntoResponse;
use hyper_util::rt::TokioIo;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// True when the request asks for a WebSocket upgrade (case-insensitive,
/// comma-separated Connection lists included).
pub fn is_websocket_request(headers: &HeaderMap) -> bool {
    let upgrade_ws = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection_upgrade = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);
    upgrade_ws && connection_upgrade
}

pub async fn proxy_websocket(
    engine: &ProxyEngine,
    mut req: Request<Body>,
    upstream_base: &str,
) -> Response<Body> {
    // The client half only exists if hyper offered the upgrade.
    let Some(on_upgrade) = req.extensions_mut().remove::<hyper::upgrade::OnUpgrade>() else {
        warn!("websocket request without an upgradable connection");
        return StatusCode::BAD_REQUEST.into_response();
    };

    let url = match req.uri().path_and_query() {
        Some(pq) => format!("{upstream_base}{pq}"),
        None => upstream_base.to_string(),
    };

    // Forward the handshake with the client's Sec-WebSocket-* headers; the
    // upgrade tokens themselves are re-added explicitly since they are
    // hop-by-hop.
    let mut headers = HeaderMap::new();
    for (name, value) in req.headers() {
        let keep = name.as_str().starts_with("sec-websocket-")
            || name == header::ORIGIN
            || name == header::COOKIE
            || name == header::AUTHORIZATION;
        if keep {
            headers.append(name.clone(), value.clone());
        }
    }
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));

    let upstream_resp = match engine
        .client
        .get(&url)
        .headers(headers)
        .version(Version::HTTP_11)
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            warn!(url, err = %e, "websocket handshake with upstream failed");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    if upstream_resp.status() != StatusCode::SWITCHING_PROTOCOLS {
        // The worker refused the upgrade; relay its answer verbatim.
        let status = upstream_resp.status();
        let headers = super::inbound_headers(upstream_resp.headers());
        let body = upstream_resp.bytes().await.unwrap_or_default();
        let mut response = Response::builder()
            .status(status)
            .body(Body::from(body))
            .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());
        *response.headers_mut() = headers;
        return response;
    }

    // Echo the upstream's handshake answer (Sec-WebSocket-Accept and any
    // negotiated protocol/extensions) back to the client.
    let mut builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in upstream_resp.headers() {
        if name.as_str().starts_with("sec-websocket-") {
            builder = builder.header(name, value);
        }
    }
    builder = builder
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket");

    let gauge = WsGauge::connect(Arc::clone(&engine.live_websockets));
    tokio::spawn(async move {
        let _gauge = gauge;

        let mut upstream = match upstream_resp.upgrade().await {
            Ok(io) => io,
            Err(e) => {
                warn!(err = %e, "upstream websocket upgrade failed");
                return;
            }
        };
        let client = match on_upgrade.await {
            Ok(io) => io,
            Err(e) => {
                warn!(err = %e, "client websocket upgrade failed");
                return;
            }
        };
        let mut client = TokioIo::new(client);

        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((up, down)) => {
                debug!(bytes_up = up, bytes_down = down, "websocket relay closed")
            }
            Err(e) => debug!(err = %e, "websocket relay ended with error"),
        }
    });

    builder
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

/// Live-connection gauge entry. Increments on creation and decrements
/// exactly once on drop, whichever way the relay task exits.
struct WsGauge {
    counter: Arc<AtomicUsize>,
}

impl WsGauge {
    fn connect(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }
}

impl Drop for WsGauge {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}
