//! Request dispatcher.
//!
//! One dispatcher is built per configuration snapshot and replaced whole on
//! reload; in-flight requests keep the clone they started with. Per request
//! it walks the handler chain in a fixed order: maintenance gate (static
//! files always win), authentication, static files, CGI, the hub endpoints,
//! explicit proxy routes, tenant workers, then 404.
//!
//! The only cross-request state is the snapshot `Arc` and the memoised
//! per-tenant upstream cache, which re-keys itself whenever a worker's port
//! changes (crash + restart) and dies with the dispatcher on reload.

use crate::access_log::AccessLog;
use crate::assets::{serve_file, StaticResolver};
use crate::auth::{Access, AuthVerifier};
use crate::cgi;
use crate::config::Config;
use crate::hub::{connection, Hub};
use crate::proxy::ProxyEngine;
use crate::server::ControlEvent;
use crate::supervisor::{SupervisorError, WorkerSupervisor};
use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::FromRequestParts;
use axum::http::{header, HeaderValue, Method, Request, Response, StatusCode};
use axum::response::IntoResponse;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct Dispatcher {
    pub snapshot: Arc<Config>,
    auth: Arc<AuthVerifier>,
    supervisor: Arc<WorkerSupervisor>,
    proxy: Arc<ProxyEngine>,
    hub: Arc<Hub>,
    resolver: StaticResolver,
    access_log: Arc<AccessLog>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    /// label → (port, upstream base URL).
    upstream_cache: RwLock<HashMap<String, (u16, String)>>,
}

impl Dispatcher {
    pub fn new(
        snapshot: Arc<Config>,
        auth: Arc<AuthVerifier>,
        supervisor: Arc<WorkerSupervisor>,
        proxy: Arc<ProxyEngine>,
        hub: Arc<Hub>,
        control_tx: mpsc::UnboundedSender<ControlEvent>,
    ) -> Self {
        let resolver = StaticResolver::new(&snapshot);
        let access_log = Arc::new(AccessLog::new(snapshot.access_log.as_deref()));
        Self {
            snapshot,
            auth,
            supervisor,
            proxy,
            hub,
            resolver,
            access_log,
            control_tx,
            upstream_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Process one request end to end, including the access-log record.
    pub async fn handle(self: &Arc<Self>, mut req: Request<Body>, peer: SocketAddr) -> Response<Body> {
        let path = decode_path(req.uri().path());
        let user_agent = req
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let log = self.access_log.start(
            req.method().as_str(),
            req.uri().path(),
            &peer.to_string(),
            user_agent.as_deref(),
        );

        if !req.headers().contains_key("x-request-id") {
            if let Ok(v) = HeaderValue::from_str(log.request_id()) {
                req.headers_mut().insert("x-request-id", v);
            }
        }

        let (response, tag) = self.route(req, peer, &path).await;
        log.finish(response.status().as_u16(), tag);
        response
    }

    async fn route(
        self: &Arc<Self>,
        req: Request<Body>,
        peer: SocketAddr,
        path: &str,
    ) -> (Response<Body>, &'static str) {
        let method = req.method().clone();
        let is_read = method == Method::GET || method == Method::HEAD;

        // 1. Maintenance mode: dynamic traffic gets the maintenance page;
        //    static assets keep being served.
        if self.snapshot.maintenance {
            if is_read {
                if let Some(file) = self.resolver.resolve(path).await {
                    return (serve_file(&file, req).await, "static");
                }
            }
            return (self.maintenance_response().await, "maintenance");
        }

        // 2. Authentication.
        match self.auth.access_for(path) {
            Access::Open => {}
            Access::Denied => {
                return ((StatusCode::FORBIDDEN, "forbidden").into_response(), "denied")
            }
            Access::Protected => {
                let header_value = req
                    .headers()
                    .get(header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                if !self.auth.verify(header_value.as_deref()) {
                    let mut resp =
                        (StatusCode::UNAUTHORIZED, "authentication required").into_response();
                    if let Ok(v) = HeaderValue::from_str(&self.auth.challenge()) {
                        resp.headers_mut().insert(header::WWW_AUTHENTICATE, v);
                    }
                    return (resp, "auth_required");
                }
            }
        }

        // 3. Static files.
        if is_read {
            if let Some(file) = self.resolver.resolve(path).await {
                return (serve_file(&file, req).await, "static");
            }
        }

        // 4. CGI scripts.
        if let Some(rule) = cgi::match_rule(&self.snapshot.cgi, method.as_str(), path) {
            let rule = rule.clone();
            let outcome = cgi::run(&rule, req, peer).await;
            if let Some(target) = outcome.reload_request {
                self.consider_cgi_reload(&rule.path, rule.allow_reload, &target);
            }
            return (outcome.response, "cgi");
        }

        // 5. Hub endpoints.
        if path == self.snapshot.websocket_path {
            return (self.upgrade_to_hub(req).await, "hub");
        }
        if path == self.snapshot.broadcast_path {
            return (self.ingest_broadcast(req, &method).await, "broadcast");
        }

        // 6. Explicit reverse-proxy routes (longest prefix wins).
        if let Some(route) = self
            .snapshot
            .routes
            .iter()
            .filter(|r| path.starts_with(r.prefix.as_str()))
            .max_by_key(|r| r.prefix.len())
        {
            let resp = self
                .proxy
                .forward(req, &route.upstream, peer, self.snapshot.retry_deadline)
                .await;
            return (resp, "proxy");
        }

        // 7. Tenant workers.
        if let Some(label) = self.resolve_tenant(path) {
            return self.dispatch_tenant(&label, req, peer).await;
        }

        // 8. Nothing matched.
        ((StatusCode::NOT_FOUND, "not found").into_response(), "not_found")
    }

    // ── Tenants ──────────────────────────────────────────────────────────────

    /// Longest prefix wins; regex tenants are consulted only when no prefix
    /// matched; the configured catch-all label takes whatever is left.
    fn resolve_tenant(&self, path: &str) -> Option<String> {
        let mut best: Option<(usize, &str)> = None;
        for tenant in &self.snapshot.tenants {
            if let Some(score) = tenant.match_score(path) {
                let better = match best {
                    Some((best_score, _)) => score > best_score,
                    None => true,
                };
                if better {
                    best = Some((score, &tenant.label));
                }
            }
        }
        best.map(|(_, label)| label.to_string())
            .or_else(|| self.snapshot.catch_all.clone())
    }

    async fn dispatch_tenant(
        self: &Arc<Self>,
        label: &str,
        req: Request<Body>,
        peer: SocketAddr,
    ) -> (Response<Body>, &'static str) {
        let Some(tenant) = self.snapshot.tenant(label) else {
            return ((StatusCode::NOT_FOUND, "not found").into_response(), "not_found");
        };

        let worker = match self.supervisor.acquire(tenant).await {
            Ok(w) => w,
            Err(e) => return (supervisor_error_response(&e), "worker_error"),
        };

        let upstream = self.upstream_for(label, worker.port);
        let resp = self
            .proxy
            .forward(req, &upstream, peer, self.snapshot.retry_deadline)
            .await;
        (resp, "tenant")
    }

    /// Memoised upstream base URL; re-built when the worker's port moved.
    fn upstream_for(&self, label: &str, port: u16) -> String {
        {
            let cache = self.upstream_cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some((cached_port, url)) = cache.get(label) {
                if *cached_port == port {
                    return url.clone();
                }
            }
        }
        let url = format!("http://127.0.0.1:{port}");
        debug!(label, port, "tenant upstream bound");
        self.upstream_cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(label.to_string(), (port, url.clone()));
        url
    }

    // ── Hub endpoints ────────────────────────────────────────────────────────

    async fn upgrade_to_hub(&self, req: Request<Body>) -> Response<Body> {
        let (mut parts, _body) = req.into_parts();
        match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(ws) => {
                let hub = Arc::clone(&self.hub);
                ws.on_upgrade(move |socket| connection::handle_socket(hub, socket))
                    .into_response()
            }
            Err(e) => e.into_response(),
        }
    }

    async fn ingest_broadcast(&self, req: Request<Body>, method: &Method) -> Response<Body> {
        if *method != Method::POST {
            return (StatusCode::METHOD_NOT_ALLOWED, "broadcast requires POST").into_response();
        }
        let body = match axum::body::to_bytes(req.into_body(), 1024 * 1024).await {
            Ok(b) => b,
            Err(_) => return (StatusCode::BAD_REQUEST, "unreadable body").into_response(),
        };

        #[derive(serde::Deserialize)]
        struct Broadcast {
            stream: String,
            data: serde_json::Value,
        }
        let parsed: Broadcast = match serde_json::from_slice(&body) {
            Ok(p) => p,
            Err(e) => {
                debug!(err = %e, "malformed broadcast payload");
                return (StatusCode::BAD_REQUEST, "expected {\"stream\", \"data\"}").into_response();
            }
        };
        if parsed.stream.is_empty() {
            return (StatusCode::BAD_REQUEST, "stream must not be empty").into_response();
        }

        let outcome = self.hub.broadcast(&parsed.stream, parsed.data).await;
        let body = serde_json::json!({
            "delivered": outcome.delivered,
            "dropped": outcome.dropped,
        });
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }

    // ── Maintenance & reload plumbing ────────────────────────────────────────

    async fn maintenance_response(&self) -> Response<Body> {
        let body = match &self.snapshot.maintenance_page {
            Some(page) => match tokio::fs::read(page).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(page = %page.display(), err = %e, "maintenance page unreadable");
                    b"Service temporarily unavailable".to_vec()
                }
            },
            None => b"Service temporarily unavailable".to_vec(),
        };
        (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            body,
        )
            .into_response()
    }

    /// A CGI script asked for a reload. Policy: the rule must opt in, and
    /// the target must be the configuration file already in use — scripts
    /// may rewrite it in place but cannot point the server elsewhere.
    fn consider_cgi_reload(&self, rule_path: &str, allowed: bool, target: &str) {
        if !allowed {
            warn!(rule = rule_path, "cgi reload request from rule without allow_reload — ignored");
            return;
        }
        if std::path::Path::new(target) != self.snapshot.source {
            warn!(
                rule = rule_path,
                target,
                current = %self.snapshot.source.display(),
                "cgi reload request for a different config file — ignored"
            );
            return;
        }
        debug!(rule = rule_path, "cgi-triggered reload accepted");
        let _ = self.control_tx.send(ControlEvent::Reload);
    }
}

fn supervisor_error_response(err: &SupervisorError) -> Response<Body> {
    match err {
        SupervisorError::PortsExhausted(_) | SupervisorError::Capacity(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "no worker capacity").into_response()
        }
        SupervisorError::StartupTimeout { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "worker failed to start").into_response()
        }
        SupervisorError::Spawn { .. } => {
            (StatusCode::BAD_GATEWAY, "worker failed to start").into_response()
        }
    }
}

/// Minimal percent-decoding for request paths; invalid escapes are left
/// untouched rather than rejected.
fn decode_path(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let Some(hex) = bytes.get(i + 1..i + 3) {
                if let Ok(value) = u8::from_str_radix(std::str::from_utf8(hex).unwrap_or(""), 16) {
                    out.push(value);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).unwrap_or_else(|_| path.to_string())
}
