//! CGI script execution.
//!
//! A matched rule spawns its script with the standard CGI/1.1 environment,
//! feeds the request body on stdin, parses the script's header block from
//! stdout (honouring `Status:`), and streams the remaining output as the
//! response body. The child is killed if the client goes away mid-response.
//!
//! A script may ask for a configuration reload by emitting an
//! `X-Navigator-Reload: <config-path>` header; the dispatcher decides
//! whether the rule is allowed to use it.

use crate::config::CgiRule;
use axum::body::Body;
use axum::http::{header::HeaderName, HeaderValue, Request, Response, StatusCode};
use axum::response::IntoResponse;
use std::net::SocketAddr;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

/// Header a CGI script uses to request a configuration reload.
pub const RELOAD_HEADER: &str = "x-navigator-reload";

const MAX_REQUEST_BODY: usize = 10 * 1024 * 1024;

/// Result of a CGI invocation: the response plus any reload request the
/// script made (unvalidated — the dispatcher applies policy).
pub struct CgiOutcome {
    pub response: Response<Body>,
    pub reload_request: Option<String>,
}

impl CgiOutcome {
    fn plain(status: StatusCode, msg: &'static str) -> Self {
        Self {
            response: (status, msg).into_response(),
            reload_request: None,
        }
    }
}

pub async fn run(rule: &CgiRule, req: Request<Body>, peer: SocketAddr) -> CgiOutcome {
    let (parts, body) = req.into_parts();

    let body_bytes = match axum::body::to_bytes(body, MAX_REQUEST_BODY).await {
        Ok(b) => b,
        Err(e) => {
            warn!(script = %rule.script.display(), err = %e, "cgi request body read failed");
            return CgiOutcome::plain(StatusCode::BAD_REQUEST, "request body too large");
        }
    };

    let path = parts.uri.path();
    let path_info = path.strip_prefix(rule.path.as_str()).unwrap_or("");
    let query = parts.uri.query().unwrap_or("");

    let mut cmd = Command::new(&rule.script);
    if let Some(dir) = &rule.working_dir {
        cmd.current_dir(dir);
    }
    cmd.env("GATEWAY_INTERFACE", "CGI/1.1")
        .env("SERVER_PROTOCOL", "HTTP/1.1")
        .env("SERVER_SOFTWARE", concat!("navigator/", env!("CARGO_PKG_VERSION")))
        .env("REQUEST_METHOD", parts.method.as_str())
        .env("SCRIPT_NAME", &rule.path)
        .env("PATH_INFO", path_info)
        .env("QUERY_STRING", query)
        .env("REMOTE_ADDR", peer.ip().to_string())
        .env("CONTENT_LENGTH", body_bytes.len().to_string());

    if let Some(ct) = parts.headers.get(axum::http::header::CONTENT_TYPE) {
        if let Ok(ct) = ct.to_str() {
            cmd.env("CONTENT_TYPE", ct);
        }
    }
    for (name, value) in &parts.headers {
        let Ok(value) = value.to_str() else { continue };
        let var = format!("HTTP_{}", name.as_str().to_ascii_uppercase().replace('-', "_"));
        cmd.env(var, value);
    }

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            warn!(script = %rule.script.display(), err = %e, "cgi spawn failed");
            return CgiOutcome::plain(StatusCode::BAD_GATEWAY, "cgi script failed to start");
        }
    };

    // Feed the body from a detached task so a script that writes before it
    // reads cannot deadlock against a full stdin pipe.
    if let Some(mut stdin) = child.stdin.take() {
        tokio::spawn(async move {
            let _ = stdin.write_all(&body_bytes).await;
            drop(stdin);
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let script = rule.script.display().to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "cgi", script = %script, "{line}");
            }
        });
    }

    let Some(stdout) = child.stdout.take() else {
        return CgiOutcome::plain(StatusCode::BAD_GATEWAY, "cgi script produced no output");
    };
    let mut reader = BufReader::new(stdout);

    // ── CGI header block ─────────────────────────────────────────────────────
    let mut status = StatusCode::OK;
    let mut builder = Response::builder();
    let mut reload_request = None;
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                warn!(script = %rule.script.display(), "cgi output ended inside header block");
                return CgiOutcome::plain(StatusCode::BAD_GATEWAY, "malformed cgi response");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(script = %rule.script.display(), err = %e, "cgi read failed");
                return CgiOutcome::plain(StatusCode::BAD_GATEWAY, "cgi read failed");
            }
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            warn!(script = %rule.script.display(), line, "cgi header without colon");
            return CgiOutcome::plain(StatusCode::BAD_GATEWAY, "malformed cgi header");
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("status") {
            let code = value.split_whitespace().next().unwrap_or("");
            status = code
                .parse::<u16>()
                .ok()
                .and_then(|c| StatusCode::from_u16(c).ok())
                .unwrap_or(StatusCode::OK);
        } else if name.eq_ignore_ascii_case(RELOAD_HEADER) {
            reload_request = Some(value.to_string());
        } else if let (Ok(n), Ok(v)) = (
            name.parse::<HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(n, v);
        }
    }

    // The monitor task reaps the child once stdout is drained; tie its
    // lifetime to the body stream so client disconnect kills the script.
    let body = Body::from_stream(ChildStream {
        inner: ReaderStream::new(reader),
        _child: child,
    });

    let response = builder
        .status(status)
        .body(body)
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());

    CgiOutcome {
        response,
        reload_request,
    }
}

/// Stream adapter that owns the child so `kill_on_drop` fires when the
/// response body is dropped.
struct ChildStream {
    inner: ReaderStream<BufReader<tokio::process::ChildStdout>>,
    _child: tokio::process::Child,
}

impl futures_util::Stream for ChildStream {
    type Item = std::io::Result<bytes::Bytes>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        std::pin::Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Find the first CGI rule matching this method and path.
pub fn match_rule<'a>(rules: &'a [CgiRule], method: &str, path: &str) -> Option<&'a CgiRule> {
    rules.iter().find(|r| {
        r.methods.iter().any(|m| m == method) && path.starts_with(r.path.as_str())
    })
}
