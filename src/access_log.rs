//! Access log.
//!
//! One structured record per completed request: a `tracing` event on the
//! dedicated `access` target, plus an optional JSON-lines file sink.
//!
//! Completion is tracked by a guard. The dispatcher creates a [`RequestLog`]
//! when a request enters and calls [`RequestLog::finish`] when a response
//! head is produced. If the client disconnects first, hyper drops the
//! request future — and with it the guard — so the `Drop` impl records the
//! synthetic 499 with the `client_closed` classification. That makes the
//! guard the single site that can emit a record, exactly once.

use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Synthetic status for "client closed the connection before a response was
/// committed" (nginx convention).
pub const STATUS_CLIENT_CLOSED: u16 = 499;

pub struct AccessLog {
    file: Option<Mutex<File>>,
}

impl AccessLog {
    pub fn new(path: Option<&Path>) -> Self {
        let file = path.and_then(|p| {
            match OpenOptions::new().create(true).append(true).open(p) {
                Ok(f) => Some(Mutex::new(f)),
                Err(e) => {
                    warn!(path = %p.display(), err = %e, "cannot open access log — logging to tracing only");
                    None
                }
            }
        });
        Self { file }
    }

    /// Begin a request record. The returned guard must be finished with the
    /// response status; dropping it unfinished records a 499.
    pub fn start(
        self: &Arc<Self>,
        method: &str,
        path: &str,
        remote: &str,
        user_agent: Option<&str>,
    ) -> RequestLog {
        RequestLog {
            sink: Arc::clone(self),
            request_id: Uuid::new_v4().to_string(),
            method: method.to_string(),
            path: path.to_string(),
            remote: remote.to_string(),
            user_agent: user_agent.map(str::to_string),
            started: Instant::now(),
            completed: false,
        }
    }

    fn emit(&self, record: &RequestLog, status: u16, response_type: &str) {
        let duration_ms = record.started.elapsed().as_millis() as u64;
        info!(
            target: "access",
            method = %record.method,
            path = %record.path,
            remote = %record.remote,
            status,
            duration_ms,
            user_agent = record.user_agent.as_deref().unwrap_or("-"),
            request_id = %record.request_id,
            response_type,
        );

        if let Some(file) = &self.file {
            let line = serde_json::json!({
                "ts": Utc::now().to_rfc3339(),
                "request_id": record.request_id,
                "method": record.method,
                "path": record.path,
                "remote_addr": record.remote,
                "status": status,
                "duration_ms": duration_ms,
                "user_agent": record.user_agent,
                "response_type": response_type,
            });
            let mut file = file.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = writeln!(file, "{line}") {
                warn!(err = %e, "access log write failed");
            }
        }
    }
}

pub struct RequestLog {
    sink: Arc<AccessLog>,
    request_id: String,
    method: String,
    path: String,
    remote: String,
    user_agent: Option<String>,
    started: Instant,
    completed: bool,
}

impl RequestLog {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Record the response. Consumes the guard so a record is emitted once.
    pub fn finish(mut self, status: u16, response_type: &str) {
        self.completed = true;
        self.sink.emit(&self, status, response_type);
    }
}

impl Drop for RequestLog {
    fn drop(&mut self) {
        if !self.completed {
            self.sink.emit(self, STATUS_CLIENT_CLOSED, "client_closed");
        }
    }
}
