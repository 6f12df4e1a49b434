//! Worker records and child-process plumbing.
//!
//! A worker is one child process serving one tenant on `127.0.0.1:<port>`.
//! The port is injected by substituting `$PORT` / `${PORT}` into the
//! tenant's argv and environment templates. Stdout and stderr are drained
//! line-by-line into the tracing log under the tenant's label.

use crate::config::Tenant;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Stopping,
    Gone,
}

#[derive(Debug)]
pub struct Worker {
    pub label: String,
    pub port: u16,
    pub pid: u32,
    /// Tenant definition the worker was spawned from; compared on reload to
    /// decide whether the running process is stale.
    pub spec: Tenant,
    pub started_at: Instant,
    /// Milliseconds since the supervisor epoch; updated on every acquire.
    last_used_ms: AtomicU64,
    state: Mutex<WorkerState>,
    exit_tx: watch::Sender<bool>,
    /// Whether port release has been claimed. Cleanup can be reached from
    /// both the liveness check and the monitor; the port must go back to
    /// the pool exactly once.
    cleaned: AtomicBool,
}

impl Worker {
    pub fn new(label: &str, port: u16, pid: u32, spec: Tenant, epoch: Instant) -> Self {
        let (exit_tx, _) = watch::channel(false);
        let worker = Self {
            label: label.to_string(),
            port,
            pid,
            spec,
            started_at: Instant::now(),
            last_used_ms: AtomicU64::new(0),
            state: Mutex::new(WorkerState::Starting),
            exit_tx,
            cleaned: AtomicBool::new(false),
        };
        worker.touch(epoch);
        worker
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_state(&self, state: WorkerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn touch(&self, epoch: Instant) {
        let now = Instant::now().duration_since(epoch).as_millis() as u64;
        self.last_used_ms.store(now, Ordering::Relaxed);
    }

    /// Age of the last use relative to `epoch`.
    pub fn idle_for(&self, epoch: Instant) -> Duration {
        let now = Instant::now().duration_since(epoch).as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_used_ms.load(Ordering::Relaxed)))
    }

    /// First caller wins the right to release this worker's port.
    pub fn claim_cleanup(&self) -> bool {
        !self.cleaned.swap(true, Ordering::SeqCst)
    }

    /// Mark the process exited; wakes anyone blocked in [`Worker::wait_exit`].
    pub fn mark_exited(&self) {
        self.set_state(WorkerState::Gone);
        self.exit_tx.send_replace(true);
    }

    /// Wait until the monitor observes the child exit, bounded by `timeout`.
    /// Returns true when the exit was observed.
    pub async fn wait_exit(&self, timeout: Duration) -> bool {
        let mut rx = self.exit_tx.subscribe();
        if *rx.borrow() {
            return true;
        }
        tokio::time::timeout(timeout, async {
            while rx.changed().await.is_ok() {
                if *rx.borrow() {
                    return;
                }
            }
        })
        .await
        .is_ok()
    }

    /// Cheap liveness probe: signal 0 checks the pid without touching it.
    /// A zero pid means the child was already gone at spawn time — never
    /// pass it to kill(2), where it would address our own process group.
    #[cfg(unix)]
    pub fn alive(&self) -> bool {
        self.pid != 0 && unsafe { libc::kill(self.pid as libc::pid_t, 0) == 0 }
    }

    #[cfg(not(unix))]
    pub fn alive(&self) -> bool {
        self.state() == WorkerState::Running
    }

    #[cfg(unix)]
    pub fn send_term(&self) {
        if self.pid == 0 {
            return;
        }
        debug!(label = %self.label, pid = self.pid, "sending SIGTERM");
        unsafe {
            libc::kill(self.pid as libc::pid_t, libc::SIGTERM);
        }
    }

    #[cfg(unix)]
    pub fn send_kill(&self) {
        if self.pid == 0 {
            return;
        }
        info!(label = %self.label, pid = self.pid, "sending SIGKILL");
        unsafe {
            libc::kill(self.pid as libc::pid_t, libc::SIGKILL);
        }
    }

    #[cfg(not(unix))]
    pub fn send_term(&self) {
        debug!(label = %self.label, pid = self.pid, "graceful stop unsupported on this platform");
    }

    #[cfg(not(unix))]
    pub fn send_kill(&self) {
        info!(label = %self.label, pid = self.pid, "kill requested — relying on monitor cleanup");
    }
}

/// Substitute `$PORT` / `${PORT}` in a template string.
pub fn substitute_port(template: &str, port: u16) -> String {
    template
        .replace("${PORT}", &port.to_string())
        .replace("$PORT", &port.to_string())
}

/// Spawn the tenant's command with the allocated port woven into argv and
/// environment. Streams are piped; [`drain_output`] forwards them to the log.
pub fn spawn_child(tenant: &Tenant, port: u16) -> std::io::Result<Child> {
    let argv: Vec<String> = tenant
        .command
        .iter()
        .map(|a| substitute_port(a, port))
        .collect();
    let Some((program, args)) = argv.split_first() else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "tenant command is empty",
        ));
    };

    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(dir) = &tenant.dir {
        cmd.current_dir(dir);
    }
    for (key, value) in &tenant.env {
        cmd.env(key, substitute_port(value, port));
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    cmd.spawn()
}

/// Forward the child's stdout/stderr, tagged with the tenant: into the
/// tenant's own log file when one is configured, otherwise into the server
/// log.
pub fn drain_output(tenant: &Tenant, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(copy_lines(
            tenant.label.clone(),
            tenant.log_file.clone(),
            stdout,
            "stdout",
        ));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(copy_lines(
            tenant.label.clone(),
            tenant.log_file.clone(),
            stderr,
            "stderr",
        ));
    }
}

async fn copy_lines<R>(
    label: String,
    log_file: Option<std::path::PathBuf>,
    reader: R,
    stream: &'static str,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let mut sink = match &log_file {
        Some(path) => match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
        {
            Ok(f) => Some(f),
            Err(e) => {
                warn!(tenant = %label, path = %path.display(), err = %e,
                    "cannot open tenant log file — routing to server log");
                None
            }
        },
        None => None,
    };

    let mut lines = tokio::io::BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match &mut sink {
            Some(file) => {
                let _ = file.write_all(line.as_bytes()).await;
                let _ = file.write_all(b"\n").await;
            }
            None => info!(target: "worker", tenant = %label, stream, "{line}"),
        }
    }
}

/// Readiness probe: dial `127.0.0.1:<port>` every 100 ms until the first
/// connection succeeds or `timeout` elapses.
pub async fn probe_ready(port: u16, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let addr = ("127.0.0.1", port);
    loop {
        match TcpStream::connect(addr).await {
            Ok(_) => return true,
            Err(_) if Instant::now() >= deadline => return false,
            Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
}
