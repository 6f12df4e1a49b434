//! Lifecycle controller.
//!
//! Owns the listening socket, the dispatcher pointer, and the control
//! channel. Signals, hook outcomes, and CGI reload requests all arrive as
//! typed [`ControlEvent`]s on one channel, and a single linear event loop
//! multiplexes them with server failure — signal handlers themselves stay
//! tiny (see [`signals`]).
//!
//! Reload is an atomic pointer swap: a fresh dispatcher is built against the
//! new snapshot (after the supervisor diff and the start hooks) and installed
//! behind the [`SharedDispatcher`] lock. Requests already running keep their
//! old `Arc`; requests accepted after the swap see only the new snapshot. A
//! snapshot that fails to parse leaves everything untouched.

pub mod signals;

use crate::auth::AuthVerifier;
use crate::config::{self, Config};
use crate::dispatch::Dispatcher;
use crate::hooks;
use crate::hub::Hub;
use crate::logging;
use crate::pidfile;
use crate::proxy::ProxyEngine;
use crate::supervisor::WorkerSupervisor;
use anyhow::{Context as _, Result};
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{Request, Response};
use axum::Router;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Ceiling for draining in-flight requests and stopping workers.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Typed control-plane events, whatever their origin (signal, hook, CGI).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Reload,
    Graceful,
    Immediate,
}

/// The dispatcher pointer the accept path reads. Readers take the lock only
/// long enough to clone the `Arc`; the write side is the reload swap.
#[derive(Clone)]
pub struct SharedDispatcher {
    inner: Arc<RwLock<Arc<Dispatcher>>>,
}

impl SharedDispatcher {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(dispatcher)),
        }
    }

    pub fn current(&self) -> Arc<Dispatcher> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn swap(&self, dispatcher: Arc<Dispatcher>) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = dispatcher;
    }
}

async fn dispatch_request(
    State(shared): State<SharedDispatcher>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response<Body> {
    // The clone pins this request to whatever snapshot was live when it
    // arrived; a concurrent reload cannot change it mid-flight.
    shared.current().handle(req, peer).await
}

/// Build the axum application: every request funnels through the dispatcher
/// behind the swappable pointer.
pub fn router(shared: SharedDispatcher) -> Router {
    Router::new().fallback(dispatch_request).with_state(shared)
}

struct Controller {
    config: Arc<Config>,
    shared: SharedDispatcher,
    supervisor: Arc<WorkerSupervisor>,
    proxy: Arc<ProxyEngine>,
    hub: Arc<Hub>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
}

impl Controller {
    fn build_dispatcher(&self, snapshot: Arc<Config>) -> Arc<Dispatcher> {
        let auth = Arc::new(AuthVerifier::new(snapshot.auth.clone()));
        Arc::new(Dispatcher::new(
            snapshot,
            auth,
            Arc::clone(&self.supervisor),
            Arc::clone(&self.proxy),
            Arc::clone(&self.hub),
            self.control_tx.clone(),
        ))
    }

    /// The reload protocol of one atomic step. Any failure before the swap
    /// leaves the current snapshot serving.
    async fn reload(&mut self) {
        info!(config = %self.config.source.display(), "reload started");
        let new = match config::load(&self.config.source) {
            Ok(c) => Arc::new(c),
            Err(e) => {
                error!(err = %e, "reload failed — keeping current configuration");
                return;
            }
        };

        if new.listen != self.config.listen {
            warn!(
                old = %self.config.listen,
                new = %new.listen,
                "listen address changed — ignored until restart"
            );
        }
        if new.port_base != self.config.port_base || new.port_count != self.config.port_count {
            warn!("worker port range changed — ignored until restart");
        }

        // Stop workers whose tenants vanished or changed; update limits.
        self.supervisor.on_reload(&new).await;
        // Refresh the process-wide proxy knobs and the log level.
        self.proxy.apply_config(&new);
        logging::set_level(&logging::resolve_level(new.log_level.as_deref()));

        // Start hooks run before the auth verifier is rebuilt: they are
        // allowed to rewrite the credential file the verifier will read.
        hooks::run_hooks("start", &new.hooks.start).await;

        let dispatcher = self.build_dispatcher(Arc::clone(&new));
        self.shared.swap(dispatcher);
        self.config = new;
        info!("reload complete — new snapshot installed");

        self.spawn_ready_hooks();
    }

    /// Ready hooks never block the caller; one marked `reload: true` that
    /// succeeds feeds a reload event back into the loop.
    fn spawn_ready_hooks(&self) {
        let ready = self.config.hooks.ready.clone();
        if ready.is_empty() {
            return;
        }
        let tx = self.control_tx.clone();
        tokio::spawn(async move {
            if hooks::run_hooks("ready", &ready).await {
                info!("ready hook rewrote the configuration — scheduling reload");
                let _ = tx.send(ControlEvent::Reload);
            }
        });
    }
}

/// Run the server until a termination signal. `config` is the validated
/// startup snapshot; logging is already installed by the caller.
pub async fn run(config: Config) -> Result<()> {
    let config = Arc::new(config);

    if let Some(path) = &config.pidfile {
        pidfile::write(path).with_context(|| format!("writing pid file {}", path.display()))?;
    }

    let (control_tx, mut control_rx) = mpsc::unbounded_channel();
    signals::spawn(control_tx.clone());

    let proxy = Arc::new(ProxyEngine::new().context("building upstream client")?);
    proxy.apply_config(&config);
    let supervisor = WorkerSupervisor::new(&config);
    let hub = Arc::new(Hub::new());

    let mut controller = Controller {
        config: Arc::clone(&config),
        shared: SharedDispatcher::new(Arc::new(Dispatcher::new(
            Arc::clone(&config),
            Arc::new(AuthVerifier::new(config.auth.clone())),
            Arc::clone(&supervisor),
            Arc::clone(&proxy),
            Arc::clone(&hub),
            control_tx.clone(),
        ))),
        supervisor: Arc::clone(&supervisor),
        proxy: Arc::clone(&proxy),
        hub: Arc::clone(&hub),
        control_tx: control_tx.clone(),
    };

    let sweep = tokio::spawn(Arc::clone(&supervisor).idle_sweep_loop());

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    info!(
        addr = %config.listen,
        version = env!("CARGO_PKG_VERSION"),
        "navigator listening"
    );

    let app = router(controller.shared.clone());

    let (drain_tx, mut drain_rx) = watch::channel(false);
    let mut server_task = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = drain_rx.changed().await;
        })
        .await
    });

    // The socket is up: announce through the ready hooks.
    controller.spawn_ready_hooks();

    // ── Event loop ───────────────────────────────────────────────────────────
    // The JoinHandle must not be polled again once the server branch fired.
    let mut server_done = false;
    let outcome = loop {
        tokio::select! {
            biased;

            event = control_rx.recv() => match event {
                Some(ControlEvent::Reload) => controller.reload().await,
                Some(ControlEvent::Graceful) | None => break ControlEvent::Graceful,
                Some(ControlEvent::Immediate) => break ControlEvent::Immediate,
            },

            result = &mut server_task => {
                server_done = true;
                match result {
                    Ok(Ok(())) => info!("server loop ended"),
                    Ok(Err(e)) => error!(err = %e, "server loop failed"),
                    Err(e) => error!(err = %e, "server task panicked"),
                }
                break ControlEvent::Graceful;
            }
        }
    };

    sweep.abort();

    match outcome {
        ControlEvent::Immediate => {
            info!("immediate shutdown — dropping connections and killing workers");
            server_task.abort();
            hub.shutdown().await;
            supervisor.kill_all().await;
        }
        _ => {
            info!(
                timeout_secs = GRACEFUL_SHUTDOWN_TIMEOUT.as_secs(),
                "graceful shutdown — draining in-flight requests"
            );
            let deadline = Instant::now() + GRACEFUL_SHUTDOWN_TIMEOUT;
            if !server_done {
                let _ = drain_tx.send(true);
                if tokio::time::timeout_at(deadline, &mut server_task)
                    .await
                    .is_err()
                {
                    warn!("in-flight requests did not drain in time — aborting server task");
                    server_task.abort();
                }
            }
            hub.shutdown().await;
            let remaining = deadline.saturating_duration_since(Instant::now());
            supervisor
                .shutdown_all(remaining.max(Duration::from_secs(1)))
                .await;
        }
    }

    if let Some(path) = &config.pidfile {
        pidfile::remove(path);
    }
    info!("navigator stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn test_config(dir: &tempfile::TempDir, yaml: &str) -> Config {
        let path = dir.path().join("navigator.yml");
        std::fs::write(&path, yaml).unwrap();
        config::load(&path).unwrap()
    }

    fn build_shared(config: &Arc<Config>) -> (SharedDispatcher, Controller) {
        let (control_tx, _rx) = unbounded_channel();
        let proxy = Arc::new(ProxyEngine::new().unwrap());
        let supervisor = WorkerSupervisor::new(config);
        let hub = Arc::new(Hub::new());
        let controller = Controller {
            config: Arc::clone(config),
            shared: SharedDispatcher::new(Arc::new(Dispatcher::new(
                Arc::clone(config),
                Arc::new(AuthVerifier::new(config.auth.clone())),
                Arc::clone(&supervisor),
                Arc::clone(&proxy),
                Arc::clone(&hub),
                control_tx.clone(),
            ))),
            supervisor,
            proxy,
            hub,
            control_tx,
        };
        (controller.shared.clone(), controller)
    }

    #[tokio::test]
    async fn reload_swaps_snapshot_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(
            &dir,
            "listen: \"127.0.0.1:0\"\nmaintenance:\n  enabled: false\n",
        ));
        let (shared, mut controller) = build_shared(&config);

        // A request in flight holds the old snapshot.
        let pinned = shared.current();
        assert!(!pinned.snapshot.maintenance);

        std::fs::write(
            &config.source,
            "listen: \"127.0.0.1:0\"\nmaintenance:\n  enabled: true\n",
        )
        .unwrap();
        controller.reload().await;

        // New arrivals see the new snapshot; the pinned clone is untouched.
        assert!(shared.current().snapshot.maintenance);
        assert!(!pinned.snapshot.maintenance);
    }

    #[tokio::test]
    async fn failed_reload_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(&dir, "listen: \"127.0.0.1:0\"\n"));
        let (shared, mut controller) = build_shared(&config);
        let before = shared.current();

        std::fs::write(&config.source, "listen: [broken\n").unwrap();
        controller.reload().await;

        assert!(Arc::ptr_eq(&before, &shared.current()));
    }

    #[tokio::test]
    async fn reload_with_unchanged_file_installs_equivalent_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(
            &dir,
            "listen: \"127.0.0.1:0\"\nworkers:\n  idle_timeout_secs: 123\n",
        ));
        let (shared, mut controller) = build_shared(&config);

        controller.reload().await;
        let after = shared.current();
        assert_eq!(after.snapshot.idle_timeout, Duration::from_secs(123));
        assert_eq!(after.snapshot.listen, config.listen);
    }
}
