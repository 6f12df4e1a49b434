//! Worker supervisor.
//!
//! Owns the `tenant label → worker` table and everything about worker
//! lifetime: demand-driven startup (single-flighted per label), readiness
//! probing, crash observation, graceful shutdown, reload diffing, and the
//! periodic idle sweep.
//!
//! Locking rules: the table lock is only ever held for map operations —
//! never across a spawn, a readiness probe, or a wait. Cold-start mutual
//! exclusion comes from the per-label single-flight instead, so concurrent
//! requests for *different* cold tenants start their workers in parallel.

pub mod worker;

use crate::config::{Config, Tenant};
use crate::ports::PortPool;
use crate::singleflight::SingleFlight;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use worker::{Worker, WorkerState};

/// How long a SIGTERM'd worker gets before SIGKILL.
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(10);
/// Idle sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("no ports available for tenant {0:?}")]
    PortsExhausted(String),
    #[error("worker capacity ({0}) reached")]
    Capacity(usize),
    #[error("failed to start worker for tenant {label:?}: {source}")]
    Spawn {
        label: String,
        source: std::io::Error,
    },
    #[error("worker for tenant {label:?} not ready within {timeout:?}")]
    StartupTimeout { label: String, timeout: Duration },
}

pub struct WorkerSupervisor {
    workers: RwLock<HashMap<String, Arc<Worker>>>,
    starts: SingleFlight,
    ports: PortPool,
    epoch: Instant,
    /// 0 = unlimited. Updated on reload.
    max_workers: AtomicUsize,
    /// Milliseconds. Updated on reload.
    idle_timeout_ms: AtomicUsize,
}

impl WorkerSupervisor {
    pub fn new(config: &Config) -> Arc<Self> {
        Arc::new(Self {
            workers: RwLock::new(HashMap::new()),
            starts: SingleFlight::new(),
            ports: PortPool::new(config.port_base, config.port_count),
            epoch: Instant::now(),
            max_workers: AtomicUsize::new(config.max_workers),
            idle_timeout_ms: AtomicUsize::new(config.idle_timeout.as_millis() as usize),
        })
    }

    /// Return the live worker for `tenant`, starting one if needed. Touches
    /// `last_used` on every call.
    pub async fn acquire(
        self: &Arc<Self>,
        tenant: &Tenant,
    ) -> Result<Arc<Worker>, SupervisorError> {
        if let Some(w) = self.live_worker(&tenant.label).await {
            w.touch(self.epoch);
            return Ok(w);
        }

        // Cold path: exactly one start per label, however many requests race.
        let _flight = self.starts.acquire(&tenant.label).await;

        // A racing request may have finished the start while we waited.
        if let Some(w) = self.live_worker(&tenant.label).await {
            w.touch(self.epoch);
            return Ok(w);
        }

        self.start_worker(tenant).await
    }

    /// Fetch a table entry and verify the process is actually there; a
    /// record whose process vanished is cleaned up on the spot.
    async fn live_worker(&self, label: &str) -> Option<Arc<Worker>> {
        let worker = self.workers.read().await.get(label).cloned()?;
        match worker.state() {
            WorkerState::Running if worker.alive() => Some(worker),
            WorkerState::Running => {
                warn!(label, pid = worker.pid, "worker process vanished — clearing record");
                self.remove_worker(&worker).await;
                None
            }
            _ => None,
        }
    }

    async fn start_worker(
        self: &Arc<Self>,
        tenant: &Tenant,
    ) -> Result<Arc<Worker>, SupervisorError> {
        let max = self.max_workers.load(Ordering::Relaxed);
        if max != 0 && self.workers.read().await.len() >= max {
            return Err(SupervisorError::Capacity(max));
        }

        let port = self
            .ports
            .get()
            .map_err(|_| SupervisorError::PortsExhausted(tenant.label.clone()))?;

        info!(label = %tenant.label, port, "starting worker");
        let mut child = match worker::spawn_child(tenant, port) {
            Ok(c) => c,
            Err(source) => {
                self.ports.release(port);
                return Err(SupervisorError::Spawn {
                    label: tenant.label.clone(),
                    source,
                });
            }
        };
        worker::drain_output(tenant, &mut child);
        let pid = child.id().unwrap_or(0);

        if !worker::probe_ready(port, tenant.startup_timeout).await {
            error!(label = %tenant.label, port, timeout_secs = tenant.startup_timeout.as_secs(), "worker never became ready");
            let _ = child.start_kill();
            let _ = child.wait().await;
            self.ports.release(port);
            return Err(SupervisorError::StartupTimeout {
                label: tenant.label.clone(),
                timeout: tenant.startup_timeout,
            });
        }

        let record = Arc::new(Worker::new(
            &tenant.label,
            port,
            pid,
            tenant.clone(),
            self.epoch,
        ));
        record.set_state(WorkerState::Running);
        self.workers
            .write()
            .await
            .insert(tenant.label.clone(), Arc::clone(&record));
        info!(label = %tenant.label, port, pid, "worker ready");

        // Monitor: observes exit for every path (crash, SIGTERM, SIGKILL)
        // and is the single place that releases the port and the record.
        let supervisor = Arc::clone(self);
        let monitored = Arc::clone(&record);
        tokio::spawn(async move {
            let status = child.wait().await;
            match status {
                Ok(s) if s.success() => {
                    info!(label = %monitored.label, pid = monitored.pid, "worker exited cleanly")
                }
                Ok(s) => {
                    warn!(label = %monitored.label, pid = monitored.pid, status = %s, "worker exited")
                }
                Err(e) => {
                    error!(label = %monitored.label, pid = monitored.pid, err = %e, "worker wait failed")
                }
            }
            supervisor.remove_worker(&monitored).await;
        });

        Ok(record)
    }

    /// Remove `worker`'s record (if it is still the installed one) and
    /// release its port. Idempotent.
    async fn remove_worker(&self, worker: &Arc<Worker>) {
        let mut table = self.workers.write().await;
        if let Some(current) = table.get(&worker.label) {
            if Arc::ptr_eq(current, worker) {
                table.remove(&worker.label);
            }
        }
        drop(table);
        if worker.claim_cleanup() {
            self.ports.release(worker.port);
        }
        worker.mark_exited();
    }

    /// Graceful stop: SIGTERM, wait up to 10 s, then SIGKILL.
    pub async fn shutdown(&self, label: &str) {
        let Some(worker) = self.workers.read().await.get(label).cloned() else {
            return;
        };
        if worker.state() == WorkerState::Stopping {
            return;
        }
        worker.set_state(WorkerState::Stopping);
        worker.send_term();

        if !worker.wait_exit(GRACEFUL_STOP_TIMEOUT).await {
            worker.send_kill();
            if !worker.wait_exit(Duration::from_secs(2)).await {
                // The monitor still owns cleanup; just make the state visible.
                error!(label, pid = worker.pid, "worker ignored SIGKILL observation window");
            }
        }
        debug!(label, "worker shutdown complete");
    }

    /// Stop every worker in parallel, bounded by `deadline`.
    pub async fn shutdown_all(self: &Arc<Self>, deadline: Duration) {
        let labels: Vec<String> = self.workers.read().await.keys().cloned().collect();
        if labels.is_empty() {
            return;
        }
        info!(count = labels.len(), "shutting down all workers");
        let mut handles = Vec::with_capacity(labels.len());
        for label in labels {
            let supervisor = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                supervisor.shutdown(&label).await;
            }));
        }
        let _ = tokio::time::timeout(deadline, async {
            for h in handles {
                let _ = h.await;
            }
        })
        .await;
    }

    /// Immediate termination path: SIGKILL everything, no grace.
    pub async fn kill_all(&self) {
        let snapshot: Vec<Arc<Worker>> = self.workers.read().await.values().cloned().collect();
        for worker in snapshot {
            worker.send_kill();
        }
    }

    /// Apply a new snapshot: tenants that disappeared or changed command get
    /// their workers stopped; surviving tenants keep theirs.
    pub async fn on_reload(self: &Arc<Self>, new: &Config) {
        self.max_workers.store(new.max_workers, Ordering::Relaxed);
        self.idle_timeout_ms
            .store(new.idle_timeout.as_millis() as usize, Ordering::Relaxed);

        let current: Vec<Arc<Worker>> = self.workers.read().await.values().cloned().collect();
        for worker in current {
            let stale = match new.tenant(&worker.label) {
                None => {
                    info!(label = %worker.label, "tenant removed from config — stopping worker");
                    true
                }
                Some(tenant) if tenant.command_changed(&worker.spec) => {
                    info!(label = %worker.label, "tenant command changed — stopping worker");
                    true
                }
                Some(_) => false,
            };
            if stale {
                let supervisor = Arc::clone(self);
                let label = worker.label.clone();
                tokio::spawn(async move {
                    supervisor.shutdown(&label).await;
                });
            }
        }
    }

    /// Periodic idle eviction. Runs until the supervisor is dropped; spawn
    /// once from the lifecycle controller.
    pub async fn idle_sweep_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            self.sweep_idle().await;
        }
    }

    /// One sweep pass: snapshot the table under the read lock, then stop
    /// idle-eligible workers past the timeout without holding it.
    pub async fn sweep_idle(self: &Arc<Self>) {
        let idle_timeout =
            Duration::from_millis(self.idle_timeout_ms.load(Ordering::Relaxed) as u64);
        let snapshot: Vec<Arc<Worker>> = self.workers.read().await.values().cloned().collect();

        for worker in snapshot {
            if !worker.spec.idle_eligible || worker.state() != WorkerState::Running {
                continue;
            }
            let idle = worker.idle_for(self.epoch);
            if idle >= idle_timeout {
                info!(label = %worker.label, idle_secs = idle.as_secs(), "idle worker — evicting");
                self.shutdown(&worker.label).await;
            }
        }
    }

    // ── Introspection (dispatcher, tests) ────────────────────────────────────

    pub async fn running_count(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn worker_port(&self, label: &str) -> Option<u16> {
        self.workers.read().await.get(label).map(|w| w.port)
    }

    pub async fn worker_pid(&self, label: &str) -> Option<u32> {
        self.workers.read().await.get(label).map(|w| w.pid)
    }

    pub fn ports_in_use(&self) -> usize {
        self.ports.in_use()
    }
}
