//! WebSocket pub/sub hub.
//!
//! Connections are owned here, arena-style: each one is a plain u64 handle
//! into the connection map, so the socket tasks never hold an owning pointer
//! back into the hub. Unregistration happens from exactly one site — the
//! reader task's exit path in [`connection`].
//!
//! Broadcast never blocks: the target id set is copied under the read lock,
//! then frames are enqueued with `try_send` against each connection's
//! bounded queue. A full queue drops the frame for that connection (and
//! logs it) rather than stalling the broadcaster.

pub mod connection;

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outbound frames queued per connection before the writer drains them.
pub const QUEUE_CAPACITY: usize = 64;

pub(crate) struct ConnectionHandle {
    sender: mpsc::Sender<String>,
    cancel: CancellationToken,
    subscribed: HashSet<String>,
}

#[derive(Default)]
struct HubInner {
    connections: HashMap<u64, ConnectionHandle>,
    streams: HashMap<String, HashSet<u64>>,
}

#[derive(Default)]
pub struct Hub {
    inner: RwLock<HubInner>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

/// Result of one broadcast: how many frames were enqueued and how many were
/// dropped against full queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    pub dropped: usize,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn register(
        &self,
        sender: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.write().await;
        inner.connections.insert(
            id,
            ConnectionHandle {
                sender,
                cancel,
                subscribed: HashSet::new(),
            },
        );
        debug!(conn = id, total = inner.connections.len(), "hub connection registered");
        id
    }

    /// Remove a connection and every stream mapping it held. Empty stream
    /// sets are pruned so the map tracks live interest only.
    pub(crate) async fn unregister(&self, id: u64) {
        let mut inner = self.inner.write().await;
        let Some(handle) = inner.connections.remove(&id) else {
            return;
        };
        for stream in &handle.subscribed {
            if let Some(set) = inner.streams.get_mut(stream) {
                set.remove(&id);
                if set.is_empty() {
                    inner.streams.remove(stream);
                }
            }
        }
        debug!(conn = id, total = inner.connections.len(), "hub connection removed");
    }

    pub(crate) async fn subscribe(&self, id: u64, stream: &str) {
        let mut inner = self.inner.write().await;
        let Some(handle) = inner.connections.get_mut(&id) else {
            return;
        };
        handle.subscribed.insert(stream.to_string());
        inner
            .streams
            .entry(stream.to_string())
            .or_default()
            .insert(id);
    }

    pub(crate) async fn unsubscribe(&self, id: u64, stream: &str) {
        let mut inner = self.inner.write().await;
        if let Some(handle) = inner.connections.get_mut(&id) {
            handle.subscribed.remove(stream);
        }
        if let Some(set) = inner.streams.get_mut(stream) {
            set.remove(&id);
            if set.is_empty() {
                inner.streams.remove(stream);
            }
        }
    }

    /// Fan a message out to every subscriber of `stream`, in enqueue order
    /// per connection. Never blocks on a slow consumer.
    pub async fn broadcast(&self, stream: &str, data: Value) -> BroadcastOutcome {
        let frame = serde_json::json!({
            "type": "message",
            "stream": stream,
            "data": data,
        })
        .to_string();

        // Copy the targets under the read lock, enqueue without it.
        let targets: Vec<(u64, mpsc::Sender<String>)> = {
            let inner = self.inner.read().await;
            let Some(ids) = inner.streams.get(stream) else {
                return BroadcastOutcome::default();
            };
            ids.iter()
                .filter_map(|id| {
                    inner
                        .connections
                        .get(id)
                        .map(|h| (*id, h.sender.clone()))
                })
                .collect()
        };

        let mut outcome = BroadcastOutcome::default();
        for (id, sender) in targets {
            match sender.try_send(frame.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(conn = id, stream, "outbound queue full — dropping frame");
                    outcome.dropped += 1;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Connection is tearing down; its reader will unregister.
                    outcome.dropped += 1;
                }
            }
        }
        outcome
    }

    /// Push one frame to a single connection (subscribe acks).
    pub(crate) async fn send_to(&self, id: u64, frame: String) {
        let sender = {
            let inner = self.inner.read().await;
            inner.connections.get(&id).map(|h| h.sender.clone())
        };
        if let Some(sender) = sender {
            let _ = sender.try_send(frame);
        }
    }

    /// Token observed by every connection task; cancelled on shutdown.
    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Close every connection: writers emit a Close frame and exit, readers
    /// exit on the next read, and each teardown unregisters itself.
    pub async fn shutdown(&self) {
        let count = self.connection_count().await;
        if count > 0 {
            info!(connections = count, "closing hub connections");
        }
        self.shutdown.cancel();
        let inner = self.inner.read().await;
        for handle in inner.connections.values() {
            handle.cancel.cancel();
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn subscriber_count(&self, stream: &str) -> usize {
        self.inner
            .read()
            .await
            .streams
            .get(stream)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub async fn stream_count(&self) -> usize {
        self.inner.read().await.streams.len()
    }
}
