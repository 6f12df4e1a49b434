//! Port pool — allocates worker listen ports from a fixed numeric range.
//!
//! Workers bind `127.0.0.1:<port>`; the pool hands out ports from
//! `[base, base + count)` and takes them back when a worker dies. All
//! operations are O(1) under a single mutex.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
#[error("no free ports left in range of {count} starting at {base}")]
pub struct PortsExhausted {
    pub base: u16,
    pub count: u16,
}

struct PoolInner {
    free: VecDeque<u16>,
    in_use: HashSet<u16>,
}

/// Fixed-range TCP port allocator.
///
/// The in-use set always equals the union of ports held by live workers;
/// releasing a port that was never allocated is a no-op.
pub struct PortPool {
    base: u16,
    count: u16,
    inner: Mutex<PoolInner>,
}

impl PortPool {
    pub fn new(base: u16, count: u16) -> Self {
        Self {
            base,
            count,
            inner: Mutex::new(PoolInner {
                free: (base..base + count).collect(),
                in_use: HashSet::new(),
            }),
        }
    }

    /// Pop any free port and mark it in-use.
    pub fn get(&self) -> Result<u16, PortsExhausted> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.free.pop_front() {
            Some(port) => {
                inner.in_use.insert(port);
                Ok(port)
            }
            None => Err(PortsExhausted {
                base: self.base,
                count: self.count,
            }),
        }
    }

    /// Return `port` to the free list. Ignores ports the pool never issued.
    pub fn release(&self, port: u16) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.in_use.remove(&port) {
            inner.free.push_back(port);
        }
    }

    /// Number of ports currently allocated.
    pub fn in_use(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .in_use
            .len()
    }
}
