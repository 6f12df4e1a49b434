//! Keyed single-flight locks.
//!
//! Collapses N concurrent operations for the same key into one critical
//! section while leaving other keys untouched. Used for worker cold starts
//! (one spawn per tenant no matter how many requests race in) and for
//! credential-file reloads.
//!
//! Entries are reference-counted and pruned when the last guard for a key
//! drops, so the map does not grow with the set of keys ever seen.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct Entry {
    lock: Arc<AsyncMutex<()>>,
    refs: usize,
}

#[derive(Clone, Default)]
pub struct SingleFlight {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive ownership of `key`'s critical section.
    ///
    /// The returned guard releases the section (and prunes the entry when no
    /// other task is waiting on it) on drop.
    pub async fn acquire(&self, key: &str) -> FlightGuard {
        let lock = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                lock: Arc::new(AsyncMutex::new(())),
                refs: 0,
            });
            entry.refs += 1;
            Arc::clone(&entry.lock)
        };

        let permit = lock.lock_owned().await;
        FlightGuard {
            _permit: permit,
            key: key.to_string(),
            entries: Arc::clone(&self.entries),
        }
    }

    /// Try to enter `key`'s critical section without waiting.
    ///
    /// Returns `None` when another task already holds it — the caller is the
    /// duplicate flight and should back off.
    pub fn try_acquire(&self, key: &str) -> Option<FlightGuard> {
        let lock = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                lock: Arc::new(AsyncMutex::new(())),
                refs: 0,
            });
            entry.refs += 1;
            Arc::clone(&entry.lock)
        };

        match lock.try_lock_owned() {
            Ok(permit) => Some(FlightGuard {
                _permit: permit,
                key: key.to_string(),
                entries: Arc::clone(&self.entries),
            }),
            Err(_) => {
                // Undo the ref taken above.
                release_ref(&self.entries, key);
                None
            }
        }
    }
}

fn release_ref(entries: &Mutex<HashMap<String, Entry>>, key: &str) {
    let mut entries = entries.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(entry) = entries.get_mut(key) {
        entry.refs -= 1;
        if entry.refs == 0 {
            entries.remove(key);
        }
    }
}

pub struct FlightGuard {
    _permit: OwnedMutexGuard<()>,
    key: String,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        release_ref(&self.entries, &self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_serialized() {
        let sf = SingleFlight::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sf = sf.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _guard = sf.acquire("acme").await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_run_concurrently() {
        let sf = SingleFlight::new();
        let a = sf.acquire("a").await;
        // Must not deadlock: "b" is an independent critical section.
        let b = tokio::time::timeout(Duration::from_secs(1), sf.acquire("b"))
            .await
            .expect("acquiring an unrelated key must not block");
        drop(a);
        drop(b);
    }

    #[tokio::test]
    async fn try_acquire_reports_duplicate_flight() {
        let sf = SingleFlight::new();
        let held = sf.acquire("k").await;
        assert!(sf.try_acquire("k").is_none());
        drop(held);
        assert!(sf.try_acquire("k").is_some());
    }

    #[tokio::test]
    async fn entries_are_pruned_after_use() {
        let sf = SingleFlight::new();
        drop(sf.acquire("gone").await);
        assert!(sf.entries.lock().unwrap().is_empty());
    }
}
