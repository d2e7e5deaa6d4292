//! Keyed completion handles with a deadline.
//!
//! Backs every "request now, resolve later, fail on timeout" exchange: peer
//! task round-trips and oracle calls. Each entry resolves exactly once, by a
//! response, by its deadline, or by a bulk failure/cancellation.

use crate::error::{ColonyError, ColonyResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct Pending<T> {
    sender: oneshot::Sender<ColonyResult<T>>,
    timer: JoinHandle<()>,
}

/// Resolution counters for a [`CompletionMap`].
#[derive(Debug, Default)]
pub struct CompletionStats {
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl CompletionStats {
    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Receiving side of a registered completion.
pub struct CompletionHandle<T> {
    rx: oneshot::Receiver<ColonyResult<T>>,
}

impl<T> CompletionHandle<T> {
    /// Wait for the entry to resolve. A cancelled entry yields [`ColonyError::Cancelled`].
    pub async fn wait(self) -> ColonyResult<T> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(ColonyError::Cancelled("completion dropped".to_string())),
        }
    }
}

/// Map of outstanding completions keyed by request id.
pub struct CompletionMap<K, T> {
    pending: Arc<Mutex<HashMap<K, Pending<T>>>>,
    stats: Arc<CompletionStats>,
}

impl<K, T> Clone for CompletionMap<K, T> {
    fn clone(&self) -> Self {
        Self {
            pending: self.pending.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<K, T> Default for CompletionMap<K, T> {
    fn default() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(CompletionStats::default()),
        }
    }
}

impl<K, T> CompletionMap<K, T>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    T: Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key` and arm its deadline timer.
    ///
    /// When the deadline passes first, the entry resolves with the error built
    /// by `on_timeout`. Registering a key that is already pending cancels the
    /// earlier entry.
    pub fn register<F>(&self, key: K, deadline: Duration, on_timeout: F) -> CompletionHandle<T>
    where
        F: FnOnce() -> ColonyError + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let map = self.clone();
        let timer_key = key.clone();

        // The timer is armed under the lock so it can never observe the map
        // before its own entry is inserted.
        let mut pending = self.pending.lock();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            map.resolve(&timer_key, Err(on_timeout()));
        });
        let previous = pending.insert(
            key,
            Pending {
                sender: tx,
                timer,
            },
        );
        drop(pending);

        if let Some(prev) = previous {
            prev.timer.abort();
            self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
        }
        CompletionHandle { rx }
    }

    /// Resolve a pending entry. Returns `false` if the key is unknown or already resolved.
    pub fn resolve(&self, key: &K, result: ColonyResult<T>) -> bool {
        let Some(entry) = self.pending.lock().remove(key) else {
            return false;
        };
        entry.timer.abort();
        if result.is_ok() {
            self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
        }
        let _ = entry.sender.send(result);
        true
    }

    /// Fail every pending entry with an error built by `make_err`. Returns how many were failed.
    pub fn fail_all<F>(&self, make_err: F) -> usize
    where
        F: Fn() -> ColonyError,
    {
        let drained: Vec<Pending<T>> = self.pending.lock().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for entry in drained {
            entry.timer.abort();
            let _ = entry.sender.send(Err(make_err()));
        }
        self.stats.failed.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// Drop every pending entry without a result. Waiters see [`ColonyError::Cancelled`].
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Pending<T>> = self.pending.lock().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for entry in drained {
            entry.timer.abort();
        }
        self.stats.cancelled.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    pub fn contains(&self, key: &K) -> bool {
        self.pending.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn stats(&self) -> &CompletionStats {
        &self.stats
    }
}
