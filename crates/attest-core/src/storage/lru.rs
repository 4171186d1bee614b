use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use tokio::sync::Notify;

/// Flush when the buffer accumulates this many distinct keys, or on the
/// periodic tick, whichever comes first.
pub(crate) const FLUSH_THRESHOLD: usize = 64;
pub(crate) const FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// Lock-free buffer of pending `accessed_at` updates. Cache reads record a
/// touch here instead of writing to disk; a single flusher task drains the
/// buffer into one transaction.
pub(crate) struct TouchBuffer<K: Eq + Hash + Clone> {
    pending: DashMap<K, i64>,
    size: AtomicUsize,
    pub(crate) kick: Notify,
}

impl<K: Eq + Hash + Clone> TouchBuffer<K> {
    pub(crate) fn new() -> Self {
        Self {
            pending: DashMap::new(),
            size: AtomicUsize::new(0),
            kick: Notify::new(),
        }
    }

    pub(crate) fn record(&self, key: K, at: i64) {
        if self.pending.insert(key, at).is_none() {
            let n = self.size.fetch_add(1, Ordering::Relaxed) + 1;
            if n >= FLUSH_THRESHOLD {
                self.kick.notify_one();
            }
        }
    }

    pub(crate) fn drain(&self) -> Vec<(K, i64)> {
        let keys: Vec<K> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut out = Vec::with_capacity(keys.len());
        for k in keys {
            if let Some((k, at)) = self.pending.remove(&k) {
                self.size.fetch_sub(1, Ordering::Relaxed);
                out.push((k, at));
            }
        }
        out
    }

    pub(crate) fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }
}
