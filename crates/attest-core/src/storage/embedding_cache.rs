use std::sync::{Arc, Mutex};

use rusqlite::params;
use tokio::task::JoinHandle;

use crate::embeddings::{decode_vec_f32, encode_vec_f32, sha256_hex};
use crate::storage::lru::{TouchBuffer, FLUSH_INTERVAL};
use crate::storage::{now_ms, Store};

/// Fixed per-row overhead (integer columns) used in the size estimate.
const ROW_OVERHEAD: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: u64,
    pub total_bytes: u64,
}

type Key = (String, String);

/// Disk-backed, size-bounded store of embedding vectors keyed by
/// `(sha256(text), model)`. Reads are non-blocking with respect to LRU
/// accounting: access times go through a pending buffer drained by a
/// background flusher (every 5 s or at 64 entries).
pub struct EmbeddingCache {
    store: Store,
    touches: Arc<TouchBuffer<Key>>,
    max_bytes: i64,
    shutdown: Arc<tokio::sync::Notify>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl EmbeddingCache {
    pub fn new(store: Store, max_mb: u64) -> Self {
        let touches = Arc::new(TouchBuffer::new());
        let shutdown = Arc::new(tokio::sync::Notify::new());
        let flusher = spawn_flusher(store.clone(), touches.clone(), shutdown.clone());
        Self {
            store,
            touches,
            max_bytes: (max_mb as i64) * 1024 * 1024,
            shutdown,
            flusher: Mutex::new(Some(flusher)),
        }
    }

    pub fn get(&self, text: &str, model: &str) -> anyhow::Result<Option<Vec<f32>>> {
        let hash = sha256_hex(text);
        let conn = self.store.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT vec FROM embeddings WHERE content_hash=?1 AND model=?2")?;
        let mut rows = stmt.query(params![hash, model])?;
        if let Some(row) = rows.next()? {
            let blob: Vec<u8> = row.get(0)?;
            drop(rows);
            drop(stmt);
            drop(conn);
            self.touches.record((hash, model.to_string()), now_ms());
            Ok(Some(decode_vec_f32(&blob)?))
        } else {
            Ok(None)
        }
    }

    pub fn put(&self, text: &str, model: &str, vec: &[f32]) -> anyhow::Result<()> {
        let hash = sha256_hex(text);
        let now = now_ms();
        {
            let conn = self.store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO embeddings (content_hash, model, dims, vec, created_at, accessed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(content_hash, model) DO UPDATE SET
                   dims=excluded.dims, vec=excluded.vec, accessed_at=excluded.accessed_at",
                params![hash, model, vec.len() as i64, encode_vec_f32(vec), now],
            )?;
        }
        self.evict_if_over_budget()
    }

    pub fn stats(&self) -> anyhow::Result<CacheStats> {
        let conn = self.store.conn.lock().unwrap();
        let (entries, total): (i64, i64) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(LENGTH(content_hash) + LENGTH(model) + LENGTH(vec) + ?1), 0)
             FROM embeddings",
            params![ROW_OVERHEAD],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(CacheStats {
            entries: entries as u64,
            total_bytes: total as u64,
        })
    }

    /// Drains pending access-time updates in a single transaction.
    pub fn flush_pending(&self) -> anyhow::Result<()> {
        flush_rows(&self.store, self.touches.drain())
    }

    /// Drains pending updates and joins the flusher loop.
    pub async fn close(&self) {
        self.shutdown.notify_one();
        let handle = self.flusher.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if let Err(e) = self.flush_pending() {
            tracing::warn!(event = "embedding_cache_close_flush_failed", error = %e);
        }
    }

    /// Batch eviction: one `DELETE` over the oldest `accessed_at` rows,
    /// sized from the byte excess and the average row size. Pending LRU
    /// updates are flushed first so access times are current.
    fn evict_if_over_budget(&self) -> anyhow::Result<()> {
        self.flush_pending()?;
        let stats = self.stats()?;
        let total = stats.total_bytes as i64;
        if total <= self.max_bytes || stats.entries == 0 {
            return Ok(());
        }
        let excess = total - self.max_bytes;
        let avg_row = (total / stats.entries as i64).max(1);
        let n = ((excess as f64 / avg_row as f64) * 1.1).ceil() as i64;

        let conn = self.store.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM embeddings WHERE rowid IN
               (SELECT rowid FROM embeddings ORDER BY accessed_at ASC LIMIT ?1)",
            params![n],
        )?;
        tracing::debug!(
            event = "embedding_cache_evicted",
            rows = deleted,
            excess_bytes = excess
        );
        Ok(())
    }
}

fn flush_rows(store: &Store, rows: Vec<(Key, i64)>) -> anyhow::Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let mut conn = store.conn.lock().unwrap();
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "UPDATE embeddings SET accessed_at=?1 WHERE content_hash=?2 AND model=?3",
        )?;
        for ((hash, model), at) in rows {
            stmt.execute(params![at, hash, model])?;
        }
    }
    tx.commit()?;
    Ok(())
}

fn spawn_flusher(
    store: Store,
    touches: Arc<TouchBuffer<Key>>,
    shutdown: Arc<tokio::sync::Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let flush_now = tokio::select! {
                _ = tokio::time::sleep(FLUSH_INTERVAL) => false,
                _ = touches.kick.notified() => false,
                _ = shutdown.notified() => true,
            };
            if let Err(e) = flush_rows(&store, touches.drain()) {
                tracing::warn!(event = "embedding_cache_flush_failed", error = %e);
            }
            if flush_now {
                break;
            }
        }
    })
}
