use std::sync::{Arc, Mutex};

use rusqlite::params;
use tokio::task::JoinHandle;

use crate::embeddings::sha256_hex;
use crate::storage::embedding_cache::CacheStats;
use crate::storage::lru::{TouchBuffer, FLUSH_INTERVAL};
use crate::storage::{now_ms, Store};

const ROW_OVERHEAD: i64 = 32;

#[derive(Debug, Clone, PartialEq)]
pub struct JudgeVerdict {
    pub score: f64,
    pub explanation: String,
}

type Key = (String, String, String);

/// Disk-backed store of judge verdicts keyed by
/// `(sha256(judged text), rubric, model)`. Same LRU discipline as the
/// embedding cache: buffered access times, background flusher, SQL batch
/// eviction.
pub struct JudgeCache {
    store: Store,
    touches: Arc<TouchBuffer<Key>>,
    max_bytes: i64,
    shutdown: Arc<tokio::sync::Notify>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl JudgeCache {
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

    pub fn get(&self, text: &str, rubric: &str, model: &str) -> anyhow::Result<Option<JudgeVerdict>> {
        let hash = sha256_hex(text);
        let conn = self.store.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT score, explanation FROM judge_cache
             WHERE content_hash=?1 AND rubric=?2 AND model=?3",
        )?;
        let mut rows = stmt.query(params![hash, rubric, model])?;
        if let Some(row) = rows.next()? {
            let verdict = JudgeVerdict {
                score: row.get(0)?,
                explanation: row.get(1)?,
            };
            drop(rows);
            drop(stmt);
            drop(conn);
            self.touches
                .record((hash, rubric.to_string(), model.to_string()), now_ms());
            Ok(Some(verdict))
        } else {
            Ok(None)
        }
    }

    pub fn put(
        &self,
        text: &str,
        rubric: &str,
        model: &str,
        verdict: &JudgeVerdict,
    ) -> anyhow::Result<()> {
        let hash = sha256_hex(text);
        let now = now_ms();
        {
            let conn = self.store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO judge_cache
                   (content_hash, rubric, model, score, explanation, created_at, accessed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(content_hash, rubric, model) DO UPDATE SET
                   score=excluded.score, explanation=excluded.explanation,
                   accessed_at=excluded.accessed_at",
                params![hash, rubric, model, verdict.score, verdict.explanation, now],
            )?;
        }
        self.evict_if_over_budget()
    }

    pub fn stats(&self) -> anyhow::Result<CacheStats> {
        let conn = self.store.conn.lock().unwrap();
        let (entries, total): (i64, i64) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(LENGTH(content_hash) + LENGTH(rubric) + LENGTH(model)
                                 + LENGTH(explanation) + ?1), 0)
             FROM judge_cache",
            params![ROW_OVERHEAD],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(CacheStats {
            entries: entries as u64,
            total_bytes: total as u64,
        })
    }

    pub fn flush_pending(&self) -> anyhow::Result<()> {
        flush_rows(&self.store, self.touches.drain())
    }

    pub async fn close(&self) {
        self.shutdown.notify_one();
        let handle = self.flusher.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if let Err(e) = self.flush_pending() {
            tracing::warn!(event = "judge_cache_close_flush_failed", error = %e);
        }
    }

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
            "DELETE FROM judge_cache WHERE rowid IN
               (SELECT rowid FROM judge_cache ORDER BY accessed_at ASC LIMIT ?1)",
            params![n],
        )?;
        tracing::debug!(
            event = "judge_cache_evicted",
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
            "UPDATE judge_cache SET accessed_at=?1
             WHERE content_hash=?2 AND rubric=?3 AND model=?4",
        )?;
        for ((hash, rubric, model), at) in rows {
            stmt.execute(params![at, hash, rubric, model])?;
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
                tracing::warn!(event = "judge_cache_flush_failed", error = %e);
            }
            if flush_now {
                break;
            }
        }
    })
}
