use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use rusqlite::Connection;

pub mod embedding_cache;
pub mod history;
pub mod judge_cache;
mod lru;

pub use embedding_cache::EmbeddingCache;
pub use history::{HistoryConfig, HistoryStats, HistoryStore};
pub use judge_cache::{JudgeCache, JudgeVerdict};

/// Idempotent schema for the single engine database. Every table carries its
/// own created/accessed columns; the caches keep a secondary index on
/// `accessed_at` for batch eviction.
const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS embeddings (
  content_hash TEXT NOT NULL,
  model TEXT NOT NULL,
  dims INTEGER NOT NULL,
  vec BLOB NOT NULL,
  created_at INTEGER NOT NULL,
  accessed_at INTEGER NOT NULL,
  PRIMARY KEY (content_hash, model)
);
CREATE INDEX IF NOT EXISTS idx_embeddings_accessed ON embeddings(accessed_at);

CREATE TABLE IF NOT EXISTS judge_cache (
  content_hash TEXT NOT NULL,
  rubric TEXT NOT NULL,
  model TEXT NOT NULL,
  score REAL NOT NULL,
  explanation TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  accessed_at INTEGER NOT NULL,
  PRIMARY KEY (content_hash, rubric, model)
);
CREATE INDEX IF NOT EXISTS idx_judge_cache_accessed ON judge_cache(accessed_at);

CREATE TABLE IF NOT EXISTS assertion_history (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  trace_id TEXT NOT NULL,
  assertion_id TEXT NOT NULL,
  assertion_type TEXT NOT NULL,
  score REAL NOT NULL,
  status TEXT NOT NULL,
  created_at_ns INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_history_assertion
  ON assertion_history(assertion_id, created_at_ns);
"#;

/// Shared handle to the engine database. Writes are serialized by the
/// connection mutex; SQLite's WAL mode lets readers proceed.
#[derive(Clone)]
pub struct Store {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create cache dir {}", dir.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open engine db at {}", path.display()))?;
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory db")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(DDL)?;
        Ok(())
    }
}

pub(crate) fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) fn now_ns() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
