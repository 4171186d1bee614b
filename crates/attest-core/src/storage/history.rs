use std::sync::atomic::{AtomicU64, Ordering};

use rusqlite::params;

use crate::storage::{now_ns, Store};

/// Prune cadence and retention rules. Adjustable before the first insert;
/// the engine never changes them afterwards.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub prune_every: u64,
    pub max_age_days: i64,
    pub max_rows_per_assertion: i64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            prune_every: 100,
            max_age_days: 30,
            max_rows_per_assertion: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryStats {
    pub mean: f64,
    pub stddev: f64,
    pub count: u64,
}

/// Append-only record of assertion outcomes backing windowed queries,
/// dynamic thresholds and drift statistics.
pub struct HistoryStore {
    store: Store,
    cfg: HistoryConfig,
    inserts: AtomicU64,
}

impl HistoryStore {
    pub fn new(store: Store) -> Self {
        Self::with_config(store, HistoryConfig::default())
    }

    pub fn with_config(store: Store, cfg: HistoryConfig) -> Self {
        Self {
            store,
            cfg,
            inserts: AtomicU64::new(0),
        }
    }

    pub fn insert(
        &self,
        trace_id: &str,
        assertion_id: &str,
        assertion_type: &str,
        score: f64,
        status: &str,
    ) -> anyhow::Result<()> {
        let created_at_ns = now_ns();
        {
            let conn = self.store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO assertion_history
                   (trace_id, assertion_id, assertion_type, score, status, created_at_ns)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![trace_id, assertion_id, assertion_type, score, status, created_at_ns],
            )?;
        }
        let n = self.inserts.fetch_add(1, Ordering::Relaxed) + 1;
        if n % self.cfg.prune_every == 0 {
            self.prune()?;
        }
        Ok(())
    }

    /// The `n` most recent scores for an assertion id, newest first.
    pub fn query_window(&self, assertion_id: &str, n: u32) -> anyhow::Result<Vec<f64>> {
        let conn = self.store.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT score FROM assertion_history
             WHERE assertion_id=?1 ORDER BY created_at_ns DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![assertion_id, n], |r| r.get::<_, f64>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Mean, population standard deviation and count in one aggregate query
    /// via `Var(X) = E[X²] − E[X]²`, guarded against floating-point negative
    /// variance.
    pub fn stats(&self, assertion_id: &str) -> anyhow::Result<HistoryStats> {
        let conn = self.store.conn.lock().unwrap();
        let (mean, mean_sq, count): (Option<f64>, Option<f64>, i64) = conn.query_row(
            "SELECT AVG(score), AVG(score*score), COUNT(*)
             FROM assertion_history WHERE assertion_id=?1",
            params![assertion_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;
        let mean = mean.unwrap_or(0.0);
        let variance = (mean_sq.unwrap_or(0.0) - mean * mean).max(0.0);
        Ok(HistoryStats {
            mean,
            stddev: variance.sqrt(),
            count: count as u64,
        })
    }

    /// Most recent score for an assertion id, if any history exists.
    pub fn latest(&self, assertion_id: &str) -> anyhow::Result<Option<f64>> {
        Ok(self.query_window(assertion_id, 1)?.into_iter().next())
    }

    /// Drops rows past the age limit, then caps each assertion id at the
    /// configured row maximum, keeping the most recent rows.
    pub fn prune(&self) -> anyhow::Result<()> {
        let cutoff = now_ns() - self.cfg.max_age_days * 86_400 * 1_000_000_000;
        let conn = self.store.conn.lock().unwrap();
        let aged = conn.execute(
            "DELETE FROM assertion_history WHERE created_at_ns < ?1",
            params![cutoff],
        )?;
        let capped = conn.execute(
            "DELETE FROM assertion_history WHERE id IN (
               SELECT id FROM (
                 SELECT id, ROW_NUMBER() OVER (
                   PARTITION BY assertion_id ORDER BY created_at_ns DESC, id DESC
                 ) AS rn
                 FROM assertion_history
               ) WHERE rn > ?1
             )",
            params![self.cfg.max_rows_per_assertion],
        )?;
        if aged > 0 || capped > 0 {
            tracing::debug!(event = "history_pruned", aged_out = aged, capped = capped);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history() -> HistoryStore {
        HistoryStore::new(Store::memory().unwrap())
    }

    #[test]
    fn window_is_newest_first() -> anyhow::Result<()> {
        let h = history();
        for score in [0.6, 0.8, 1.0] {
            h.insert("t1", "a1", "judge", score, "pass")?;
        }
        assert_eq!(h.query_window("a1", 3)?, vec![1.0, 0.8, 0.6]);
        assert_eq!(h.query_window("a1", 2)?, vec![1.0, 0.8]);
        Ok(())
    }

    #[test]
    fn stats_use_population_variance_identity() -> anyhow::Result<()> {
        let h = history();
        for score in [0.6, 0.8, 1.0] {
            h.insert("t1", "a1", "judge", score, "pass")?;
        }
        let stats = h.stats("a1")?;
        assert_eq!(stats.count, 3);
        assert!((stats.mean - 0.8).abs() < 1e-9);
        assert!((stats.stddev - (0.08f64 / 3.0).sqrt()).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn stats_of_empty_history_are_zero() -> anyhow::Result<()> {
        let stats = history().stats("nope")?;
        assert_eq!(stats.count, 0);
        assert_eq!(stats.mean, 0.0);
        assert_eq!(stats.stddev, 0.0);
        Ok(())
    }

    #[test]
    fn per_assertion_row_cap_keeps_most_recent() -> anyhow::Result<()> {
        let h = HistoryStore::with_config(
            Store::memory()?,
            HistoryConfig {
                prune_every: 1_000_000,
                max_age_days: 30,
                max_rows_per_assertion: 5,
            },
        );
        for i in 0..12 {
            h.insert("t", "a1", "judge", i as f64 / 100.0, "pass")?;
        }
        h.insert("t", "other", "judge", 0.5, "pass")?;
        h.prune()?;
        let window = h.query_window("a1", 100)?;
        assert_eq!(window.len(), 5);
        assert!((window[0] - 0.11).abs() < 1e-9);
        // Other assertion ids are capped independently.
        assert_eq!(h.query_window("other", 100)?.len(), 1);
        Ok(())
    }

    #[test]
    fn age_based_prune_drops_old_rows() -> anyhow::Result<()> {
        let h = history();
        h.insert("t", "a1", "judge", 0.9, "pass")?;
        // Backdate the row beyond the 30-day horizon.
        {
            let conn = h.store.conn.lock().unwrap();
            conn.execute("UPDATE assertion_history SET created_at_ns = 1", [])?;
        }
        h.prune()?;
        assert_eq!(h.stats("a1")?.count, 0);
        Ok(())
    }

    #[test]
    fn prune_triggers_on_insert_cadence() -> anyhow::Result<()> {
        let h = HistoryStore::with_config(
            Store::memory()?,
            HistoryConfig {
                prune_every: 10,
                max_age_days: 30,
                max_rows_per_assertion: 3,
            },
        );
        for i in 0..10 {
            h.insert("t", "a1", "judge", i as f64 / 10.0, "pass")?;
        }
        // The 10th insert pruned down to the per-assertion cap.
        assert_eq!(h.query_window("a1", 100)?.len(), 3);
        Ok(())
    }
}
