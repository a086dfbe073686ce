// =============================================================================
// Cache store — recommendations and the generic TTL cache (cache.db)
// =============================================================================
//
// The job queue keeps its own tables (and its own connection) in the same
// file; see jobs::queue.
// =============================================================================

use std::path::Path;

use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::types::{Recommendation, RecommendationStatus, Side};

/// Shared by `CacheStore` and `jobs::queue::JobQueue`, which open separate
/// connections to the same file and must agree on its schema version.
pub(crate) const CACHE_DB_MIGRATIONS: &[&str] = &[r#"
CREATE TABLE recommendations (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    portfolio_hash TEXT NOT NULL,
    side           TEXT NOT NULL,
    symbol         TEXT NOT NULL,
    quantity       REAL NOT NULL,
    price          REAL,
    rationale      TEXT NOT NULL,
    status         TEXT NOT NULL DEFAULT 'pending',
    created_at     INTEGER NOT NULL,
    executed_at    INTEGER
);

CREATE INDEX idx_recommendations_status ON recommendations(status, portfolio_hash);

CREATE TABLE cache_data (
    cache_key   TEXT PRIMARY KEY,
    cache_value TEXT NOT NULL,
    expires_at  INTEGER NOT NULL,
    created_at  INTEGER NOT NULL
);

CREATE TABLE job_queue (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id       TEXT NOT NULL UNIQUE,
    kind         TEXT NOT NULL,
    payload      TEXT NOT NULL,
    available_at INTEGER NOT NULL,
    retries      INTEGER NOT NULL,
    max_retries  INTEGER NOT NULL,
    enqueued_at  INTEGER NOT NULL
);

CREATE INDEX idx_job_queue_available ON job_queue(available_at, seq);

CREATE TABLE job_history (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    kind        TEXT NOT NULL,
    outcome     TEXT NOT NULL,
    last_run_at INTEGER NOT NULL
);

CREATE INDEX idx_job_history_kind ON job_history(kind, last_run_at DESC);
"#];

pub struct CacheStore {
    conn: Mutex<Connection>,
}

impl CacheStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = super::open_with_migrations(path.as_ref(), CACHE_DB_MIGRATIONS)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── Recommendations ─────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn insert_pending_recommendation(
        &self,
        portfolio_hash: &str,
        side: Side,
        symbol: &str,
        quantity: f64,
        price: Option<f64>,
        rationale: &str,
        now: i64,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO recommendations
                (portfolio_hash, side, symbol, quantity, price, rationale, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)
            "#,
            params![portfolio_hash, side.as_str(), symbol, quantity, price, rationale, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Pending recommendations in creation order.
    pub fn pending_recommendations(&self) -> Result<Vec<Recommendation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, portfolio_hash, side, symbol, quantity, price, rationale, status,
                    created_at, executed_at
             FROM recommendations WHERE status = 'pending' ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], row_to_recommendation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_recommendation(&self, id: i64) -> Result<Option<Recommendation>> {
        let rec = self
            .conn
            .lock()
            .query_row(
                "SELECT id, portfolio_hash, side, symbol, quantity, price, rationale, status,
                        created_at, executed_at
                 FROM recommendations WHERE id = ?1",
                params![id],
                row_to_recommendation,
            )
            .optional()?;
        Ok(rec)
    }

    pub fn mark_recommendation_executed(&self, id: i64, executed_at: i64) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE recommendations SET status = 'executed', executed_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, executed_at],
        )?;
        Ok(())
    }

    pub fn dismiss_recommendation(&self, id: i64) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE recommendations SET status = 'dismissed'
             WHERE id = ?1 AND status = 'pending'",
            params![id],
        )?;
        Ok(())
    }

    /// Dismiss every pending recommendation under `portfolio_hash` in one
    /// statement. Returns how many rows flipped.
    pub fn dismiss_all_by_portfolio_hash(&self, portfolio_hash: &str) -> Result<usize> {
        let changed = self.conn.lock().execute(
            "UPDATE recommendations SET status = 'dismissed'
             WHERE portfolio_hash = ?1 AND status = 'pending'",
            params![portfolio_hash],
        )?;
        Ok(changed)
    }

    /// Dismiss every pending recommendation whose hash differs from
    /// `current_hash`. Run before a batch writes rows for a new hash.
    pub fn dismiss_pending_except_hash(&self, current_hash: &str) -> Result<usize> {
        let changed = self.conn.lock().execute(
            "UPDATE recommendations SET status = 'dismissed'
             WHERE portfolio_hash != ?1 AND status = 'pending'",
            params![current_hash],
        )?;
        Ok(changed)
    }

    // ── Generic TTL cache ───────────────────────────────────────────────

    pub fn cache_get(&self, key: &str, now: i64) -> Result<Option<String>> {
        let value = self
            .conn
            .lock()
            .query_row(
                "SELECT cache_value FROM cache_data WHERE cache_key = ?1 AND expires_at > ?2",
                params![key, now],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn cache_put(&self, key: &str, value: &str, expires_at: i64, now: i64) -> Result<()> {
        self.conn.lock().execute(
            r#"
            INSERT INTO cache_data (cache_key, cache_value, expires_at, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(cache_key) DO UPDATE SET
                cache_value = excluded.cache_value,
                expires_at = excluded.expires_at,
                created_at = excluded.created_at
            "#,
            params![key, value, expires_at, now],
        )?;
        Ok(())
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn cache_prune(&self, now: i64) -> Result<usize> {
        let removed = self
            .conn
            .lock()
            .execute("DELETE FROM cache_data WHERE expires_at <= ?1", params![now])?;
        Ok(removed)
    }
}

fn row_to_recommendation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Recommendation> {
    let side: String = row.get(2)?;
    let status: String = row.get(7)?;
    Ok(Recommendation {
        id: row.get(0)?,
        portfolio_hash: row.get(1)?,
        side: Side::parse(&side).unwrap_or(Side::Buy),
        symbol: row.get(3)?,
        quantity: row.get(4)?,
        price: row.get(5)?,
        rationale: row.get(6)?,
        status: RecommendationStatus::parse(&status).unwrap_or(RecommendationStatus::Dismissed),
        created_at: row.get(8)?,
        executed_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, CacheStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path().join("cache.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn dismiss_by_hash_only_touches_pending_rows_of_that_hash() {
        let (_dir, store) = store();
        let a = store
            .insert_pending_recommendation("h1", Side::Buy, "AAPL", 1.0, None, "r", 100)
            .unwrap();
        store
            .insert_pending_recommendation("h1", Side::Sell, "MSFT", 1.0, None, "r", 100)
            .unwrap();
        store
            .insert_pending_recommendation("h2", Side::Buy, "NVDA", 1.0, None, "r", 100)
            .unwrap();
        store.mark_recommendation_executed(a, 200).unwrap();

        // One pending h1 row remains; the executed one must not flip.
        assert_eq!(store.dismiss_all_by_portfolio_hash("h1").unwrap(), 1);

        let pending = store.pending_recommendations().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].portfolio_hash, "h2");

        let executed = store.get_recommendation(a).unwrap().unwrap();
        assert_eq!(executed.status, RecommendationStatus::Executed);
        assert_eq!(executed.executed_at, Some(200));
    }

    #[test]
    fn stale_hash_hygiene_spares_the_current_hash() {
        let (_dir, store) = store();
        store
            .insert_pending_recommendation("old", Side::Buy, "AAPL", 1.0, None, "r", 100)
            .unwrap();
        store
            .insert_pending_recommendation("new", Side::Buy, "MSFT", 1.0, None, "r", 100)
            .unwrap();

        assert_eq!(store.dismiss_pending_except_hash("new").unwrap(), 1);
        let pending = store.pending_recommendations().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].portfolio_hash, "new");
    }

    #[test]
    fn cache_respects_expiry() {
        let (_dir, store) = store();
        store.cache_put("k", "v", 1_000, 900).unwrap();

        assert_eq!(store.cache_get("k", 999).unwrap(), Some("v".into()));
        assert_eq!(store.cache_get("k", 1_000).unwrap(), None);

        assert_eq!(store.cache_prune(1_000).unwrap(), 1);
        assert_eq!(store.cache_prune(1_000).unwrap(), 0);
    }
}
