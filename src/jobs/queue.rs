// =============================================================================
// Job Queue — durable FIFO with visibility delay and execution history
// =============================================================================
//
// Rows live in cache.db (shared with the cache store, separate connection).
// The queue owns its rows: only the worker pool mutates retries and
// available_at, and it does so through this type. In-flight claims are kept
// in memory, so a crashed process implicitly releases them on restart.
// =============================================================================

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::{Job, JobOutcome};
use crate::db::cache::CACHE_DB_MIGRATIONS;

struct Inner {
    conn: Connection,
    in_flight: HashSet<String>,
}

pub struct JobQueue {
    inner: Mutex<Inner>,
}

impl JobQueue {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = crate::db::open_with_migrations(path.as_ref(), CACHE_DB_MIGRATIONS)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                conn,
                in_flight: HashSet::new(),
            }),
        })
    }

    /// Append a job. Invisible to `dequeue` until `available_at`.
    pub fn enqueue(&self, job: &Job) -> Result<()> {
        let payload =
            serde_json::to_string(&job.payload).context("failed to serialise job payload")?;
        self.inner.lock().conn.execute(
            "INSERT INTO job_queue
                (job_id, kind, payload, available_at, retries, max_retries, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                job.id,
                job.kind,
                payload,
                job.available_at,
                job.retries,
                job.max_retries,
                job.enqueued_at,
            ],
        )?;
        Ok(())
    }

    /// Oldest eligible job not currently claimed by a worker, claimed
    /// atomically. FIFO within equal `available_at`; no priority.
    pub fn dequeue(&self, now: i64) -> Result<Option<Job>> {
        let mut inner = self.inner.lock();
        let Inner { conn, in_flight } = &mut *inner;

        let mut stmt = conn.prepare_cached(
            "SELECT job_id, kind, payload, available_at, retries, max_retries, enqueued_at
             FROM job_queue WHERE available_at <= ?1 ORDER BY available_at, seq",
        )?;
        let mut rows = stmt.query(params![now])?;

        while let Some(row) = rows.next()? {
            let job_id: String = row.get(0)?;
            if in_flight.contains(&job_id) {
                continue;
            }

            let payload: String = row.get(2)?;
            let job = Job {
                id: job_id.clone(),
                kind: row.get(1)?,
                payload: serde_json::from_str(&payload)
                    .context("failed to parse stored job payload")?,
                available_at: row.get(3)?,
                retries: row.get(4)?,
                max_retries: row.get(5)?,
                enqueued_at: row.get(6)?,
            };

            in_flight.insert(job_id);
            return Ok(Some(job));
        }

        Ok(None)
    }

    /// Remove a finished (succeeded or exhausted) job and release its claim.
    pub fn finish(&self, job_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .conn
            .execute("DELETE FROM job_queue WHERE job_id = ?1", params![job_id])?;
        inner.in_flight.remove(job_id);
        Ok(())
    }

    /// Write back an attempt's retry bookkeeping and release the claim so
    /// the job becomes eligible again at its new `available_at`.
    pub fn requeue(&self, job: &Job) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.conn.execute(
            "UPDATE job_queue SET retries = ?2, available_at = ?3 WHERE job_id = ?1",
            params![job.id, job.retries, job.available_at],
        )?;
        inner.in_flight.remove(&job.id);
        Ok(())
    }

    /// Append an attempt outcome to the history.
    pub fn record_execution(&self, kind: &str, outcome: JobOutcome, now: i64) -> Result<()> {
        self.inner.lock().conn.execute(
            "INSERT INTO job_history (kind, outcome, last_run_at) VALUES (?1, ?2, ?3)",
            params![kind, outcome.as_str(), now],
        )?;
        Ok(())
    }

    /// Most recent run of `kind`, used by the scheduler to compute next-run
    /// times without reading the live queue.
    pub fn last_run(&self, kind: &str) -> Result<Option<i64>> {
        let at = self
            .inner
            .lock()
            .conn
            .query_row(
                "SELECT MAX(last_run_at) FROM job_history WHERE kind = ?1",
                params![kind],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();
        Ok(at)
    }

    /// Whether a job of `kind` is already queued (claimed or not). The
    /// scheduler uses this to avoid stacking duplicates.
    pub fn contains_kind(&self, kind: &str) -> Result<bool> {
        let count: i64 = self.inner.lock().conn.query_row(
            "SELECT COUNT(*) FROM job_queue WHERE kind = ?1",
            params![kind],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn depth(&self) -> Result<u64> {
        let count: i64 = self
            .inner
            .lock()
            .conn
            .query_row("SELECT COUNT(*) FROM job_queue", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// History rows older than `cutoff` are dropped. Maintenance job hook.
    pub fn prune_history(&self, cutoff: i64) -> Result<usize> {
        let removed = self.inner.lock().conn.execute(
            "DELETE FROM job_history WHERE last_run_at < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }

    /// Attempt rows for a kind, oldest first. Test and health-check hook.
    pub fn history(&self, kind: &str) -> Result<Vec<(String, i64)>> {
        let inner = self.inner.lock();
        let mut stmt = inner.conn.prepare(
            "SELECT outcome, last_run_at FROM job_history WHERE kind = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![kind], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
