// =============================================================================
// Maintenance jobs — locks, caches, backups, and the health check
// =============================================================================

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::db::Stores;
use crate::error::EngineError;
use crate::jobs::queue::JobQueue;
use crate::jobs::registry::{JobContext, JobHandler};
use crate::locks::LockManager;
use crate::market::status_ws::MarketStatusFeed;

/// Lock files older than this are considered abandoned. The longest
/// legitimate hold (brokerage sync) is bounded by HTTP timeouts well under
/// an hour.
const STUCK_LOCK_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// History rows older than this are pruned.
const HISTORY_RETENTION_SECS: i64 = 30 * 24 * 60 * 60;

// =============================================================================
// Stuck locks
// =============================================================================

pub struct ClearStuckLocksHandler {
    locks: Arc<LockManager>,
}

impl ClearStuckLocksHandler {
    pub fn new(locks: Arc<LockManager>) -> Self {
        Self { locks }
    }
}

#[async_trait]
impl JobHandler for ClearStuckLocksHandler {
    async fn run(&self, _ctx: &JobContext) -> Result<(), EngineError> {
        let freed = self
            .locks
            .clear_stuck_locks(STUCK_LOCK_MAX_AGE)
            .map_err(|e| EngineError::fatal(format!("failed to sweep lock dir: {e}")))?;
        if !freed.is_empty() {
            warn!(freed = ?freed, "cleared stuck locks");
        }
        Ok(())
    }
}

// =============================================================================
// Cache and history pruning
// =============================================================================

pub struct PruneCacheHandler {
    stores: Arc<Stores>,
}

impl PruneCacheHandler {
    pub fn new(stores: Arc<Stores>) -> Self {
        Self { stores }
    }
}

#[async_trait]
impl JobHandler for PruneCacheHandler {
    async fn run(&self, _ctx: &JobContext) -> Result<(), EngineError> {
        let removed = self.stores.cache.cache_prune(Utc::now().timestamp())?;
        if removed > 0 {
            info!(removed, "pruned expired cache entries");
        }
        Ok(())
    }
}

pub struct PruneJobHistoryHandler {
    queue: Arc<JobQueue>,
}

impl PruneJobHistoryHandler {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl JobHandler for PruneJobHistoryHandler {
    async fn run(&self, _ctx: &JobContext) -> Result<(), EngineError> {
        let cutoff = Utc::now().timestamp() - HISTORY_RETENTION_SECS;
        let removed = self.queue.prune_history(cutoff)?;
        if removed > 0 {
            info!(removed, "pruned old job history rows");
        }
        Ok(())
    }
}

// =============================================================================
// Backup and vacuum
// =============================================================================

pub struct BackupHandler {
    data_dir: PathBuf,
}

impl BackupHandler {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }
}

#[async_trait]
impl JobHandler for BackupHandler {
    async fn run(&self, ctx: &JobContext) -> Result<(), EngineError> {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let target = self.data_dir.join("backups").join(stamp);
        std::fs::create_dir_all(&target)
            .map_err(|e| EngineError::fatal(format!("failed to create backup dir: {e}")))?;

        let entries = std::fs::read_dir(&self.data_dir)
            .map_err(|e| EngineError::fatal(format!("failed to read data dir: {e}")))?;
        let databases: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("db"))
            .collect();

        let total = databases.len() as u64;
        for (index, path) in databases.iter().enumerate() {
            let name = path.file_name().unwrap_or_default();
            std::fs::copy(path, target.join(name))
                .map_err(|e| EngineError::transient(format!("backup copy failed: {e}")))?;
            ctx.progress
                .report(index as u64 + 1, total, "copying databases");
        }

        info!(count = databases.len(), target = %target.display(), "databases backed up");
        Ok(())
    }
}

pub struct VacuumDatabasesHandler {
    data_dir: PathBuf,
}

impl VacuumDatabasesHandler {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }
}

#[async_trait]
impl JobHandler for VacuumDatabasesHandler {
    async fn run(&self, _ctx: &JobContext) -> Result<(), EngineError> {
        let entries = std::fs::read_dir(&self.data_dir)
            .map_err(|e| EngineError::fatal(format!("failed to read data dir: {e}")))?;

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("db") {
                continue;
            }
            // A dedicated connection per file: VACUUM wants no open
            // transactions on its own handle.
            let conn = rusqlite::Connection::open(&path)?;
            conn.execute_batch("VACUUM;")?;
        }

        info!("databases vacuumed");
        Ok(())
    }
}

// =============================================================================
// Stale recommendations
// =============================================================================

pub struct DismissStaleRecommendationsHandler {
    stores: Arc<Stores>,
}

impl DismissStaleRecommendationsHandler {
    pub fn new(stores: Arc<Stores>) -> Self {
        Self { stores }
    }
}

#[async_trait]
impl JobHandler for DismissStaleRecommendationsHandler {
    async fn run(&self, _ctx: &JobContext) -> Result<(), EngineError> {
        let current = crate::planner::batch::PlanningInputs::load(&self.stores)?.portfolio_hash;
        let dismissed = self.stores.cache.dismiss_pending_except_hash(&current)?;
        if dismissed > 0 {
            info!(dismissed, "dismissed recommendations for stale portfolio hashes");
        }
        Ok(())
    }
}

// =============================================================================
// Health check
// =============================================================================

pub struct HealthCheckHandler {
    stores: Arc<Stores>,
    queue: Arc<JobQueue>,
    feed: Arc<MarketStatusFeed>,
    pool_degraded: Arc<AtomicBool>,
}

impl HealthCheckHandler {
    pub fn new(
        stores: Arc<Stores>,
        queue: Arc<JobQueue>,
        feed: Arc<MarketStatusFeed>,
        pool_degraded: Arc<AtomicBool>,
    ) -> Self {
        Self {
            stores,
            queue,
            feed,
            pool_degraded,
        }
    }
}

#[async_trait]
impl JobHandler for HealthCheckHandler {
    async fn run(&self, _ctx: &JobContext) -> Result<(), EngineError> {
        // Each database must answer a trivial read.
        self.stores.settings.get("health_probe")?;
        self.stores.portfolio.list_cash()?;
        let pending = self.stores.cache.pending_recommendations()?.len();

        let depth = self.queue.depth()?;
        let ws_stale = self.feed.is_cache_stale();
        let degraded = self.pool_degraded.load(Ordering::Relaxed);

        if degraded {
            warn!(
                queue_depth = depth,
                pending_recommendations = pending,
                ws_cache_stale = ws_stale,
                "health check: worker pool is degraded"
            );
        } else {
            info!(
                queue_depth = depth,
                pending_recommendations = pending,
                ws_cache_stale = ws_stale,
                "health check passed"
            );
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::jobs::progress::ProgressReporter;
    use crate::jobs::{Job, JobKind};
    use serde_json::json;
    use tokio::sync::watch;

    fn job_ctx(bus: &EventBus, kind: JobKind) -> (JobContext, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let ctx = JobContext {
            job: Job::new(kind, json!({})),
            progress: ProgressReporter::new(
                bus.clone(),
                "test-maintenance",
                kind,
                Duration::from_millis(500),
            ),
            shutdown: rx,
        };
        (ctx, tx)
    }

    #[tokio::test]
    async fn backup_copies_every_database() {
        let dir = tempfile::tempdir().unwrap();
        let stores = Arc::new(Stores::open_all(dir.path()).unwrap());
        stores.portfolio.set_cash("EUR", 1.0, 0).unwrap();

        let bus = EventBus::new();
        let (ctx, _tx) = job_ctx(&bus, JobKind::Backup);
        BackupHandler::new(dir.path()).run(&ctx).await.unwrap();

        let backups = dir.path().join("backups");
        let stamped: Vec<_> = std::fs::read_dir(&backups).unwrap().collect();
        assert_eq!(stamped.len(), 1);
        let target = stamped[0].as_ref().unwrap().path();
        assert!(target.join("portfolio.db").exists());
        assert!(target.join("cache.db").exists());
    }

    #[tokio::test]
    async fn stuck_lock_sweep_runs_clean_on_fresh_dir() {
        let dir = tempfile::tempdir().unwrap();
        let locks = Arc::new(LockManager::new(
            dir.path().join("locks"),
            Duration::from_millis(10),
        ));
        let bus = EventBus::new();
        let (ctx, _tx) = job_ctx(&bus, JobKind::ClearStuckLocks);
        ClearStuckLocksHandler::new(locks).run(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn health_check_reads_every_surface() {
        let dir = tempfile::tempdir().unwrap();
        let stores = Arc::new(Stores::open_all(dir.path()).unwrap());
        let queue = Arc::new(JobQueue::open(dir.path().join("cache.db")).unwrap());
        let bus = EventBus::new();
        let feed = Arc::new(MarketStatusFeed::new(
            "wss://unused.invalid/socket",
            bus.clone(),
            Duration::from_secs(300),
            Duration::from_secs(5),
            Duration::from_secs(300),
            Duration::from_secs(60),
        ));

        let (ctx, _tx) = job_ctx(&bus, JobKind::HealthCheck);
        HealthCheckHandler::new(stores, queue, feed, Arc::new(AtomicBool::new(false)))
            .run(&ctx)
            .await
            .unwrap();
    }
}
