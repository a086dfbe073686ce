// =============================================================================
// Helmsman — Autonomous Portfolio Engine, Main Entry Point
// =============================================================================
//
// Composition root: everything is constructed here and handed down as
// explicit dependencies. The engine starts against the paper broker; a
// real brokerage client plugs in through the same trait.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod broker;
mod config;
mod db;
mod error;
mod events;
mod jobs;
mod locks;
mod maintenance;
mod market;
mod planner;
mod sync;
mod trading;
mod types;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::broker::{Brokerage, PaperBroker};
use crate::config::EngineConfig;
use crate::db::Stores;
use crate::events::{EventBus, EventKind};
use crate::jobs::queue::JobQueue;
use crate::jobs::registry::JobRegistry;
use crate::jobs::scheduler::{JobScheduler, ScheduleEntry};
use crate::jobs::worker::WorkerPool;
use crate::jobs::{Job, JobKind};
use crate::locks::LockManager;
use crate::maintenance::{
    BackupHandler, ClearStuckLocksHandler, DismissStaleRecommendationsHandler,
    HealthCheckHandler, PruneCacheHandler, PruneJobHistoryHandler, VacuumDatabasesHandler,
};
use crate::market::hours::MarketHoursOracle;
use crate::market::status_ws::MarketStatusFeed;
use crate::planner::batch::PlannerBatchHandler;
use crate::planner::filters::FilterRegistry;
use crate::planner::generators::GeneratorRegistry;
use crate::planner::patterns::PatternRegistry;
use crate::planner::sequence::SequenceService;
use crate::sync::{
    EmergencyCurrencyExchangeHandler, SyncCashFlowsHandler, SyncFxRatesHandler,
    SyncPositionsHandler, SyncTradesHandler,
};
use crate::trading::executor::TradeExecutorHandler;
use crate::trading::gates::TradeGates;

const CONFIG_PATH: &str = "helmsman.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = EngineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });

    if let Ok(data_dir) = std::env::var("HELMSMAN_DATA_DIR") {
        config.data_dir = data_dir;
    }
    if let Ok(workers) = std::env::var("HELMSMAN_WORKERS") {
        match workers.parse() {
            Ok(n) => config.workers = n,
            Err(_) => warn!(workers = %workers, "ignoring unparsable HELMSMAN_WORKERS"),
        }
    }

    info!(
        workers = config.workers,
        data_dir = %config.data_dir,
        base_currency = %config.base_currency,
        "Helmsman starting"
    );

    // ── 2. Databases & locks ─────────────────────────────────────────────
    let stores = Arc::new(Stores::open_all(Path::new(&config.data_dir))?);
    let locks = Arc::new(LockManager::new(
        &config.lock_dir,
        config.lock_acquire_retry(),
    ));

    // Seed the planner settings row from file config exactly once; after
    // that the settings store is authoritative.
    if stores.settings.get("planner_seeded")?.is_none() {
        let now = Utc::now().timestamp();
        stores.settings.save_planner_settings(&config.planner, now)?;
        stores.settings.set("planner_seeded", "1", now)?;
        info!("planner settings seeded into config.db");
    }

    // ── 3. Event bus ─────────────────────────────────────────────────────
    let bus = EventBus::new();

    // ── 4. Brokerage collaborator ────────────────────────────────────────
    let broker: Arc<dyn Brokerage> = Arc::new(PaperBroker::new());

    // ── 5. Market status: oracle + WebSocket feed ────────────────────────
    let oracle = Arc::new(MarketHoursOracle::new(
        stores.cache.clone(),
        config.market_status_url.clone(),
        Duration::from_secs(config.market_status_cache_ttl_secs),
        config.market_status_http_timeout(),
    ));
    let feed = Arc::new(MarketStatusFeed::new(
        config.ws_url.clone(),
        bus.clone(),
        Duration::from_secs(config.ws_cache_stale_secs),
        Duration::from_secs(config.ws_base_reconnect_delay_secs),
        Duration::from_secs(config.ws_max_reconnect_delay_secs),
        Duration::from_secs(config.ws_pong_wait_secs),
    ));
    let feed_handle = feed.start();

    // ── 6. Planning pipeline ─────────────────────────────────────────────
    let sequences = Arc::new(SequenceService::new(
        Arc::new(PatternRegistry::with_builtins()),
        Arc::new(GeneratorRegistry::with_builtins()),
        Arc::new(FilterRegistry::with_builtins()),
    ));

    // ── 7. Queue, registry, worker pool ──────────────────────────────────
    let queue = Arc::new(JobQueue::open(
        Path::new(&config.data_dir).join("cache.db"),
    )?);
    let registry = Arc::new(JobRegistry::new());
    let pool = Arc::new(WorkerPool::new(
        queue.clone(),
        registry.clone(),
        bus.clone(),
        config.workers,
        config.queue_poll_interval(),
        config.progress_throttle(),
    ));

    registry.register(
        JobKind::PlannerBatch,
        Arc::new(PlannerBatchHandler::new(
            stores.clone(),
            queue.clone(),
            bus.clone(),
            sequences,
            config.clone(),
        )),
    );
    registry.register(
        JobKind::EventBasedTrading,
        Arc::new(TradeExecutorHandler::new(
            stores.clone(),
            broker.clone(),
            TradeGates::new(config.clone(), stores.clone(), oracle.clone()),
            bus.clone(),
            config.clone(),
        )),
    );

    registry.register(
        JobKind::SyncPositions,
        Arc::new(SyncPositionsHandler::new(
            stores.clone(),
            broker.clone(),
            bus.clone(),
        )),
    );
    registry.register(
        JobKind::SyncTrades,
        Arc::new(SyncTradesHandler::new(stores.clone(), broker.clone())),
    );
    let cash_sync = Arc::new(SyncCashFlowsHandler::new(
        stores.clone(),
        broker.clone(),
        locks.clone(),
    ));
    registry.register(JobKind::SyncCashFlows, cash_sync.clone());
    registry.register(JobKind::SyncCashBalances, cash_sync);
    registry.register(
        JobKind::SyncFxRates,
        Arc::new(SyncFxRatesHandler::new(
            stores.clone(),
            broker.clone(),
            config.clone(),
        )),
    );
    registry.register(
        JobKind::EmergencyCurrencyExchange,
        Arc::new(EmergencyCurrencyExchangeHandler::new(
            stores.clone(),
            broker.clone(),
            locks.clone(),
            config.clone(),
        )),
    );

    registry.register(
        JobKind::ClearStuckLocks,
        Arc::new(ClearStuckLocksHandler::new(locks.clone())),
    );
    registry.register(
        JobKind::PruneCache,
        Arc::new(PruneCacheHandler::new(stores.clone())),
    );
    registry.register(
        JobKind::PruneJobHistory,
        Arc::new(PruneJobHistoryHandler::new(queue.clone())),
    );
    registry.register(
        JobKind::Backup,
        Arc::new(BackupHandler::new(config.data_dir.clone())),
    );
    registry.register(
        JobKind::VacuumDatabases,
        Arc::new(VacuumDatabasesHandler::new(config.data_dir.clone())),
    );
    registry.register(
        JobKind::DismissStaleRecommendations,
        Arc::new(DismissStaleRecommendationsHandler::new(stores.clone())),
    );
    registry.register(
        JobKind::HealthCheck,
        Arc::new(HealthCheckHandler::new(
            stores.clone(),
            queue.clone(),
            feed.clone(),
            pool.degraded_handle(),
        )),
    );

    pool.start();

    // ── 8. Interval scheduler ────────────────────────────────────────────
    let minutes = |n: u64| Duration::from_secs(n * 60);
    let scheduler = JobScheduler::new(
        queue.clone(),
        vec![
            ScheduleEntry::new(JobKind::SyncPositions, minutes(15)),
            ScheduleEntry::new(JobKind::SyncTrades, minutes(15)),
            ScheduleEntry::new(JobKind::SyncCashFlows, minutes(60)),
            ScheduleEntry::new(JobKind::SyncFxRates, minutes(6 * 60)),
            ScheduleEntry::new(JobKind::PlannerBatch, minutes(30)),
            ScheduleEntry::new(JobKind::HealthCheck, minutes(5)),
            ScheduleEntry::new(JobKind::ClearStuckLocks, minutes(60)),
            ScheduleEntry::new(JobKind::PruneCache, minutes(6 * 60)),
            ScheduleEntry::new(JobKind::PruneJobHistory, minutes(24 * 60)),
            ScheduleEntry::new(JobKind::Backup, minutes(24 * 60)),
            ScheduleEntry::new(JobKind::VacuumDatabases, minutes(7 * 24 * 60)),
        ],
        Duration::from_secs(10),
    );
    let scheduler_shutdown = pool.subscribe_shutdown();
    tokio::spawn(async move { scheduler.run(scheduler_shutdown).await });

    // ── 9. Planning-complete → trade executor bridge ─────────────────────
    // Cross-component causality goes through the bus and the queue; the
    // planner never holds a reference to the executor.
    let (_bridge_id, mut planning_events) = bus.subscribe(&[EventKind::PlanningCompleted]);
    let bridge_queue = queue.clone();
    tokio::spawn(async move {
        while let Some(event) = planning_events.recv().await {
            let kind = JobKind::EventBasedTrading;
            match bridge_queue.contains_kind(kind.as_str()) {
                Ok(true) => continue,
                Ok(false) => {
                    let job = Job::new(kind, event.data.clone());
                    if let Err(e) = bridge_queue.enqueue(&job) {
                        error!(error = %e, "failed to enqueue trade execution job");
                    }
                }
                Err(e) => error!(error = %e, "queue check failed in planning bridge"),
            }
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    feed.stop();
    pool.stop().await;
    bus.shutdown();
    if let Err(e) = feed_handle.await {
        warn!(error = %e, "market status feed task ended uncleanly");
    }

    if let Err(e) = config.save(CONFIG_PATH) {
        error!(error = %e, "Failed to save engine config on shutdown");
    }

    info!("Helmsman shut down complete.");
    Ok(())
}
