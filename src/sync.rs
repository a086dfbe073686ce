// =============================================================================
// Brokerage sync jobs — pull external state into the local databases
// =============================================================================
//
// These handlers are the causality head of the pipeline: sync moves the
// portfolio, which moves the fingerprint, which drives the next planning
// batch. Cash-flow sync touches shared external state and is the canonical
// named-lock user.
// =============================================================================

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info};

use crate::broker::Brokerage;
use crate::config::EngineConfig;
use crate::db::Stores;
use crate::error::EngineError;
use crate::events::{EventBus, EventKind};
use crate::jobs::registry::{JobContext, JobHandler};
use crate::locks::LockManager;
use crate::planner::batch::PlanningInputs;

/// Lock serialising everything that mutates brokerage-side cash state.
pub const CASH_FLOW_SYNC_LOCK: &str = "cash_flow_sync";

const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Positions
// =============================================================================

pub struct SyncPositionsHandler {
    stores: Arc<Stores>,
    broker: Arc<dyn Brokerage>,
    bus: EventBus,
}

impl SyncPositionsHandler {
    pub fn new(stores: Arc<Stores>, broker: Arc<dyn Brokerage>, bus: EventBus) -> Self {
        Self {
            stores,
            broker,
            bus,
        }
    }
}

#[async_trait]
impl JobHandler for SyncPositionsHandler {
    async fn run(&self, ctx: &JobContext) -> Result<(), EngineError> {
        let positions = self.broker.fetch_positions().await?;
        let total = positions.len() as u64;

        for (index, position) in positions.iter().enumerate() {
            self.stores.portfolio.upsert_position(position)?;
            ctx.progress
                .report(index as u64 + 1, total, "syncing positions");
        }

        // Positions the brokerage no longer reports were closed elsewhere.
        let broker_symbols: BTreeSet<&str> =
            positions.iter().map(|p| p.symbol.as_str()).collect();
        for local in self.stores.portfolio.list_positions()? {
            if !broker_symbols.contains(local.symbol.as_str()) {
                self.stores.portfolio.remove_position(&local.symbol)?;
            }
        }

        info!(count = positions.len(), "positions synced from brokerage");
        self.bus.emit(
            EventKind::PositionUpdated,
            "sync-positions",
            json!({ "count": positions.len() }),
        );
        Ok(())
    }
}

// =============================================================================
// Trades
// =============================================================================

pub struct SyncTradesHandler {
    stores: Arc<Stores>,
    broker: Arc<dyn Brokerage>,
}

impl SyncTradesHandler {
    pub fn new(stores: Arc<Stores>, broker: Arc<dyn Brokerage>) -> Self {
        Self { stores, broker }
    }
}

#[async_trait]
impl JobHandler for SyncTradesHandler {
    async fn run(&self, _ctx: &JobContext) -> Result<(), EngineError> {
        // Incremental: only trades strictly after the local watermark.
        let watermark = self.stores.ledger.latest_trade_at()?.unwrap_or(0);
        let trades = self.broker.fetch_trades(watermark + 1).await?;

        for trade in &trades {
            self.stores.ledger.record_trade(
                &trade.symbol,
                trade.side,
                trade.quantity,
                trade.price,
                &trade.currency,
                trade.executed_at,
            )?;
        }

        debug!(count = trades.len(), watermark, "trades synced from brokerage");
        Ok(())
    }
}

// =============================================================================
// Cash flows / balances (lock-serialised)
// =============================================================================

pub struct SyncCashFlowsHandler {
    stores: Arc<Stores>,
    broker: Arc<dyn Brokerage>,
    locks: Arc<LockManager>,
}

impl SyncCashFlowsHandler {
    pub fn new(stores: Arc<Stores>, broker: Arc<dyn Brokerage>, locks: Arc<LockManager>) -> Self {
        Self {
            stores,
            broker,
            locks,
        }
    }
}

#[async_trait]
impl JobHandler for SyncCashFlowsHandler {
    async fn run(&self, _ctx: &JobContext) -> Result<(), EngineError> {
        // At most one concurrent cash sync process-wide. A timeout is
        // transient: another sync holds the state and this one retries.
        let _lock = self.locks.acquire(CASH_FLOW_SYNC_LOCK, LOCK_TIMEOUT).await?;

        let now = Utc::now().timestamp();
        let balances = self.broker.fetch_cash_balances().await?;
        for balance in &balances {
            self.stores
                .portfolio
                .set_cash(&balance.currency, balance.amount, now)?;
        }

        info!(currencies = balances.len(), "cash balances synced");
        Ok(())
    }
}

// =============================================================================
// FX rates
// =============================================================================

pub struct SyncFxRatesHandler {
    stores: Arc<Stores>,
    broker: Arc<dyn Brokerage>,
    config: EngineConfig,
}

impl SyncFxRatesHandler {
    pub fn new(stores: Arc<Stores>, broker: Arc<dyn Brokerage>, config: EngineConfig) -> Self {
        Self {
            stores,
            broker,
            config,
        }
    }
}

#[async_trait]
impl JobHandler for SyncFxRatesHandler {
    async fn run(&self, _ctx: &JobContext) -> Result<(), EngineError> {
        let now = Utc::now().timestamp();
        let today = now - now.rem_euclid(86_400);
        let base = &self.config.base_currency;

        // Every currency the engine can encounter: securities plus cash.
        let mut currencies = BTreeSet::new();
        for security in self.stores.universe.list_securities()? {
            currencies.insert(security.currency);
        }
        for balance in self.stores.portfolio.list_cash()? {
            currencies.insert(balance.currency);
        }
        currencies.remove(base);

        for currency in &currencies {
            let rate = self.broker.fetch_fx_rate(currency, base, today).await?;
            self.stores
                .history
                .upsert_fx_rate(currency, base, today, rate)?;
        }

        debug!(pairs = currencies.len(), base = %base, "fx rates synced");
        Ok(())
    }
}

// =============================================================================
// Emergency currency exchange
// =============================================================================

pub struct EmergencyCurrencyExchangeHandler {
    stores: Arc<Stores>,
    broker: Arc<dyn Brokerage>,
    locks: Arc<LockManager>,
    config: EngineConfig,
}

impl EmergencyCurrencyExchangeHandler {
    pub fn new(
        stores: Arc<Stores>,
        broker: Arc<dyn Brokerage>,
        locks: Arc<LockManager>,
        config: EngineConfig,
    ) -> Self {
        Self {
            stores,
            broker,
            locks,
            config,
        }
    }
}

#[async_trait]
impl JobHandler for EmergencyCurrencyExchangeHandler {
    async fn run(&self, _ctx: &JobContext) -> Result<(), EngineError> {
        let _lock = self.locks.acquire(CASH_FLOW_SYNC_LOCK, LOCK_TIMEOUT).await?;

        let base = self.config.base_currency.clone();
        let base_cash = self.stores.portfolio.get_cash(&base)?;
        if base_cash >= self.config.min_trade_size {
            debug!(base_cash, "base currency funded, no exchange needed");
            return Ok(());
        }

        // Largest foreign balance funds the exchange.
        let source = self
            .stores
            .portfolio
            .list_cash()?
            .into_iter()
            .filter(|c| c.currency != base && c.amount > 0.0)
            .max_by(|a, b| a.amount.partial_cmp(&b.amount).unwrap_or(std::cmp::Ordering::Equal));
        let Some(source) = source else {
            return Err(EngineError::invalid(
                "no foreign cash available for emergency exchange",
            ));
        };

        // The hash all pending recommendations were planned under; the
        // exchange invalidates it.
        let old_hash = PlanningInputs::load(&self.stores)?.portfolio_hash;

        let now = Utc::now().timestamp();
        let today = now - now.rem_euclid(86_400);
        let rate = self
            .broker
            .fetch_fx_rate(&source.currency, &base, today)
            .await?;
        let amount = source.amount / 2.0;

        self.stores
            .portfolio
            .set_cash(&source.currency, source.amount - amount, now)?;
        self.stores
            .portfolio
            .set_cash(&base, base_cash + amount * rate, now)?;

        // Cash moved, so every recommendation under the old hash is stale.
        let dismissed = self.stores.cache.dismiss_all_by_portfolio_hash(&old_hash)?;
        info!(
            from = %source.currency,
            amount,
            rate,
            dismissed,
            "emergency currency exchange completed"
        );
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::jobs::progress::ProgressReporter;
    use crate::jobs::{Job, JobKind};
    use crate::types::{Position, Side};
    use tokio::sync::watch;

    struct Fixture {
        _dir: tempfile::TempDir,
        stores: Arc<Stores>,
        broker: Arc<PaperBroker>,
        bus: EventBus,
        locks: Arc<LockManager>,
        _shutdown_tx: watch::Sender<bool>,
        shutdown_rx: watch::Receiver<bool>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let stores = Arc::new(Stores::open_all(dir.path()).unwrap());
        let locks = Arc::new(LockManager::new(
            dir.path().join("locks"),
            Duration::from_millis(10),
        ));
        let (tx, rx) = watch::channel(false);
        Fixture {
            _dir: dir,
            stores,
            broker: Arc::new(PaperBroker::new()),
            bus: EventBus::new(),
            locks,
            _shutdown_tx: tx,
            shutdown_rx: rx,
        }
    }

    fn job_ctx(fixture: &Fixture, kind: JobKind) -> JobContext {
        JobContext {
            job: Job::new(kind, json!({})),
            progress: ProgressReporter::new(
                fixture.bus.clone(),
                "test-sync",
                kind,
                Duration::from_millis(500),
            ),
            shutdown: fixture.shutdown_rx.clone(),
        }
    }

    #[tokio::test]
    async fn positions_sync_upserts_and_emits() {
        let fixture = fixture();
        fixture.broker.seed_position(Position {
            symbol: "AAPL".into(),
            quantity: 10.0,
            avg_cost: 100.0,
            currency: "USD".into(),
            exchange: "NASDAQ".into(),
            opened_at: 1_700_000_000,
        });
        let (_id, mut rx) = fixture.bus.subscribe(&[EventKind::PositionUpdated]);

        let handler = SyncPositionsHandler::new(
            fixture.stores.clone(),
            fixture.broker.clone(),
            fixture.bus.clone(),
        );
        handler
            .run(&job_ctx(&fixture, JobKind::SyncPositions))
            .await
            .unwrap();

        let position = fixture.stores.portfolio.get_position("AAPL").unwrap().unwrap();
        assert_eq!(position.quantity, 10.0);
        assert_eq!(rx.try_recv().unwrap().data["count"], 1);
    }

    #[tokio::test]
    async fn cash_sync_times_out_transiently_while_lock_is_held() {
        let fixture = fixture();
        fixture.broker.seed_cash("EUR", 1_000.0);

        let held = fixture
            .locks
            .acquire(CASH_FLOW_SYNC_LOCK, Duration::from_secs(1))
            .await
            .unwrap();

        // Contention classifies as transient, so the worker pool retries.
        let err: EngineError = fixture
            .locks
            .acquire(CASH_FLOW_SYNC_LOCK, Duration::from_millis(50))
            .await
            .unwrap_err()
            .into();
        assert!(err.is_retryable());

        drop(held);
        let handler = SyncCashFlowsHandler::new(
            fixture.stores.clone(),
            fixture.broker.clone(),
            fixture.locks.clone(),
        );
        handler
            .run(&job_ctx(&fixture, JobKind::SyncCashFlows))
            .await
            .unwrap();
        assert_eq!(fixture.stores.portfolio.get_cash("EUR").unwrap(), 1_000.0);
    }

    #[tokio::test]
    async fn emergency_exchange_dismisses_pending_for_the_old_hash() {
        let fixture = fixture();
        fixture.stores.portfolio.set_cash("USD", 2_000.0, 0).unwrap();
        // Base (EUR) starved: an exchange is needed.
        let old_hash = PlanningInputs::load(&fixture.stores).unwrap().portfolio_hash;
        fixture
            .stores
            .cache
            .insert_pending_recommendation(&old_hash, Side::Buy, "AAPL", 1.0, None, "r", 0)
            .unwrap();

        let handler = EmergencyCurrencyExchangeHandler::new(
            fixture.stores.clone(),
            fixture.broker.clone(),
            fixture.locks.clone(),
            EngineConfig::default(),
        );
        handler
            .run(&job_ctx(&fixture, JobKind::EmergencyCurrencyExchange))
            .await
            .unwrap();

        // Cash moved into the base currency.
        assert!(fixture.stores.portfolio.get_cash("EUR").unwrap() > 0.0);
        assert_eq!(fixture.stores.portfolio.get_cash("USD").unwrap(), 1_000.0);
        // Every pending row under the old hash flipped to dismissed.
        assert!(fixture.stores.cache.pending_recommendations().unwrap().is_empty());
    }
}
