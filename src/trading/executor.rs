// =============================================================================
// Event-Driven Trade Executor — pending recommendations into broker orders
// =============================================================================
//
// Woken by an `event-based-trading` job (enqueued when planning completes;
// the wiring goes through the bus and the queue, never by direct
// reference). One run walks the pending recommendations of the current
// portfolio hash through the safety gates and submits the survivors.
//
// Retry semantics: a retryable broker failure fails the whole attempt so
// the worker pool re-runs it with backoff — executed recommendations were
// already flipped, skipped ones are still pending, nothing is lost. An
// invalid order dismisses only its own recommendation and the batch
// continues.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use super::gates::{GateOutcome, TradeGates};
use crate::broker::{BrokerError, Brokerage};
use crate::config::EngineConfig;
use crate::db::Stores;
use crate::error::EngineError;
use crate::events::{EventBus, EventKind};
use crate::jobs::registry::{JobContext, JobHandler};
use crate::planner::batch::PlanningInputs;
use crate::types::{Recommendation, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecutorState {
    Idle,
    WaitingForPlan,
    ValidatingTrade,
    AwaitingMarket,
    Submitting,
    Confirming,
    Dismissing,
}

impl std::fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::WaitingForPlan => "waiting-for-plan",
            Self::ValidatingTrade => "validating-trade",
            Self::AwaitingMarket => "awaiting-market",
            Self::Submitting => "submitting",
            Self::Confirming => "confirming",
            Self::Dismissing => "dismissing",
        };
        f.write_str(name)
    }
}

pub struct TradeExecutorHandler {
    stores: Arc<Stores>,
    broker: Arc<dyn Brokerage>,
    gates: TradeGates,
    bus: EventBus,
    config: EngineConfig,
}

impl TradeExecutorHandler {
    pub fn new(
        stores: Arc<Stores>,
        broker: Arc<dyn Brokerage>,
        gates: TradeGates,
        bus: EventBus,
        config: EngineConfig,
    ) -> Self {
        Self {
            stores,
            broker,
            gates,
            bus,
            config,
        }
    }

    fn transition(&self, from: &mut ExecutorState, to: ExecutorState) {
        debug!(from = %from, to = %to, "executor state");
        *from = to;
    }

    /// Limit price: the hint pushed through the configured buffer, in the
    /// direction that makes the order fill. No hint means a market order.
    fn limit_price(&self, rec: &Recommendation) -> Option<f64> {
        rec.price.map(|price| match rec.side {
            Side::Buy => price * (1.0 + self.config.limit_order_buffer_percent),
            Side::Sell => price * (1.0 - self.config.limit_order_buffer_percent),
        })
    }

    async fn submit(
        &self,
        rec: &Recommendation,
        state: &mut ExecutorState,
        now: i64,
    ) -> Result<(), EngineError> {
        self.transition(state, ExecutorState::Submitting);
        let limit = self.limit_price(rec);

        let order_id = match self
            .broker
            .place_order(&rec.symbol, rec.side, rec.quantity, limit)
            .await
        {
            Ok(order_id) => order_id,
            Err(BrokerError::Invalid(reason)) => {
                self.transition(state, ExecutorState::Dismissing);
                warn!(recommendation = rec.id, symbol = %rec.symbol, reason = %reason,
                      "order invalid, dismissing recommendation");
                self.stores.cache.dismiss_recommendation(rec.id)?;
                return Err(EngineError::invalid(reason));
            }
            // Retryable: surface to the worker pool, which re-runs the
            // whole job with backoff. The recommendation stays pending.
            Err(e @ BrokerError::Retryable(_)) => return Err(e.into()),
        };

        self.transition(state, ExecutorState::Confirming);
        let currency = self
            .stores
            .universe
            .get_by_symbol(&rec.symbol)?
            .map(|s| s.currency)
            .unwrap_or_else(|| self.config.base_currency.clone());
        let fill_price = limit.or(rec.price).unwrap_or(0.0);

        self.stores.ledger.record_trade(
            &rec.symbol,
            rec.side,
            rec.quantity,
            fill_price,
            &currency,
            now,
        )?;
        self.stores.cache.mark_recommendation_executed(rec.id, now)?;

        info!(order_id = %order_id, symbol = %rec.symbol, side = %rec.side,
              quantity = rec.quantity, "trade executed");
        self.bus.emit(
            EventKind::TradeExecuted,
            "trade-executor",
            json!({
                "order_id": order_id,
                "recommendation_id": rec.id,
                "symbol": rec.symbol,
                "side": rec.side.as_str(),
                "quantity": rec.quantity,
                "price": fill_price,
                "portfolio_hash": rec.portfolio_hash,
            }),
        );

        Ok(())
    }
}

#[async_trait]
impl JobHandler for TradeExecutorHandler {
    async fn run(&self, ctx: &JobContext) -> Result<(), EngineError> {
        let mut state = ExecutorState::Idle;
        self.transition(&mut state, ExecutorState::WaitingForPlan);

        let pending = self.stores.cache.pending_recommendations()?;
        if pending.is_empty() {
            self.transition(&mut state, ExecutorState::Idle);
            return Ok(());
        }

        // Staleness gate: recommendations under any hash other than the
        // current portfolio's are dismissed wholesale.
        let current_hash = PlanningInputs::load(&self.stores)?.portfolio_hash;
        let mut stale_hashes: Vec<&str> = pending
            .iter()
            .filter(|r| r.portfolio_hash != current_hash)
            .map(|r| r.portfolio_hash.as_str())
            .collect();
        stale_hashes.sort_unstable();
        stale_hashes.dedup();
        if !stale_hashes.is_empty() {
            self.transition(&mut state, ExecutorState::Dismissing);
            for hash in stale_hashes {
                let dismissed = self.stores.cache.dismiss_all_by_portfolio_hash(hash)?;
                info!(portfolio_hash = %hash, dismissed, "dismissed stale recommendations");
            }
        }

        let current: Vec<&Recommendation> = pending
            .iter()
            .filter(|r| r.portfolio_hash == current_hash)
            .collect();
        if current.is_empty() {
            self.transition(&mut state, ExecutorState::Idle);
            return Ok(());
        }

        let now = Utc::now().timestamp();
        let mut invalid: Vec<String> = Vec::new();

        for rec in current {
            if ctx.is_shutting_down() {
                return Err(EngineError::transient("trading interrupted by shutdown"));
            }

            self.transition(&mut state, ExecutorState::ValidatingTrade);
            match self.gates.check_at(rec, now).await? {
                GateOutcome::Approved => match self.submit(rec, &mut state, now).await {
                    Ok(()) => {}
                    Err(EngineError::Invalid(reason)) => invalid.push(reason),
                    Err(e) => return Err(e),
                },
                GateOutcome::Skip(reason) => {
                    self.transition(&mut state, ExecutorState::AwaitingMarket);
                    info!(recommendation = rec.id, symbol = %rec.symbol, reason = %reason,
                          "recommendation skipped this cycle");
                }
                GateOutcome::Dismiss(reason) => {
                    self.transition(&mut state, ExecutorState::Dismissing);
                    warn!(recommendation = rec.id, symbol = %rec.symbol, reason = %reason,
                          "recommendation dismissed");
                    self.stores.cache.dismiss_recommendation(rec.id)?;
                }
            }
        }

        self.transition(&mut state, ExecutorState::Idle);

        // Invalid orders were dismissed individually; the attempt itself
        // still fails (and is never retried) so the failure is observable.
        if !invalid.is_empty() {
            return Err(EngineError::invalid(invalid.join("; ")));
        }
        Ok(())
    }
}
