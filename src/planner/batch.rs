// =============================================================================
// Planning Batch — fingerprint, plan, evaluate, store, repeat
// =============================================================================
//
// One `planner-batch` job drives the eight sub-steps, each surfaced through
// the progress reporter under the sub-step's registered description:
//
//   generate-portfolio-hash  -> get-optimizer-weights
//   build-opportunity-context -> identify-opportunities
//   generate-sequences        -> evaluate-sequences
//   create-trade-plan         -> store-recommendations
//
// Equal fingerprints reproduce equal best results: every input is loaded in
// sorted order, evaluation is pure arithmetic over that order, and the
// best-result update is a strict-improvement RMW inside one transaction.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info};

use super::fingerprint::portfolio_fingerprint;
use super::opportunity::{build_opportunity_context, OpportunityContext, OptimizerWeights};
use super::sequence::SequenceService;
use crate::config::{EngineConfig, PlannerSettings};
use crate::db::Stores;
use crate::error::EngineError;
use crate::events::{EventBus, EventKind};
use crate::jobs::queue::JobQueue;
use crate::jobs::registry::{JobContext, JobHandler};
use crate::jobs::{Job, JobKind};
use crate::types::{ActionSequence, CashBalance, Evaluation, Position, Security};

const STEPS: u64 = 8;

/// Key under which optimizer weights live in the settings store.
pub const OPTIMIZER_WEIGHTS_KEY: &str = "optimizer_weights";

/// Everything a planning pass (or the executor's staleness gate) loads.
pub struct PlanningInputs {
    pub portfolio_hash: String,
    pub positions: Vec<Position>,
    pub cash: Vec<CashBalance>,
    pub securities: Vec<Security>,
    pub weights: OptimizerWeights,
    pub planner: PlannerSettings,
}

impl PlanningInputs {
    pub fn load(stores: &Stores) -> Result<Self, EngineError> {
        let positions = stores.portfolio.list_positions()?;
        let cash = stores.portfolio.list_cash()?;
        let securities = stores.universe.list_securities()?;

        let weights: OptimizerWeights = match stores.settings.get(OPTIMIZER_WEIGHTS_KEY)? {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| EngineError::invalid(format!("bad optimizer weights: {e}")))?,
            None => OptimizerWeights::default(),
        };
        let planner = stores.settings.load_planner_settings()?;

        let portfolio_hash =
            portfolio_fingerprint(&positions, &cash, &securities, &weights, &planner);

        Ok(Self {
            portfolio_hash,
            positions,
            cash,
            securities,
            weights,
            planner,
        })
    }
}

pub struct PlannerBatchHandler {
    stores: Arc<Stores>,
    queue: Arc<JobQueue>,
    bus: EventBus,
    sequences: Arc<SequenceService>,
    config: EngineConfig,
}

impl PlannerBatchHandler {
    pub fn new(
        stores: Arc<Stores>,
        queue: Arc<JobQueue>,
        bus: EventBus,
        sequences: Arc<SequenceService>,
        config: EngineConfig,
    ) -> Self {
        Self {
            stores,
            queue,
            bus,
            sequences,
            config,
        }
    }

    fn build_context(&self, inputs: &PlanningInputs) -> Result<OpportunityContext, EngineError> {
        let mut prices = BTreeMap::new();
        for security in &inputs.securities {
            if let Some(close) = self.stores.history.latest_close(&security.symbol)? {
                prices.insert(security.symbol.clone(), close);
            }
        }

        let now = Utc::now().timestamp();
        let window_start = now - self.config.sell_cooldown_secs;
        let mut recently_traded = BTreeSet::new();
        for security in &inputs.securities {
            if let Some(at) = self.stores.ledger.last_trade_at(&security.symbol)? {
                if at >= window_start {
                    recently_traded.insert(security.symbol.clone());
                }
            }
        }

        Ok(build_opportunity_context(
            inputs.portfolio_hash.clone(),
            inputs.positions.clone(),
            inputs.cash.clone(),
            inputs.securities.clone(),
            &prices,
            recently_traded,
            inputs.weights.clone(),
        ))
    }

    fn store_recommendations(&self, hash: &str, now: i64) -> Result<usize, EngineError> {
        let Some(best) = self.stores.agents.best_result(hash)? else {
            return Ok(0);
        };

        // Re-running a batch for an unchanged hash replaces its pending
        // set instead of stacking duplicates.
        self.stores.cache.dismiss_all_by_portfolio_hash(hash)?;

        let mut stored = 0;
        for action in &best.sequence.actions {
            let rationale = format!(
                "{} sequence, fitness {:.6}",
                best.sequence.provenance, best.fitness
            );
            let id = self.stores.cache.insert_pending_recommendation(
                hash,
                action.side,
                &action.symbol,
                action.quantity,
                action.price_hint,
                &rationale,
                now,
            )?;
            stored += 1;

            self.bus.emit(
                EventKind::RecommendationCreated,
                "planner",
                json!({
                    "recommendation_id": id,
                    "portfolio_hash": hash,
                    "symbol": action.symbol,
                    "side": action.side.as_str(),
                    "quantity": action.quantity,
                }),
            );
        }
        Ok(stored)
    }
}

#[async_trait]
impl JobHandler for PlannerBatchHandler {
    async fn run(&self, ctx: &JobContext) -> Result<(), EngineError> {
        let progress = &ctx.progress;
        let now = Utc::now().timestamp();

        // 1. Fingerprint.
        progress.report(0, STEPS, JobKind::GeneratePortfolioHash.description());
        let inputs = PlanningInputs::load(&self.stores)?;
        let hash = inputs.portfolio_hash.clone();
        debug!(portfolio_hash = %hash, "planning batch fingerprinted");

        // Pending recommendations under any other hash are stale now.
        let dismissed = self.stores.cache.dismiss_pending_except_hash(&hash)?;
        if dismissed > 0 {
            info!(dismissed, portfolio_hash = %hash, "dismissed stale pending recommendations");
        }

        // A fresh best result for this hash lets the batch short-circuit.
        if let Some(best) = self.stores.agents.best_result(&hash)? {
            if now - best.evaluated_at < inputs.planner.result_ttl_secs {
                debug!(portfolio_hash = %hash, "best result still fresh, short-circuiting");
                progress.report(STEPS, STEPS, "reused fresh best result");
                self.bus.emit(
                    EventKind::PlanningCompleted,
                    "planner",
                    json!({
                        "portfolio_hash": hash,
                        "sequences_evaluated": 0,
                        "short_circuit": true,
                    }),
                );
                return Ok(());
            }
        }

        // 2. Optimizer weights (loaded with the inputs; reported as its own
        // step for observers).
        progress.report(1, STEPS, JobKind::GetOptimizerWeights.description());

        // 3-4. Opportunity model.
        progress.report(2, STEPS, JobKind::BuildOpportunityContext.description());
        let context = self.build_context(&inputs)?;
        progress.report(3, STEPS, JobKind::IdentifyOpportunities.description());
        debug!(
            opportunities = context.opportunities.len(),
            "opportunity model built"
        );

        // 5. Sequence generation.
        progress.report(4, STEPS, JobKind::GenerateSequences.description());
        let mut sequences = self.sequences.generate(&context, &inputs.planner)?;
        let partial = sequences.len() > inputs.planner.max_sequences;
        if partial {
            sequences.truncate(inputs.planner.max_sequences);
        }

        // 6. Evaluation.
        progress.report(5, STEPS, JobKind::EvaluateSequences.description());
        let total = sequences.len() as u64;
        let mut best: Option<(ActionSequence, f64)> = None;
        for (index, sequence) in sequences.iter().enumerate() {
            if ctx.is_shutting_down() {
                return Err(EngineError::transient("planning interrupted by shutdown"));
            }

            let fitness = evaluate_sequence(sequence, &context);
            self.stores.agents.insert_sequence(sequence, now)?;
            self.stores.agents.insert_evaluation(
                &hash,
                &Evaluation {
                    sequence_id: sequence.id.clone(),
                    fitness,
                    complexity: sequence.actions.len() as u32,
                    evaluated_at: now,
                },
            )?;

            if best.as_ref().map_or(true, |(_, current)| fitness > *current) {
                best = Some((sequence.clone(), fitness));
            }
            progress.report(index as u64 + 1, total, "evaluating sequences");
        }

        // 7. Trade plan (transactional best-result update).
        progress.report(6, STEPS, JobKind::CreateTradePlan.description());
        if let Some((sequence, fitness)) = &best {
            self.stores
                .agents
                .try_update_best(&hash, sequence, *fitness, now)?;
        }

        // 8. Materialize recommendations.
        progress.report(7, STEPS, JobKind::StoreRecommendations.description());
        let stored = self.store_recommendations(&hash, now)?;

        progress.report(STEPS, STEPS, "planning batch complete");
        info!(
            portfolio_hash = %hash,
            evaluated = sequences.len(),
            recommendations = stored,
            partial,
            "planning batch finished"
        );

        if partial {
            // Sequence space only partially explored: trigger the next
            // iteration through the queue, never by direct recursion.
            let follow_up = Job::new(JobKind::PlannerBatch, json!({ "continuation": true }))
                .with_available_at(Utc::now().timestamp());
            self.queue.enqueue(&follow_up)?;
        } else {
            self.bus.emit(
                EventKind::PlanningCompleted,
                "planner",
                json!({
                    "portfolio_hash": hash,
                    "sequences_evaluated": sequences.len(),
                    "short_circuit": false,
                }),
            );
        }

        Ok(())
    }
}

/// Deterministic fitness: buys earn their opportunity score weighted by
/// trade value (plus a cash-drag relief term), sells earn the inverse, and
/// multi-leg sequences pay a complexity penalty.
fn evaluate_sequence(sequence: &ActionSequence, ctx: &OpportunityContext) -> f64 {
    let total = ctx.total_value.max(1.0);
    let mut fitness = 0.0;

    for action in &sequence.actions {
        let score = ctx
            .opportunities
            .iter()
            .find(|o| o.symbol == action.symbol)
            .map(|o| o.score)
            .unwrap_or(0.0);
        let price = action
            .price_hint
            .or_else(|| ctx.price_of(&action.symbol))
            .unwrap_or(0.0);
        let value_fraction = action.quantity * price / total;

        match action.side {
            crate::types::Side::Buy => {
                fitness += score * value_fraction + ctx.weights.cash_drag * value_fraction;
            }
            crate::types::Side::Sell => {
                fitness -= score * value_fraction;
            }
        }
    }

    fitness - ctx.weights.complexity_penalty * (sequence.actions.len() as f64 - 1.0)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::progress::ProgressReporter;
    use crate::planner::filters::FilterRegistry;
    use crate::planner::generators::GeneratorRegistry;
    use crate::planner::patterns::PatternRegistry;
    use crate::types::Security;
    use std::time::Duration;
    use tokio::sync::watch;

    struct Fixture {
        _dir: tempfile::TempDir,
        stores: Arc<Stores>,
        queue: Arc<JobQueue>,
        bus: EventBus,
        handler: PlannerBatchHandler,
        _shutdown_tx: watch::Sender<bool>,
        shutdown_rx: watch::Receiver<bool>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let stores = Arc::new(Stores::open_all(dir.path()).unwrap());
        let queue = Arc::new(JobQueue::open(dir.path().join("cache.db")).unwrap());
        let bus = EventBus::new();
        let sequences = Arc::new(SequenceService::new(
            Arc::new(PatternRegistry::with_builtins()),
            Arc::new(GeneratorRegistry::with_builtins()),
            Arc::new(FilterRegistry::with_builtins()),
        ));
        let handler = PlannerBatchHandler::new(
            stores.clone(),
            queue.clone(),
            bus.clone(),
            sequences,
            EngineConfig::default(),
        );
        let (tx, rx) = watch::channel(false);

        Fixture {
            _dir: dir,
            stores,
            queue,
            bus,
            handler,
            _shutdown_tx: tx,
            shutdown_rx: rx,
        }
    }

    fn seed_market(stores: &Stores, cash: f64) {
        for (isin, symbol, price) in [
            ("US0378331005", "AAPL", 100.0),
            ("US5949181045", "MSFT", 50.0),
        ] {
            stores
                .universe
                .upsert_security(&Security {
                    isin: isin.into(),
                    symbol: symbol.into(),
                    name: symbol.into(),
                    exchange: "NASDAQ".into(),
                    currency: "USD".into(),
                    min_lot: 1.0,
                    country: "US".into(),
                    industry: "Technology".into(),
                })
                .unwrap();
            stores
                .history
                .upsert_price(symbol, 19_000, price, price, price, price, 1000.0)
                .unwrap();
        }
        stores.portfolio.set_cash("USD", cash, 19_000).unwrap();
    }

    fn job_ctx(fixture: &Fixture) -> JobContext {
        JobContext {
            job: Job::new(JobKind::PlannerBatch, json!({})),
            progress: ProgressReporter::new(
                fixture.bus.clone(),
                "test-batch",
                JobKind::PlannerBatch,
                Duration::from_millis(500),
            ),
            shutdown: fixture.shutdown_rx.clone(),
        }
    }

    /// Disable the freshness short-circuit so repeated runs replan.
    fn disable_result_ttl(stores: &Stores) {
        let mut planner = PlannerSettings::default();
        planner.result_ttl_secs = 0;
        stores.settings.save_planner_settings(&planner, 19_000).unwrap();
    }

    #[tokio::test]
    async fn batch_stores_best_result_and_pending_recommendations() {
        let fixture = fixture();
        seed_market(&fixture.stores, 1000.0);
        let (_id, mut rx) = fixture.bus.subscribe(&[EventKind::PlanningCompleted]);

        fixture.handler.run(&job_ctx(&fixture)).await.unwrap();

        let completed = rx.try_recv().unwrap();
        assert_eq!(completed.data["short_circuit"], false);
        let hash = completed.data["portfolio_hash"].as_str().unwrap().to_string();

        let best = fixture.stores.agents.best_result(&hash).unwrap().unwrap();
        assert!(best.fitness > 0.0);

        let pending = fixture.stores.cache.pending_recommendations().unwrap();
        assert!(!pending.is_empty());
        assert!(pending.iter().all(|r| r.portfolio_hash == hash));

        // Best result is the argmax over this hash's evaluations.
        let evaluations = fixture.stores.agents.evaluations_for_hash(&hash).unwrap();
        let max = evaluations
            .iter()
            .map(|e| e.fitness)
            .fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(best.fitness, max);
    }

    #[tokio::test]
    async fn identical_portfolios_plan_identically() {
        let fixture = fixture();
        seed_market(&fixture.stores, 1000.0);
        disable_result_ttl(&fixture.stores);

        fixture.handler.run(&job_ctx(&fixture)).await.unwrap();
        let hash = PlanningInputs::load(&fixture.stores).unwrap().portfolio_hash;
        let first = fixture.stores.agents.best_result(&hash).unwrap().unwrap();

        fixture.handler.run(&job_ctx(&fixture)).await.unwrap();
        let second = fixture.stores.agents.best_result(&hash).unwrap().unwrap();

        assert_eq!(first.sequence, second.sequence);
        assert_eq!(first.fitness, second.fitness);
    }

    #[tokio::test]
    async fn rerun_replaces_pending_instead_of_stacking() {
        let fixture = fixture();
        seed_market(&fixture.stores, 1000.0);
        disable_result_ttl(&fixture.stores);

        fixture.handler.run(&job_ctx(&fixture)).await.unwrap();
        let first_count = fixture.stores.cache.pending_recommendations().unwrap().len();

        fixture.handler.run(&job_ctx(&fixture)).await.unwrap();
        let second_count = fixture.stores.cache.pending_recommendations().unwrap().len();
        assert_eq!(first_count, second_count);
    }

    #[tokio::test]
    async fn hash_change_dismisses_old_pending_rows_first() {
        let fixture = fixture();
        seed_market(&fixture.stores, 1000.0);
        disable_result_ttl(&fixture.stores);

        fixture.handler.run(&job_ctx(&fixture)).await.unwrap();
        let old_pending = fixture.stores.cache.pending_recommendations().unwrap();
        assert!(!old_pending.is_empty());
        let old_hash = old_pending[0].portfolio_hash.clone();

        // Cash moves: the fingerprint changes.
        fixture.stores.portfolio.set_cash("USD", 500.0, 19_100).unwrap();
        fixture.handler.run(&job_ctx(&fixture)).await.unwrap();

        let pending = fixture.stores.cache.pending_recommendations().unwrap();
        assert!(!pending.is_empty());
        assert!(pending.iter().all(|r| r.portfolio_hash != old_hash));
    }

    #[tokio::test]
    async fn capped_exploration_re_enqueues_itself() {
        let fixture = fixture();
        seed_market(&fixture.stores, 1000.0);
        // A budget of one forces a partial batch.
        let mut planner = PlannerSettings::default();
        planner.max_sequences = 1;
        fixture.stores.settings.save_planner_settings(&planner, 19_000).unwrap();
        let (_id, mut rx) = fixture.bus.subscribe(&[EventKind::PlanningCompleted]);

        fixture.handler.run(&job_ctx(&fixture)).await.unwrap();

        // No completion event; instead the next iteration sits in the queue.
        assert!(rx.try_recv().is_err());
        assert!(fixture.queue.contains_kind(JobKind::PlannerBatch.as_str()).unwrap());
        let follow_up = fixture
            .queue
            .dequeue(Utc::now().timestamp() + 1)
            .unwrap()
            .unwrap();
        assert_eq!(follow_up.payload["continuation"], true);
    }

    #[tokio::test]
    async fn fresh_best_result_short_circuits() {
        let fixture = fixture();
        seed_market(&fixture.stores, 1000.0);
        let (_id, mut rx) = fixture.bus.subscribe(&[EventKind::PlanningCompleted]);

        fixture.handler.run(&job_ctx(&fixture)).await.unwrap();
        let hash = rx.try_recv().unwrap().data["portfolio_hash"]
            .as_str()
            .unwrap()
            .to_string();
        let evaluations_after_first =
            fixture.stores.agents.evaluations_for_hash(&hash).unwrap().len();

        // Default TTL is 10 minutes: the second run reuses the result.
        fixture.handler.run(&job_ctx(&fixture)).await.unwrap();
        let completed = rx.try_recv().unwrap();
        assert_eq!(completed.data["short_circuit"], true);

        let evaluations_after_second =
            fixture.stores.agents.evaluations_for_hash(&hash).unwrap().len();
        assert_eq!(evaluations_after_first, evaluations_after_second);
    }
}
