// =============================================================================
// Jobs — kinds, descriptions, and the queued job record
// =============================================================================
//
// Every background activity of the engine is a job. The queue stores the
// kind as an opaque string; dispatch parses it back into `JobKind`, and an
// unknown string fails the job with "no handler registered" without ever
// reaching a handler.
// =============================================================================

pub mod progress;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod worker;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Every job kind the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    // ── Planning pipeline ───────────────────────────────────────────────
    PlannerBatch,
    GeneratePortfolioHash,
    GetOptimizerWeights,
    BuildOpportunityContext,
    IdentifyOpportunities,
    GenerateSequences,
    EvaluateSequences,
    CreateTradePlan,
    StoreRecommendations,

    // ── Trading ─────────────────────────────────────────────────────────
    EventBasedTrading,
    DividendReinvest,
    EmergencyCurrencyExchange,
    CancelStaleOrders,

    // ── Brokerage sync ──────────────────────────────────────────────────
    SyncPositions,
    SyncTrades,
    SyncPrices,
    SyncCashFlows,
    SyncCashBalances,
    SyncFxRates,
    SyncSecurities,
    SyncDividends,
    SyncOrders,

    // ── Derived data ────────────────────────────────────────────────────
    RebuildMonthlyAggregates,
    RefreshAllocationTargets,
    RecalculatePortfolioMetrics,
    RollForwardPrices,
    ReconcileLedger,

    // ── Adaptation & discovery ──────────────────────────────────────────
    AdaptiveMarket,
    FormulaDiscovery,
    ScoreUniverse,
    RefreshOptimizerWeights,

    // ── Market data ─────────────────────────────────────────────────────
    RefreshMarketCalendars,
    WarmMarketStatusCache,

    // ── Maintenance ─────────────────────────────────────────────────────
    Backup,
    VacuumDatabases,
    ClearStuckLocks,
    PruneCache,
    PruneJobHistory,
    HealthCheck,
    DismissStaleRecommendations,

    // ── Universe upkeep ─────────────────────────────────────────────────
    RefreshSecurityTags,
    RetireDelistedSecurities,
    ImportTransactions,
    ExportLedger,
    BuildCountryGroups,
    BuildIndustryGroups,
}

impl JobKind {
    /// All kinds, in declaration order. Test properties iterate this.
    pub const ALL: &'static [JobKind] = &[
        Self::PlannerBatch,
        Self::GeneratePortfolioHash,
        Self::GetOptimizerWeights,
        Self::BuildOpportunityContext,
        Self::IdentifyOpportunities,
        Self::GenerateSequences,
        Self::EvaluateSequences,
        Self::CreateTradePlan,
        Self::StoreRecommendations,
        Self::EventBasedTrading,
        Self::DividendReinvest,
        Self::EmergencyCurrencyExchange,
        Self::CancelStaleOrders,
        Self::SyncPositions,
        Self::SyncTrades,
        Self::SyncPrices,
        Self::SyncCashFlows,
        Self::SyncCashBalances,
        Self::SyncFxRates,
        Self::SyncSecurities,
        Self::SyncDividends,
        Self::SyncOrders,
        Self::RebuildMonthlyAggregates,
        Self::RefreshAllocationTargets,
        Self::RecalculatePortfolioMetrics,
        Self::RollForwardPrices,
        Self::ReconcileLedger,
        Self::AdaptiveMarket,
        Self::FormulaDiscovery,
        Self::ScoreUniverse,
        Self::RefreshOptimizerWeights,
        Self::RefreshMarketCalendars,
        Self::WarmMarketStatusCache,
        Self::Backup,
        Self::VacuumDatabases,
        Self::ClearStuckLocks,
        Self::PruneCache,
        Self::PruneJobHistory,
        Self::HealthCheck,
        Self::DismissStaleRecommendations,
        Self::RefreshSecurityTags,
        Self::RetireDelistedSecurities,
        Self::ImportTransactions,
        Self::ExportLedger,
        Self::BuildCountryGroups,
        Self::BuildIndustryGroups,
    ];

    /// Stable wire name, used as the queue's kind column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlannerBatch => "planner-batch",
            Self::GeneratePortfolioHash => "generate-portfolio-hash",
            Self::GetOptimizerWeights => "get-optimizer-weights",
            Self::BuildOpportunityContext => "build-opportunity-context",
            Self::IdentifyOpportunities => "identify-opportunities",
            Self::GenerateSequences => "generate-sequences",
            Self::EvaluateSequences => "evaluate-sequences",
            Self::CreateTradePlan => "create-trade-plan",
            Self::StoreRecommendations => "store-recommendations",
            Self::EventBasedTrading => "event-based-trading",
            Self::DividendReinvest => "dividend-reinvest",
            Self::EmergencyCurrencyExchange => "emergency-currency-exchange",
            Self::CancelStaleOrders => "cancel-stale-orders",
            Self::SyncPositions => "sync-positions",
            Self::SyncTrades => "sync-trades",
            Self::SyncPrices => "sync-prices",
            Self::SyncCashFlows => "sync-cash-flows",
            Self::SyncCashBalances => "sync-cash-balances",
            Self::SyncFxRates => "sync-fx-rates",
            Self::SyncSecurities => "sync-securities",
            Self::SyncDividends => "sync-dividends",
            Self::SyncOrders => "sync-orders",
            Self::RebuildMonthlyAggregates => "rebuild-monthly-aggregates",
            Self::RefreshAllocationTargets => "refresh-allocation-targets",
            Self::RecalculatePortfolioMetrics => "recalculate-portfolio-metrics",
            Self::RollForwardPrices => "roll-forward-prices",
            Self::ReconcileLedger => "reconcile-ledger",
            Self::AdaptiveMarket => "adaptive-market",
            Self::FormulaDiscovery => "formula-discovery",
            Self::ScoreUniverse => "score-universe",
            Self::RefreshOptimizerWeights => "refresh-optimizer-weights",
            Self::RefreshMarketCalendars => "refresh-market-calendars",
            Self::WarmMarketStatusCache => "warm-market-status-cache",
            Self::Backup => "backup",
            Self::VacuumDatabases => "vacuum-databases",
            Self::ClearStuckLocks => "clear-stuck-locks",
            Self::PruneCache => "prune-cache",
            Self::PruneJobHistory => "prune-job-history",
            Self::HealthCheck => "health-check",
            Self::DismissStaleRecommendations => "dismiss-stale-recommendations",
            Self::RefreshSecurityTags => "refresh-security-tags",
            Self::RetireDelistedSecurities => "retire-delisted-securities",
            Self::ImportTransactions => "import-transactions",
            Self::ExportLedger => "export-ledger",
            Self::BuildCountryGroups => "build-country-groups",
            Self::BuildIndustryGroups => "build-industry-groups",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == s)
    }

    /// Human-readable label carried by every lifecycle event.
    pub fn description(&self) -> &'static str {
        match self {
            Self::PlannerBatch => "Plan candidate trade sequences for the current portfolio",
            Self::GeneratePortfolioHash => "Fingerprint the current portfolio",
            Self::GetOptimizerWeights => "Load optimizer weights for planning",
            Self::BuildOpportunityContext => "Assemble the opportunity context",
            Self::IdentifyOpportunities => "Identify trading opportunities",
            Self::GenerateSequences => "Generate candidate action sequences",
            Self::EvaluateSequences => "Evaluate candidate action sequences",
            Self::CreateTradePlan => "Select the best sequence as the trade plan",
            Self::StoreRecommendations => "Materialize recommendations from the best sequence",
            Self::EventBasedTrading => "Execute pending trade recommendations",
            Self::DividendReinvest => "Reinvest received dividends",
            Self::EmergencyCurrencyExchange => "Rebalance cash across currencies",
            Self::CancelStaleOrders => "Cancel stale open orders",
            Self::SyncPositions => "Synchronize positions from the brokerage",
            Self::SyncTrades => "Synchronize trades from the brokerage",
            Self::SyncPrices => "Synchronize daily security prices",
            Self::SyncCashFlows => "Synchronize cash flows from the brokerage",
            Self::SyncCashBalances => "Synchronize cash balances from the brokerage",
            Self::SyncFxRates => "Synchronize foreign exchange rates",
            Self::SyncSecurities => "Synchronize the security universe",
            Self::SyncDividends => "Synchronize dividend payments",
            Self::SyncOrders => "Synchronize open orders from the brokerage",
            Self::RebuildMonthlyAggregates => "Rebuild monthly price aggregates",
            Self::RefreshAllocationTargets => "Refresh allocation targets",
            Self::RecalculatePortfolioMetrics => "Recalculate portfolio metrics",
            Self::RollForwardPrices => "Fill forward missing daily prices",
            Self::ReconcileLedger => "Reconcile the ledger against brokerage records",
            Self::AdaptiveMarket => "Adapt planner weights to market conditions",
            Self::FormulaDiscovery => "Search for improved scoring formulas",
            Self::ScoreUniverse => "Score every security in the universe",
            Self::RefreshOptimizerWeights => "Refit optimizer weights",
            Self::RefreshMarketCalendars => "Refresh exchange calendar data",
            Self::WarmMarketStatusCache => "Warm the market status cache",
            Self::Backup => "Back up the databases",
            Self::VacuumDatabases => "Compact the databases",
            Self::ClearStuckLocks => "Remove stale lock files",
            Self::PruneCache => "Prune expired cache entries",
            Self::PruneJobHistory => "Prune old job history rows",
            Self::HealthCheck => "Check the health of the engine",
            Self::DismissStaleRecommendations => "Dismiss recommendations for stale portfolio hashes",
            Self::RefreshSecurityTags => "Refresh security tag assignments",
            Self::RetireDelistedSecurities => "Retire delisted securities from the universe",
            Self::ImportTransactions => "Import externally recorded transactions",
            Self::ExportLedger => "Export the ledger for archival",
            Self::BuildCountryGroups => "Rebuild country allocation groups",
            Self::BuildIndustryGroups => "Rebuild industry allocation groups",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome recorded in job history per attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Failed,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// A queued unit of work.
///
/// `kind` is the opaque wire string; dispatch parses it. `payload` is
/// handler-specific.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: String,
    pub payload: serde_json::Value,
    /// Earliest Unix second the job may be dequeued.
    pub available_at: i64,
    pub retries: u32,
    pub max_retries: u32,
    pub enqueued_at: i64,
}

impl Job {
    pub fn new(kind: JobKind, payload: serde_json::Value) -> Self {
        let now = Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.as_str().to_string(),
            payload,
            available_at: now,
            retries: 0,
            max_retries: 3,
            enqueued_at: now,
        }
    }

    pub fn with_available_at(mut self, available_at: i64) -> Self {
        self.available_at = available_at;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}
