// =============================================================================
// Filters — policy stages that remove disallowed sequences
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;

use super::opportunity::OpportunityContext;
use crate::error::EngineError;
use crate::types::ActionSequence;

pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(
        &self,
        sequences: Vec<ActionSequence>,
        ctx: &OpportunityContext,
    ) -> Result<Vec<ActionSequence>, EngineError>;
}

pub struct FilterRegistry {
    filters: RwLock<Vec<Arc<dyn Filter>>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self {
            filters: RwLock::new(Vec::new()),
        }
    }

    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(UniverseEligibilityFilter));
        registry.register(Arc::new(SymbolDiversityFilter));
        registry.register(Arc::new(RecentTradeFilter));
        registry
    }

    pub fn register(&self, filter: Arc<dyn Filter>) {
        self.filters.write().push(filter);
    }

    pub fn get_enabled(&self, names: &[&str]) -> Vec<Arc<dyn Filter>> {
        let filters = self.filters.read();
        names
            .iter()
            .filter_map(|name| filters.iter().find(|f| f.name() == *name).cloned())
            .collect()
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Built-in filters
// =============================================================================

/// Every action must reference a universe member with a positive,
/// lot-aligned quantity.
pub struct UniverseEligibilityFilter;

impl Filter for UniverseEligibilityFilter {
    fn name(&self) -> &'static str {
        "universe_eligibility"
    }

    fn apply(
        &self,
        sequences: Vec<ActionSequence>,
        ctx: &OpportunityContext,
    ) -> Result<Vec<ActionSequence>, EngineError> {
        Ok(sequences
            .into_iter()
            .filter(|sequence| {
                sequence.actions.iter().all(|action| {
                    let Some(security) = ctx.universe.get(&action.symbol) else {
                        return false;
                    };
                    if action.quantity <= 0.0 {
                        return false;
                    }
                    let lots = action.quantity / security.min_lot.max(f64::EPSILON);
                    (lots - lots.round()).abs() < 1e-6
                })
            })
            .collect())
    }
}

/// Reject sequences that double up on a symbol or concentrate more than
/// two actions in one industry group.
pub struct SymbolDiversityFilter;

impl Filter for SymbolDiversityFilter {
    fn name(&self) -> &'static str {
        "symbol_diversity"
    }

    fn apply(
        &self,
        sequences: Vec<ActionSequence>,
        ctx: &OpportunityContext,
    ) -> Result<Vec<ActionSequence>, EngineError> {
        Ok(sequences
            .into_iter()
            .filter(|sequence| {
                let mut symbols = HashSet::new();
                let mut industry_counts: std::collections::HashMap<&str, u32> =
                    std::collections::HashMap::new();

                for action in &sequence.actions {
                    if !symbols.insert(action.symbol.as_str()) {
                        return false;
                    }
                    if let Some(security) = ctx.universe.get(&action.symbol) {
                        let count = industry_counts.entry(security.industry.as_str()).or_insert(0);
                        *count += 1;
                        if *count > 2 {
                            return false;
                        }
                    }
                }
                true
            })
            .collect())
    }
}

/// Reject sequences touching symbols traded within the recency window.
pub struct RecentTradeFilter;

impl Filter for RecentTradeFilter {
    fn name(&self) -> &'static str {
        "recent_trade"
    }

    fn apply(
        &self,
        sequences: Vec<ActionSequence>,
        ctx: &OpportunityContext,
    ) -> Result<Vec<ActionSequence>, EngineError> {
        Ok(sequences
            .into_iter()
            .filter(|sequence| {
                sequence
                    .symbols()
                    .all(|symbol| !ctx.recently_traded.contains(symbol))
            })
            .collect())
    }
}
