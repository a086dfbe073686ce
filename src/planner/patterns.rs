// =============================================================================
// Patterns — pluggable producers of candidate action sequences
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use super::opportunity::OpportunityContext;
use crate::error::EngineError;
use crate::types::{Action, ActionSequence, Side};

/// A pattern turns the opportunity model into zero or more candidate
/// sequences.
pub trait Pattern: Send + Sync {
    fn name(&self) -> &'static str;
    fn generate(&self, ctx: &OpportunityContext) -> Result<Vec<ActionSequence>, EngineError>;
}

/// Thread-safe under concurrent reads; registration happens once at
/// startup.
pub struct PatternRegistry {
    patterns: RwLock<Vec<Arc<dyn Pattern>>>,
}

impl PatternRegistry {
    pub fn new() -> Self {
        Self {
            patterns: RwLock::new(Vec::new()),
        }
    }

    /// Registry with every built-in pattern installed.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(SingleBuyPattern));
        registry.register(Arc::new(RebalanceOverweightPattern));
        registry.register(Arc::new(SwapPairPattern));
        registry
    }

    pub fn register(&self, pattern: Arc<dyn Pattern>) {
        self.patterns.write().push(pattern);
    }

    /// Enabled patterns in the order `names` lists them.
    pub fn get_enabled(&self, names: &[&str]) -> Vec<Arc<dyn Pattern>> {
        let patterns = self.patterns.read();
        names
            .iter()
            .filter_map(|name| patterns.iter().find(|p| p.name() == *name).cloned())
            .collect()
    }

    /// Run every enabled pattern and concatenate outputs. A failing
    /// pattern is logged and skipped; the pipeline continues.
    pub fn generate_sequences(
        &self,
        ctx: &OpportunityContext,
        names: &[&str],
    ) -> Vec<ActionSequence> {
        let mut sequences = Vec::new();
        for pattern in self.get_enabled(names) {
            match pattern.generate(ctx) {
                Ok(mut generated) => sequences.append(&mut generated),
                Err(e) => warn!(pattern = pattern.name(), error = %e, "pattern failed"),
            }
        }
        sequences
    }
}

impl Default for PatternRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Round a raw quantity down to a whole number of lots.
pub(crate) fn lot_quantity(raw: f64, min_lot: f64) -> f64 {
    if min_lot <= 0.0 {
        return raw.floor().max(0.0);
    }
    (raw / min_lot).floor() * min_lot
}

// =============================================================================
// Built-in patterns
// =============================================================================

/// Pattern fan-out cap per invocation; the generators multiply from here.
const MAX_CANDIDATES: usize = 8;

/// One buy per top-scored underweight opportunity.
pub struct SingleBuyPattern;

impl Pattern for SingleBuyPattern {
    fn name(&self) -> &'static str {
        "single_buy"
    }

    fn generate(&self, ctx: &OpportunityContext) -> Result<Vec<ActionSequence>, EngineError> {
        let mut sequences = Vec::new();
        for opp in ctx.opportunities.iter().filter(|o| o.score > 0.0) {
            let quantity = lot_quantity(ctx.target_position_value / opp.price, opp.min_lot);
            if quantity <= 0.0 {
                continue;
            }
            sequences.push(ActionSequence::new(
                vec![Action {
                    side: Side::Buy,
                    symbol: opp.symbol.clone(),
                    quantity,
                    price_hint: Some(opp.price),
                }],
                self.name(),
            ));
            if sequences.len() >= MAX_CANDIDATES {
                break;
            }
        }
        Ok(sequences)
    }
}

/// Sell the excess of positions grown past twice their target weight.
pub struct RebalanceOverweightPattern;

impl Pattern for RebalanceOverweightPattern {
    fn name(&self) -> &'static str {
        "rebalance_overweight"
    }

    fn generate(&self, ctx: &OpportunityContext) -> Result<Vec<ActionSequence>, EngineError> {
        let mut sequences = Vec::new();
        for position in &ctx.positions {
            let Some(price) = ctx.price_of(&position.symbol) else {
                continue;
            };
            let min_lot = ctx
                .universe
                .get(&position.symbol)
                .map(|s| s.min_lot)
                .unwrap_or(1.0);

            let value = position.quantity * price;
            if value <= 2.0 * ctx.target_position_value {
                continue;
            }

            let excess_quantity =
                lot_quantity((value - ctx.target_position_value) / price, min_lot);
            if excess_quantity <= 0.0 || excess_quantity > position.quantity {
                continue;
            }

            sequences.push(ActionSequence::new(
                vec![Action {
                    side: Side::Sell,
                    symbol: position.symbol.clone(),
                    quantity: excess_quantity,
                    price_hint: Some(price),
                }],
                self.name(),
            ));
            if sequences.len() >= MAX_CANDIDATES {
                break;
            }
        }
        Ok(sequences)
    }
}

/// Pair the strongest overweight sell with the strongest underweight buy.
pub struct SwapPairPattern;

impl Pattern for SwapPairPattern {
    fn name(&self) -> &'static str {
        "swap_pair"
    }

    fn generate(&self, ctx: &OpportunityContext) -> Result<Vec<ActionSequence>, EngineError> {
        let sells = RebalanceOverweightPattern.generate(ctx)?;
        let Some(sell) = sells.into_iter().next() else {
            return Ok(Vec::new());
        };

        let sell_symbol = sell.actions[0].symbol.clone();
        let buy = ctx
            .opportunities
            .iter()
            .filter(|o| o.score > 0.0 && o.symbol != sell_symbol)
            .find_map(|opp| {
                let quantity = lot_quantity(ctx.target_position_value / opp.price, opp.min_lot);
                (quantity > 0.0).then(|| Action {
                    side: Side::Buy,
                    symbol: opp.symbol.clone(),
                    quantity,
                    price_hint: Some(opp.price),
                })
            });

        let Some(buy) = buy else {
            return Ok(Vec::new());
        };

        let mut actions = sell.actions;
        actions.push(buy);
        Ok(vec![ActionSequence::new(actions, self.name())])
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::opportunity::{build_opportunity_context, OptimizerWeights};
    use crate::types::{CashBalance, Position, Security};
    use std::collections::{BTreeMap, BTreeSet};

    fn security(symbol: &str) -> Security {
        Security {
            isin: format!("US-{symbol}"),
            symbol: symbol.into(),
            name: symbol.into(),
            exchange: "NASDAQ".into(),
            currency: "USD".into(),
            min_lot: 1.0,
            country: "US".into(),
            industry: "Technology".into(),
        }
    }

    fn position(symbol: &str, quantity: f64) -> Position {
        Position {
            symbol: symbol.into(),
            quantity,
            avg_cost: 100.0,
            currency: "USD".into(),
            exchange: "NASDAQ".into(),
            opened_at: 0,
        }
    }

    fn ctx(positions: Vec<Position>, cash: f64) -> OpportunityContext {
        let mut prices = BTreeMap::new();
        prices.insert("AAPL".to_string(), 100.0);
        prices.insert("MSFT".to_string(), 50.0);
        build_opportunity_context(
            "hash".into(),
            positions,
            vec![CashBalance {
                currency: "USD".into(),
                amount: cash,
            }],
            vec![security("AAPL"), security("MSFT")],
            &prices,
            BTreeSet::new(),
            OptimizerWeights::default(),
        )
    }

    #[test]
    fn single_buy_emits_lot_rounded_buys() {
        let sequences = SingleBuyPattern.generate(&ctx(Vec::new(), 1000.0)).unwrap();
        assert_eq!(sequences.len(), 2);
        for seq in &sequences {
            assert_eq!(seq.provenance, "single_buy");
            assert_eq!(seq.actions.len(), 1);
            assert_eq!(seq.actions[0].side, Side::Buy);
            assert_eq!(seq.actions[0].quantity.fract(), 0.0);
        }
    }

    #[test]
    fn rebalance_sells_only_heavily_overweight_positions() {
        // AAPL worth 2000 against a target of ~1050: overweight.
        let sequences = RebalanceOverweightPattern
            .generate(&ctx(vec![position("AAPL", 20.0)], 100.0))
            .unwrap();
        assert_eq!(sequences.len(), 1);
        let action = &sequences[0].actions[0];
        assert_eq!(action.side, Side::Sell);
        assert_eq!(action.symbol, "AAPL");
        assert!(action.quantity > 0.0 && action.quantity < 20.0);

        // A balanced book produces nothing.
        let none = RebalanceOverweightPattern
            .generate(&ctx(vec![position("AAPL", 5.0)], 500.0))
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn swap_pair_combines_a_sell_and_a_buy() {
        let sequences = SwapPairPattern
            .generate(&ctx(vec![position("AAPL", 20.0)], 100.0))
            .unwrap();
        assert_eq!(sequences.len(), 1);
        let actions = &sequences[0].actions;
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].side, Side::Sell);
        assert_eq!(actions[1].side, Side::Buy);
        assert_ne!(actions[0].symbol, actions[1].symbol);
    }

    #[test]
    fn registry_respects_enabled_order_and_skips_unknown() {
        let registry = PatternRegistry::with_builtins();
        let enabled = registry.get_enabled(&["swap_pair", "single_buy", "ghost"]);
        let names: Vec<&str> = enabled.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["swap_pair", "single_buy"]);
    }

    #[test]
    fn generate_sequences_concatenates_pattern_output() {
        let registry = PatternRegistry::with_builtins();
        let context = ctx(vec![position("AAPL", 20.0)], 100.0);
        let sequences =
            registry.generate_sequences(&context, &["single_buy", "rebalance_overweight"]);
        assert!(sequences.iter().any(|s| s.provenance == "single_buy"));
        assert!(sequences.iter().any(|s| s.provenance == "rebalance_overweight"));
    }

    #[test]
    fn lot_rounding() {
        assert_eq!(lot_quantity(10.7, 1.0), 10.0);
        assert_eq!(lot_quantity(10.7, 5.0), 10.0);
        assert_eq!(lot_quantity(4.9, 5.0), 0.0);
        assert!((lot_quantity(0.37, 0.1) - 0.3).abs() < 1e-9);
    }
}
