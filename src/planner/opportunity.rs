// =============================================================================
// Opportunity model — what the planning pipeline works from
// =============================================================================
//
// The context assembles portfolio state, universe membership, prices, and
// optimizer weights into one immutable snapshot. Opportunity scores here
// are allocation-shortfall plumbing; the scoring formulas proper live
// outside this crate and arrive through the weights.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::types::{CashBalance, Position, Security};

fn default_value_weight() -> f64 {
    1.0
}

fn default_diversification_weight() -> f64 {
    0.5
}

fn default_cash_drag_weight() -> f64 {
    0.1
}

fn default_complexity_penalty() -> f64 {
    0.05
}

/// Weights loaded from the settings store, keyed `optimizer_weights`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerWeights {
    #[serde(default = "default_value_weight")]
    pub value: f64,
    #[serde(default = "default_diversification_weight")]
    pub diversification: f64,
    #[serde(default = "default_cash_drag_weight")]
    pub cash_drag: f64,
    #[serde(default = "default_complexity_penalty")]
    pub complexity_penalty: f64,
}

impl Default for OptimizerWeights {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty OptimizerWeights deserialises")
    }
}

/// One scored candidate security.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub symbol: String,
    pub score: f64,
    pub price: f64,
    pub currency: String,
    pub exchange: String,
    pub min_lot: f64,
}

/// Immutable snapshot the patterns, generators, and filters consume.
#[derive(Debug, Clone)]
pub struct OpportunityContext {
    pub portfolio_hash: String,
    /// Sorted by score descending, symbol ascending for equal scores.
    pub opportunities: Vec<Opportunity>,
    pub positions: Vec<Position>,
    pub cash: Vec<CashBalance>,
    /// Universe securities keyed by symbol.
    pub universe: BTreeMap<String, Security>,
    /// Symbols traded within the recency window; the recent-trade filter
    /// rejects sequences touching them.
    pub recently_traded: BTreeSet<String>,
    pub weights: OptimizerWeights,
    /// Equal-weight target value per position.
    pub target_position_value: f64,
    /// Total portfolio value including cash.
    pub total_value: f64,
}

impl OpportunityContext {
    pub fn price_of(&self, symbol: &str) -> Option<f64> {
        self.opportunities
            .iter()
            .find(|o| o.symbol == symbol)
            .map(|o| o.price)
    }
}

/// Build the opportunity context from portfolio state and latest prices.
///
/// Scores are an allocation shortfall: positive for underweight names,
/// negative for overweight ones, with a diversification bonus for symbols
/// not yet held. Everything iterates in sorted order so equal inputs give
/// byte-equal output.
pub fn build_opportunity_context(
    portfolio_hash: String,
    positions: Vec<Position>,
    cash: Vec<CashBalance>,
    securities: Vec<Security>,
    prices: &BTreeMap<String, f64>,
    recently_traded: BTreeSet<String>,
    weights: OptimizerWeights,
) -> OpportunityContext {
    let universe: BTreeMap<String, Security> = securities
        .into_iter()
        .map(|s| (s.symbol.clone(), s))
        .collect();

    let positions_value: f64 = positions
        .iter()
        .map(|p| p.quantity * prices.get(&p.symbol).copied().unwrap_or(p.avg_cost))
        .sum();
    let cash_value: f64 = cash.iter().map(|c| c.amount).sum();
    let total_value = positions_value + cash_value;

    let slots = universe.len().max(1);
    let target_position_value = total_value / slots as f64;

    let mut opportunities = Vec::with_capacity(universe.len());
    for security in universe.values() {
        let Some(price) = prices.get(&security.symbol).copied() else {
            continue; // unpriced securities cannot be planned
        };
        if price <= 0.0 {
            continue;
        }

        let held_quantity = positions
            .iter()
            .find(|p| p.symbol == security.symbol)
            .map(|p| p.quantity)
            .unwrap_or(0.0);
        let current_value = held_quantity * price;

        let shortfall = if total_value > 0.0 {
            (target_position_value - current_value) / total_value
        } else {
            0.0
        };
        let novelty = if held_quantity == 0.0 { 1.0 } else { 0.0 };
        let score = weights.value * shortfall + weights.diversification * novelty / slots as f64;

        opportunities.push(Opportunity {
            symbol: security.symbol.clone(),
            score,
            price,
            currency: security.currency.clone(),
            exchange: security.exchange.clone(),
            min_lot: security.min_lot,
        });
    }

    opportunities.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.symbol.cmp(&b.symbol))
    });

    OpportunityContext {
        portfolio_hash,
        opportunities,
        positions,
        cash,
        universe,
        recently_traded,
        weights,
        target_position_value,
        total_value,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

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

    fn context(positions: Vec<Position>, cash_amount: f64) -> OpportunityContext {
        let mut prices = BTreeMap::new();
        prices.insert("AAPL".to_string(), 100.0);
        prices.insert("MSFT".to_string(), 200.0);

        build_opportunity_context(
            "hash".into(),
            positions,
            vec![CashBalance {
                currency: "USD".into(),
                amount: cash_amount,
            }],
            vec![security("AAPL"), security("MSFT"), security("NOPRICE")],
            &prices,
            BTreeSet::new(),
            OptimizerWeights::default(),
        )
    }

    #[test]
    fn unpriced_securities_are_excluded() {
        let ctx = context(Vec::new(), 1000.0);
        assert_eq!(ctx.opportunities.len(), 2);
        assert!(ctx.opportunities.iter().all(|o| o.symbol != "NOPRICE"));
        // They still count as universe members for eligibility checks.
        assert!(ctx.universe.contains_key("NOPRICE"));
    }

    #[test]
    fn unheld_names_outscore_held_ones() {
        let held = Position {
            symbol: "AAPL".into(),
            quantity: 5.0,
            avg_cost: 100.0,
            currency: "USD".into(),
            exchange: "NASDAQ".into(),
            opened_at: 0,
        };
        let ctx = context(vec![held], 1000.0);

        let aapl = ctx.opportunities.iter().find(|o| o.symbol == "AAPL").unwrap();
        let msft = ctx.opportunities.iter().find(|o| o.symbol == "MSFT").unwrap();
        assert!(msft.score > aapl.score);
        // Sorted by score descending.
        assert_eq!(ctx.opportunities[0].symbol, "MSFT");
    }

    #[test]
    fn context_is_deterministic() {
        let a = context(Vec::new(), 1000.0);
        let b = context(Vec::new(), 1000.0);
        assert_eq!(a.opportunities, b.opportunities);
        assert_eq!(a.target_position_value, b.target_position_value);
    }
}
