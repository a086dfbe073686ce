// =============================================================================
// Portfolio fingerprint — canonical digest over all planning inputs
// =============================================================================
//
// Two equal fingerprints must reproduce the same best result, so every
// input is serialised in a fixed order with fixed precision before
// hashing. Timestamps are deliberately excluded: the hash changes when the
// portfolio changes, not when the clock ticks.
// =============================================================================

use sha2::{Digest, Sha256};

use crate::config::PlannerSettings;
use crate::planner::opportunity::OptimizerWeights;
use crate::types::{CashBalance, Position, Security};

/// SHA-256 hex of an arbitrary string. Also used for deterministic
/// sequence ids.
pub fn digest_str(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn portfolio_fingerprint(
    positions: &[Position],
    cash: &[CashBalance],
    universe: &[Security],
    weights: &OptimizerWeights,
    planner: &PlannerSettings,
) -> String {
    let mut canonical = String::new();

    // Stores return sorted rows; sort again locally so the digest never
    // depends on a caller's ordering.
    let mut positions: Vec<&Position> = positions.iter().collect();
    positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    canonical.push_str("positions\n");
    for p in positions {
        canonical.push_str(&format!(
            "{}|{:.8}|{:.8}|{}|{}\n",
            p.symbol, p.quantity, p.avg_cost, p.currency, p.exchange
        ));
    }

    let mut cash: Vec<&CashBalance> = cash.iter().collect();
    cash.sort_by(|a, b| a.currency.cmp(&b.currency));
    canonical.push_str("cash\n");
    for c in cash {
        canonical.push_str(&format!("{}|{:.8}\n", c.currency, c.amount));
    }

    let mut isins: Vec<&str> = universe.iter().map(|s| s.isin.as_str()).collect();
    isins.sort_unstable();
    canonical.push_str("universe\n");
    for isin in isins {
        canonical.push_str(isin);
        canonical.push('\n');
    }

    canonical.push_str(&format!(
        "weights|{:.8}|{:.8}|{:.8}|{:.8}\n",
        weights.value, weights.diversification, weights.cash_drag, weights.complexity_penalty
    ));

    // Struct field order is fixed, so the JSON is canonical.
    canonical.push_str("planner|");
    canonical.push_str(&serde_json::to_string(planner).unwrap_or_default());

    digest_str(&canonical)
}
