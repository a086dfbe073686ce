// =============================================================================
// Shared types used across the Helmsman portfolio engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(Self::Buy),
            "sell" => Some(Self::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One buy/sell step inside an action sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub side: Side,
    pub symbol: String,
    pub quantity: f64,
    /// Last known price, used to derive limit prices. `None` means the
    /// executor falls back to a market order.
    pub price_hint: Option<f64>,
}

/// An ordered list of actions produced by the planning pipeline, annotated
/// with the pattern that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSequence {
    pub id: String,
    pub actions: Vec<Action>,
    pub provenance: String,
}

impl ActionSequence {
    pub fn new(actions: Vec<Action>, provenance: impl Into<String>) -> Self {
        let provenance = provenance.into();
        // Deterministic id: provenance plus the action tuple, so identical
        // planning inputs yield identical sequence ids.
        let mut key = provenance.clone();
        for a in &actions {
            key.push('|');
            key.push_str(a.side.as_str());
            key.push(':');
            key.push_str(&a.symbol);
            key.push(':');
            key.push_str(&format!("{:.8}", a.quantity));
        }
        Self {
            id: crate::planner::fingerprint::digest_str(&key),
            actions,
            provenance,
        }
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.actions.iter().map(|a| a.symbol.as_str())
    }
}

/// Score attached to a sequence during a planning batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub sequence_id: String,
    pub fitness: f64,
    pub complexity: u32,
    pub evaluated_at: i64,
}

/// The per-fingerprint argmax over evaluations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestResult {
    pub portfolio_hash: String,
    pub sequence: ActionSequence,
    pub fitness: f64,
    pub evaluated_at: i64,
}

/// Lifecycle of a materialized recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationStatus {
    Pending,
    Executed,
    Dismissed,
}

impl RecommendationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executed => "executed",
            Self::Dismissed => "dismissed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "executed" => Some(Self::Executed),
            "dismissed" => Some(Self::Dismissed),
            _ => None,
        }
    }
}

/// Materialized view of one action of the best sequence, consumed by the
/// trade executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: i64,
    pub portfolio_hash: String,
    pub side: Side,
    pub symbol: String,
    pub quantity: f64,
    pub price: Option<f64>,
    pub rationale: String,
    pub status: RecommendationStatus,
    pub created_at: i64,
    pub executed_at: Option<i64>,
}

/// A held position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub avg_cost: f64,
    pub currency: String,
    pub exchange: String,
    /// Unix seconds the position was first opened. Drives the
    /// minimum-hold-duration gate.
    pub opened_at: i64,
}

/// Cash in one currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashBalance {
    pub currency: String,
    pub amount: f64,
}

/// An executed trade as persisted in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    pub currency: String,
    pub executed_at: i64,
}

/// A tradable security in the universe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Security {
    pub isin: String,
    pub symbol: String,
    pub name: String,
    pub exchange: String,
    pub currency: String,
    /// Smallest tradable increment; quantities in sequences must be a
    /// whole multiple of this.
    pub min_lot: f64,
    pub country: String,
    pub industry: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_round_trips() {
        assert_eq!(Side::parse(Side::Buy.as_str()), Some(Side::Buy));
        assert_eq!(Side::parse(Side::Sell.as_str()), Some(Side::Sell));
        assert_eq!(Side::parse("hold"), None);
    }

    #[test]
    fn sequence_id_is_deterministic() {
        let actions = vec![Action {
            side: Side::Buy,
            symbol: "AAPL".into(),
            quantity: 10.0,
            price_hint: Some(190.0),
        }];
        let a = ActionSequence::new(actions.clone(), "single_buy");
        let b = ActionSequence::new(actions, "single_buy");
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn sequence_id_depends_on_provenance() {
        let actions = vec![Action {
            side: Side::Sell,
            symbol: "MSFT".into(),
            quantity: 1.0,
            price_hint: None,
        }];
        let a = ActionSequence::new(actions.clone(), "rebalance_overweight");
        let b = ActionSequence::new(actions, "swap_pair");
        assert_ne!(a.id, b.id);
    }
}
