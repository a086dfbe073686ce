// =============================================================================
// Brokerage collaborator — trait boundary plus a paper implementation
// =============================================================================
//
// The real brokerage client lives outside this crate; the engine only sees
// this trait. Errors are opaque and retryable unless categorized as
// invalid, which is never retried.
//
// `PaperBroker` simulates fills in-process. It backs demo mode and the
// tests, with optional failure injection for retry scenarios.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::info;

use crate::error::EngineError;
use crate::types::{CashBalance, Position, Side, Trade};

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Network trouble, brokerage 5xx. Safe to retry.
    #[error("broker error: {0}")]
    Retryable(String),
    /// The order can never succeed (not tradable, bad quantity). Never
    /// retried.
    #[error("invalid order: {0}")]
    Invalid(String),
}

impl From<BrokerError> for EngineError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::Retryable(msg) => EngineError::Transient(msg),
            BrokerError::Invalid(msg) => EngineError::Invalid(msg),
        }
    }
}

#[async_trait]
pub trait Brokerage: Send + Sync {
    /// Place an order. `price = None` means a market order. Returns the
    /// broker's order id.
    async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        price: Option<f64>,
    ) -> Result<String, BrokerError>;

    async fn fetch_positions(&self) -> Result<Vec<Position>, BrokerError>;

    async fn fetch_cash_balances(&self) -> Result<Vec<CashBalance>, BrokerError>;

    async fn fetch_trades(&self, since: i64) -> Result<Vec<Trade>, BrokerError>;

    /// Cross rate for a specific date.
    async fn fetch_fx_rate(&self, base: &str, quote: &str, date: i64)
        -> Result<f64, BrokerError>;
}

// =============================================================================
// PaperBroker
// =============================================================================

#[derive(Default)]
struct PaperState {
    positions: Vec<Position>,
    cash: Vec<CashBalance>,
    trades: Vec<Trade>,
}

/// In-process brokerage that fills every valid order instantly.
pub struct PaperBroker {
    state: Mutex<PaperState>,
    next_order_id: AtomicU64,
    /// Remaining calls that fail with a retryable error before succeeding.
    fail_remaining: AtomicU32,
    untradable: Mutex<HashSet<String>>,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PaperState::default()),
            next_order_id: AtomicU64::new(1),
            fail_remaining: AtomicU32::new(0),
            untradable: Mutex::new(HashSet::new()),
        }
    }

    /// Make the next `n` `place_order` calls fail retryably.
    pub fn fail_next_orders(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Mark a symbol as permanently untradable (invalid, never retried).
    pub fn mark_untradable(&self, symbol: &str) {
        self.untradable.lock().insert(symbol.to_string());
    }

    pub fn seed_cash(&self, currency: &str, amount: f64) {
        self.state.lock().cash.push(CashBalance {
            currency: currency.to_string(),
            amount,
        });
    }

    pub fn seed_position(&self, position: Position) {
        self.state.lock().positions.push(position);
    }

    fn take_failure(&self) -> bool {
        self.fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Brokerage for PaperBroker {
    async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        price: Option<f64>,
    ) -> Result<String, BrokerError> {
        if quantity <= 0.0 {
            return Err(BrokerError::Invalid(format!(
                "non-positive quantity {quantity} for {symbol}"
            )));
        }
        if self.untradable.lock().contains(symbol) {
            return Err(BrokerError::Invalid(format!("{symbol} is not tradable")));
        }
        if self.take_failure() {
            return Err(BrokerError::Retryable("simulated broker outage".into()));
        }

        let order_id = format!("paper-{}", self.next_order_id.fetch_add(1, Ordering::SeqCst));
        info!(order_id = %order_id, symbol, side = %side, quantity, price = ?price, "paper fill");
        Ok(order_id)
    }

    async fn fetch_positions(&self) -> Result<Vec<Position>, BrokerError> {
        Ok(self.state.lock().positions.clone())
    }

    async fn fetch_cash_balances(&self) -> Result<Vec<CashBalance>, BrokerError> {
        Ok(self.state.lock().cash.clone())
    }

    async fn fetch_trades(&self, since: i64) -> Result<Vec<Trade>, BrokerError> {
        Ok(self
            .state
            .lock()
            .trades
            .iter()
            .filter(|t| t.executed_at >= since)
            .cloned()
            .collect())
    }

    async fn fetch_fx_rate(&self, base: &str, quote: &str, _date: i64) -> Result<f64, BrokerError> {
        if base == quote {
            return Ok(1.0);
        }
        // Flat demo rates, enough to exercise the conversion path.
        Ok(match (base, quote) {
            ("EUR", "USD") => 1.08,
            ("USD", "EUR") => 1.0 / 1.08,
            _ => 1.0,
        })
    }
}
