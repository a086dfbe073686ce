// =============================================================================
// Trade Gates — fail-fast safety checks per recommendation
// =============================================================================
//
// Each gate either approves, skips (the recommendation stays pending for a
// later cycle), or dismisses (it can never execute). Every rejection
// carries a human-readable reason.
//
// The staleness gate (fingerprint vs current portfolio) runs once per
// batch in the executor, not here.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::EngineConfig;
use crate::db::Stores;
use crate::error::EngineError;
use crate::market::hours::MarketHoursOracle;
use crate::types::{Recommendation, Side};

#[derive(Debug, PartialEq)]
pub enum GateOutcome {
    Approved,
    /// Retry next cycle.
    Skip(String),
    /// Never executable; the recommendation is dismissed.
    Dismiss(String),
}

pub struct TradeGates {
    config: EngineConfig,
    stores: Arc<Stores>,
    oracle: Arc<MarketHoursOracle>,
}

impl TradeGates {
    pub fn new(config: EngineConfig, stores: Arc<Stores>, oracle: Arc<MarketHoursOracle>) -> Self {
        Self {
            config,
            stores,
            oracle,
        }
    }

    pub async fn check(&self, rec: &Recommendation) -> Result<GateOutcome, EngineError> {
        self.check_at(rec, Utc::now().timestamp()).await
    }

    /// All gates evaluated at a fixed instant (split out for tests).
    pub async fn check_at(&self, rec: &Recommendation, now: i64) -> Result<GateOutcome, EngineError> {
        let Some(security) = self.stores.universe.get_by_symbol(&rec.symbol)? else {
            return Ok(GateOutcome::Dismiss(format!(
                "{} is not in the universe",
                rec.symbol
            )));
        };

        // Per-symbol trade frequency within a rolling day.
        let day_ago = now - 86_400;
        let trades_today = self.stores.ledger.trade_count_since(&rec.symbol, day_ago)?;
        if trades_today >= self.config.max_trades_per_symbol_per_day {
            return Ok(GateOutcome::Skip(format!(
                "{} already traded {trades_today} time(s) in the last day",
                rec.symbol
            )));
        }

        // Market hours, where the side and exchange demand it.
        if self
            .oracle
            .should_check_market_hours(&security.exchange, rec.side)
        {
            let at = DateTime::<Utc>::from_timestamp(now, 0)
                .ok_or_else(|| EngineError::invalid(format!("bad timestamp {now}")))?;
            if !self.oracle.is_market_open_at(&security.exchange, at).await {
                return Ok(GateOutcome::Skip(format!(
                    "{} is closed for {} orders",
                    security.exchange, rec.side
                )));
            }
        }

        // Buy-back cooldown after a sell of the same symbol.
        if rec.side == Side::Buy {
            if let Some(sold_at) = self.stores.ledger.last_sell_at(&rec.symbol)? {
                if now - sold_at < self.config.sell_cooldown_secs {
                    return Ok(GateOutcome::Skip(format!(
                        "{} sold {}s ago, still in cooldown",
                        rec.symbol,
                        now - sold_at
                    )));
                }
            }
        }

        // Minimum hold duration before selling a recently-opened position.
        if rec.side == Side::Sell {
            let Some(position) = self.stores.portfolio.get_position(&rec.symbol)? else {
                return Ok(GateOutcome::Dismiss(format!(
                    "no position in {} to sell",
                    rec.symbol
                )));
            };
            if now - position.opened_at < self.config.min_hold_secs {
                return Ok(GateOutcome::Skip(format!(
                    "{} held only {}s, below the minimum hold",
                    rec.symbol,
                    now - position.opened_at
                )));
            }
        }

        // Minimum trade size, valued in the base currency.
        let Some(price) = self.price_for(rec)? else {
            return Ok(GateOutcome::Dismiss(format!(
                "no price available for {}",
                rec.symbol
            )));
        };
        let local_value = rec.quantity * price;
        let rate = self.rate_to_base(&security.currency, now)?;
        let base_value = local_value * rate;
        if base_value < self.config.min_trade_size {
            return Ok(GateOutcome::Skip(format!(
                "trade value {:.2} {} below minimum {:.2}",
                base_value, self.config.base_currency, self.config.min_trade_size
            )));
        }

        // Sufficient cash for buys, converted into the position's currency.
        if rec.side == Side::Buy {
            let available = self.cash_in_currency(&security.currency, now)?;
            if available < local_value {
                return Ok(GateOutcome::Skip(format!(
                    "insufficient cash: need {:.2} {}, have {:.2}",
                    local_value, security.currency, available
                )));
            }
        }

        Ok(GateOutcome::Approved)
    }

    fn price_for(&self, rec: &Recommendation) -> Result<Option<f64>, EngineError> {
        if let Some(price) = rec.price {
            return Ok(Some(price));
        }
        Ok(self.stores.history.latest_close(&rec.symbol)?)
    }

    /// Units of base currency per unit of `currency`. Precise (dated) rate
    /// first, then the latest known rate as a rough fallback.
    fn rate_to_base(&self, currency: &str, now: i64) -> Result<f64, EngineError> {
        if currency == self.config.base_currency {
            return Ok(1.0);
        }
        let today = now - now.rem_euclid(86_400);
        if let Some(rate) = self
            .stores
            .history
            .fx_rate_on(currency, &self.config.base_currency, today)?
        {
            return Ok(rate);
        }
        Ok(self
            .stores
            .history
            .latest_fx_rate(currency, &self.config.base_currency)?
            .unwrap_or(1.0))
    }

    /// Total cash convertible into `currency`.
    fn cash_in_currency(&self, currency: &str, now: i64) -> Result<f64, EngineError> {
        let today = now - now.rem_euclid(86_400);
        let mut total = 0.0;
        for balance in self.stores.portfolio.list_cash()? {
            if balance.currency == currency {
                total += balance.amount;
                continue;
            }
            let rate = match self
                .stores
                .history
                .fx_rate_on(&balance.currency, currency, today)?
            {
                Some(rate) => rate,
                None => self
                    .stores
                    .history
                    .latest_fx_rate(&balance.currency, currency)?
                    .unwrap_or(0.0),
            };
            total += balance.amount * rate;
        }
        Ok(total)
    }
}
