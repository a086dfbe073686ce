// =============================================================================
// Ledger store — executed trades (ledger.db)
// =============================================================================

use std::path::Path;

use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::types::{Side, Trade};

const MIGRATIONS: &[&str] = &[r#"
CREATE TABLE trades (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol      TEXT NOT NULL,
    side        TEXT NOT NULL,
    quantity    REAL NOT NULL,
    price       REAL NOT NULL,
    currency    TEXT NOT NULL,
    executed_at INTEGER NOT NULL
);

CREATE INDEX idx_trades_symbol_time ON trades(symbol, executed_at DESC);
"#];

pub struct LedgerStore {
    conn: Mutex<Connection>,
}

impl LedgerStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = super::open_with_migrations(path.as_ref(), MIGRATIONS)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn record_trade(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        price: f64,
        currency: &str,
        executed_at: i64,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trades (symbol, side, quantity, price, currency, executed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![symbol, side.as_str(), quantity, price, currency, executed_at],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Number of trades on `symbol` executed at or after `since`. Drives
    /// the per-symbol trade-frequency gate.
    pub fn trade_count_since(&self, symbol: &str, since: i64) -> Result<u32> {
        let count: u32 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM trades WHERE symbol = ?1 AND executed_at >= ?2",
            params![symbol, since],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Most recent sell timestamp for `symbol`, if any. Drives the
    /// post-sell cooldown gate.
    pub fn last_sell_at(&self, symbol: &str) -> Result<Option<i64>> {
        let at = self
            .conn
            .lock()
            .query_row(
                "SELECT MAX(executed_at) FROM trades WHERE symbol = ?1 AND side = 'sell'",
                params![symbol],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();
        Ok(at)
    }

    /// Most recent trade timestamp for `symbol` regardless of side.
    pub fn last_trade_at(&self, symbol: &str) -> Result<Option<i64>> {
        let at = self
            .conn
            .lock()
            .query_row(
                "SELECT MAX(executed_at) FROM trades WHERE symbol = ?1",
                params![symbol],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();
        Ok(at)
    }

    /// Newest trade timestamp across all symbols; the trade-sync job uses
    /// it as its incremental watermark.
    pub fn latest_trade_at(&self) -> Result<Option<i64>> {
        let at = self
            .conn
            .lock()
            .query_row("SELECT MAX(executed_at) FROM trades", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .optional()?
            .flatten();
        Ok(at)
    }

    pub fn list_trades_since(&self, since: i64) -> Result<Vec<Trade>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, symbol, side, quantity, price, currency, executed_at
             FROM trades WHERE executed_at >= ?1 ORDER BY executed_at, id",
        )?;
        let rows = stmt
            .query_map(params![since], |row| {
                let side: String = row.get(2)?;
                Ok(Trade {
                    id: row.get(0)?,
                    symbol: row.get(1)?,
                    side: Side::parse(&side).unwrap_or(Side::Buy),
                    quantity: row.get(3)?,
                    price: row.get(4)?,
                    currency: row.get(5)?,
                    executed_at: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, LedgerStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::open(dir.path().join("ledger.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn trade_count_respects_window() {
        let (_dir, store) = store();
        store.record_trade("AAPL", Side::Buy, 1.0, 190.0, "USD", 1_000).unwrap();
        store.record_trade("AAPL", Side::Buy, 1.0, 191.0, "USD", 2_000).unwrap();
        store.record_trade("MSFT", Side::Buy, 1.0, 400.0, "USD", 2_000).unwrap();

        assert_eq!(store.trade_count_since("AAPL", 1_500).unwrap(), 1);
        assert_eq!(store.trade_count_since("AAPL", 0).unwrap(), 2);
        assert_eq!(store.trade_count_since("NVDA", 0).unwrap(), 0);
    }

    #[test]
    fn last_sell_ignores_buys() {
        let (_dir, store) = store();
        store.record_trade("AAPL", Side::Buy, 1.0, 190.0, "USD", 5_000).unwrap();
        assert_eq!(store.last_sell_at("AAPL").unwrap(), None);

        store.record_trade("AAPL", Side::Sell, 1.0, 195.0, "USD", 6_000).unwrap();
        store.record_trade("AAPL", Side::Sell, 1.0, 196.0, "USD", 7_000).unwrap();
        assert_eq!(store.last_sell_at("AAPL").unwrap(), Some(7_000));
    }
}
