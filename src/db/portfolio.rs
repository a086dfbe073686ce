// =============================================================================
// Portfolio store — positions and cash balances (portfolio.db)
// =============================================================================

use std::path::Path;

use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::types::{CashBalance, Position};

const MIGRATIONS: &[&str] = &[r#"
CREATE TABLE positions (
    symbol     TEXT PRIMARY KEY,
    quantity   REAL NOT NULL,
    avg_cost   REAL NOT NULL,
    currency   TEXT NOT NULL,
    exchange   TEXT NOT NULL,
    opened_at  INTEGER NOT NULL
);

CREATE TABLE cash_balances (
    currency   TEXT PRIMARY KEY,
    amount     REAL NOT NULL,
    updated_at INTEGER NOT NULL
);
"#];

pub struct PortfolioStore {
    conn: Mutex<Connection>,
}

impl PortfolioStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = super::open_with_migrations(path.as_ref(), MIGRATIONS)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn upsert_position(&self, position: &Position) -> Result<()> {
        self.conn.lock().execute(
            r#"
            INSERT INTO positions (symbol, quantity, avg_cost, currency, exchange, opened_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(symbol) DO UPDATE SET
                quantity = excluded.quantity,
                avg_cost = excluded.avg_cost,
                currency = excluded.currency,
                exchange = excluded.exchange
            "#,
            params![
                position.symbol,
                position.quantity,
                position.avg_cost,
                position.currency,
                position.exchange,
                position.opened_at,
            ],
        )?;
        Ok(())
    }

    pub fn remove_position(&self, symbol: &str) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM positions WHERE symbol = ?1", params![symbol])?;
        Ok(())
    }

    pub fn get_position(&self, symbol: &str) -> Result<Option<Position>> {
        let conn = self.conn.lock();
        let position = conn
            .query_row(
                "SELECT symbol, quantity, avg_cost, currency, exchange, opened_at
                 FROM positions WHERE symbol = ?1",
                params![symbol],
                row_to_position,
            )
            .optional()?;
        Ok(position)
    }

    /// All positions ordered by symbol, so callers iterate deterministically.
    pub fn list_positions(&self) -> Result<Vec<Position>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, quantity, avg_cost, currency, exchange, opened_at
             FROM positions ORDER BY symbol",
        )?;
        let rows = stmt
            .query_map([], row_to_position)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn set_cash(&self, currency: &str, amount: f64, now: i64) -> Result<()> {
        self.conn.lock().execute(
            r#"
            INSERT INTO cash_balances (currency, amount, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(currency) DO UPDATE SET
                amount = excluded.amount,
                updated_at = excluded.updated_at
            "#,
            params![currency, amount, now],
        )?;
        Ok(())
    }

    pub fn get_cash(&self, currency: &str) -> Result<f64> {
        let conn = self.conn.lock();
        let amount = conn
            .query_row(
                "SELECT amount FROM cash_balances WHERE currency = ?1",
                params![currency],
                |row| row.get(0),
            )
            .optional()?;
        Ok(amount.unwrap_or(0.0))
    }

    /// All balances ordered by currency.
    pub fn list_cash(&self) -> Result<Vec<CashBalance>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT currency, amount FROM cash_balances ORDER BY currency")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(CashBalance {
                    currency: row.get(0)?,
                    amount: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn row_to_position(row: &rusqlite::Row<'_>) -> rusqlite::Result<Position> {
    Ok(Position {
        symbol: row.get(0)?,
        quantity: row.get(1)?,
        avg_cost: row.get(2)?,
        currency: row.get(3)?,
        exchange: row.get(4)?,
        opened_at: row.get(5)?,
    })
}
