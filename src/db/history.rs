// =============================================================================
// History store — daily prices and FX rates (history.db)
// =============================================================================

use std::path::Path;

use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

const MIGRATIONS: &[&str] = &[r#"
CREATE TABLE daily_prices (
    symbol TEXT NOT NULL,
    date   INTEGER NOT NULL,
    open   REAL NOT NULL,
    high   REAL NOT NULL,
    low    REAL NOT NULL,
    close  REAL NOT NULL,
    volume REAL NOT NULL,
    PRIMARY KEY (symbol, date)
);

CREATE TABLE fx_rates (
    base  TEXT NOT NULL,
    quote TEXT NOT NULL,
    date  INTEGER NOT NULL,
    rate  REAL NOT NULL,
    PRIMARY KEY (base, quote, date)
);
"#];

pub struct HistoryStore {
    conn: Mutex<Connection>,
}

impl HistoryStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = super::open_with_migrations(path.as_ref(), MIGRATIONS)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn upsert_price(
        &self,
        symbol: &str,
        date: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<()> {
        self.conn.lock().execute(
            r#"
            INSERT INTO daily_prices (symbol, date, open, high, low, close, volume)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(symbol, date) DO UPDATE SET
                open = excluded.open,
                high = excluded.high,
                low = excluded.low,
                close = excluded.close,
                volume = excluded.volume
            "#,
            params![symbol, date, open, high, low, close, volume],
        )?;
        Ok(())
    }

    /// Latest known close for `symbol`, used as the price hint when
    /// building sequences.
    pub fn latest_close(&self, symbol: &str) -> Result<Option<f64>> {
        let close = self
            .conn
            .lock()
            .query_row(
                "SELECT close FROM daily_prices WHERE symbol = ?1 ORDER BY date DESC LIMIT 1",
                params![symbol],
                |row| row.get(0),
            )
            .optional()?;
        Ok(close)
    }

    pub fn upsert_fx_rate(&self, base: &str, quote: &str, date: i64, rate: f64) -> Result<()> {
        self.conn.lock().execute(
            r#"
            INSERT INTO fx_rates (base, quote, date, rate)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(base, quote, date) DO UPDATE SET rate = excluded.rate
            "#,
            params![base, quote, date, rate],
        )?;
        Ok(())
    }

    /// Rate for the exact date. The precise lookup the cash gate tries
    /// first.
    pub fn fx_rate_on(&self, base: &str, quote: &str, date: i64) -> Result<Option<f64>> {
        if base == quote {
            return Ok(Some(1.0));
        }
        let rate = self
            .conn
            .lock()
            .query_row(
                "SELECT rate FROM fx_rates WHERE base = ?1 AND quote = ?2 AND date = ?3",
                params![base, quote, date],
                |row| row.get(0),
            )
            .optional()?;
        Ok(rate)
    }

    /// Most recent rate regardless of date. The rough fallback.
    pub fn latest_fx_rate(&self, base: &str, quote: &str) -> Result<Option<f64>> {
        if base == quote {
            return Ok(Some(1.0));
        }
        let rate = self
            .conn
            .lock()
            .query_row(
                "SELECT rate FROM fx_rates WHERE base = ?1 AND quote = ?2
                 ORDER BY date DESC LIMIT 1",
                params![base, quote],
                |row| row.get(0),
            )
            .optional()?;
        Ok(rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, HistoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path().join("history.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn latest_close_picks_newest_date() {
        let (_dir, store) = store();
        store.upsert_price("AAPL", 100, 1.0, 2.0, 0.5, 1.5, 10.0).unwrap();
        store.upsert_price("AAPL", 200, 1.0, 2.0, 0.5, 1.8, 10.0).unwrap();
        assert_eq!(store.latest_close("AAPL").unwrap(), Some(1.8));
        assert_eq!(store.latest_close("MSFT").unwrap(), None);
    }

    #[test]
    fn identity_rate_needs_no_rows() {
        let (_dir, store) = store();
        assert_eq!(store.fx_rate_on("EUR", "EUR", 100).unwrap(), Some(1.0));
        assert_eq!(store.latest_fx_rate("USD", "USD").unwrap(), Some(1.0));
    }

    #[test]
    fn precise_misses_fall_back_to_latest() {
        let (_dir, store) = store();
        store.upsert_fx_rate("EUR", "USD", 100, 1.05).unwrap();
        store.upsert_fx_rate("EUR", "USD", 200, 1.10).unwrap();

        assert_eq!(store.fx_rate_on("EUR", "USD", 150).unwrap(), None);
        assert_eq!(store.latest_fx_rate("EUR", "USD").unwrap(), Some(1.10));
    }
}
