// =============================================================================
// Universe store — tradable securities keyed by ISIN (universe.db)
// =============================================================================

use std::path::Path;

use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::types::Security;

const MIGRATIONS: &[&str] = &[r#"
CREATE TABLE securities (
    isin     TEXT PRIMARY KEY,
    symbol   TEXT NOT NULL UNIQUE,
    name     TEXT NOT NULL,
    exchange TEXT NOT NULL,
    currency TEXT NOT NULL,
    min_lot  REAL NOT NULL DEFAULT 1.0,
    country  TEXT NOT NULL DEFAULT '',
    industry TEXT NOT NULL DEFAULT ''
);
"#];

pub struct UniverseStore {
    conn: Mutex<Connection>,
}

impl UniverseStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = super::open_with_migrations(path.as_ref(), MIGRATIONS)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn upsert_security(&self, security: &Security) -> Result<()> {
        self.conn.lock().execute(
            r#"
            INSERT INTO securities (isin, symbol, name, exchange, currency, min_lot, country, industry)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(isin) DO UPDATE SET
                symbol = excluded.symbol,
                name = excluded.name,
                exchange = excluded.exchange,
                currency = excluded.currency,
                min_lot = excluded.min_lot,
                country = excluded.country,
                industry = excluded.industry
            "#,
            params![
                security.isin,
                security.symbol,
                security.name,
                security.exchange,
                security.currency,
                security.min_lot,
                security.country,
                security.industry,
            ],
        )?;
        Ok(())
    }

    pub fn get_by_symbol(&self, symbol: &str) -> Result<Option<Security>> {
        let security = self
            .conn
            .lock()
            .query_row(
                "SELECT isin, symbol, name, exchange, currency, min_lot, country, industry
                 FROM securities WHERE symbol = ?1",
                params![symbol],
                row_to_security,
            )
            .optional()?;
        Ok(security)
    }

    /// All securities ordered by ISIN, so the fingerprint and the planner
    /// iterate deterministically.
    pub fn list_securities(&self) -> Result<Vec<Security>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT isin, symbol, name, exchange, currency, min_lot, country, industry
             FROM securities ORDER BY isin",
        )?;
        let rows = stmt
            .query_map([], row_to_security)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn contains_symbol(&self, symbol: &str) -> Result<bool> {
        let count: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM securities WHERE symbol = ?1",
            params![symbol],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

fn row_to_security(row: &rusqlite::Row<'_>) -> rusqlite::Result<Security> {
    Ok(Security {
        isin: row.get(0)?,
        symbol: row.get(1)?,
        name: row.get(2)?,
        exchange: row.get(3)?,
        currency: row.get(4)?,
        min_lot: row.get(5)?,
        country: row.get(6)?,
        industry: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(isin: &str, symbol: &str) -> Security {
        Security {
            isin: isin.into(),
            symbol: symbol.into(),
            name: format!("{symbol} Inc"),
            exchange: "NASDAQ".into(),
            currency: "USD".into(),
            min_lot: 1.0,
            country: "US".into(),
            industry: "Technology".into(),
        }
    }

    #[test]
    fn lookup_by_symbol_and_membership() {
        let dir = tempfile::tempdir().unwrap();
        let store = UniverseStore::open(dir.path().join("universe.db")).unwrap();

        store.upsert_security(&sample("US0378331005", "AAPL")).unwrap();

        assert!(store.contains_symbol("AAPL").unwrap());
        assert!(!store.contains_symbol("TSLA").unwrap());
        let security = store.get_by_symbol("AAPL").unwrap().unwrap();
        assert_eq!(security.isin, "US0378331005");
    }

    #[test]
    fn listing_is_isin_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let store = UniverseStore::open(dir.path().join("universe.db")).unwrap();

        store.upsert_security(&sample("US5949181045", "MSFT")).unwrap();
        store.upsert_security(&sample("US0378331005", "AAPL")).unwrap();

        let isins: Vec<String> = store
            .list_securities()
            .unwrap()
            .into_iter()
            .map(|s| s.isin)
            .collect();
        assert_eq!(isins, vec!["US0378331005", "US5949181045"]);
    }
}
