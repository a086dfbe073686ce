// =============================================================================
// SQLite layer — one store per database, versioned migrations, WAL mode
// =============================================================================
//
// Each store owns a single `Connection` behind a `parking_lot::Mutex`.
// Multiple connections may point at the same file (the job queue shares
// cache.db with the cache store); WAL mode plus a busy timeout keeps them
// out of each other's way. All date/time columns are integer Unix seconds.
// =============================================================================

pub mod agents;
pub mod cache;
pub mod history;
pub mod ledger;
pub mod portfolio;
pub mod settings;
pub mod universe;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Every database the engine owns, opened once at startup and shared.
pub struct Stores {
    pub portfolio: Arc<portfolio::PortfolioStore>,
    pub ledger: Arc<ledger::LedgerStore>,
    pub history: Arc<history::HistoryStore>,
    pub universe: Arc<universe::UniverseStore>,
    pub settings: Arc<settings::SettingsStore>,
    pub agents: Arc<agents::AgentsStore>,
    pub cache: Arc<cache::CacheStore>,
}

impl Stores {
    pub fn open_all(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
        Ok(Self {
            portfolio: Arc::new(portfolio::PortfolioStore::open(data_dir.join("portfolio.db"))?),
            ledger: Arc::new(ledger::LedgerStore::open(data_dir.join("ledger.db"))?),
            history: Arc::new(history::HistoryStore::open(data_dir.join("history.db"))?),
            universe: Arc::new(universe::UniverseStore::open(data_dir.join("universe.db"))?),
            settings: Arc::new(settings::SettingsStore::open(data_dir.join("config.db"))?),
            agents: Arc::new(agents::AgentsStore::open(data_dir.join("agents.db"))?),
            cache: Arc::new(cache::CacheStore::open(data_dir.join("cache.db"))?),
        })
    }
}

/// Pragmas applied to every connection before the migrations run.
const CONNECTION_PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;
PRAGMA foreign_keys = ON;
"#;

/// Open `path` and bring its schema up to date.
///
/// `migrations` is an append-only list; `PRAGMA user_version` records how
/// many have been applied, so existing databases only run the new tail.
pub(crate) fn open_with_migrations(path: &Path, migrations: &[&str]) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    conn.execute_batch(CONNECTION_PRAGMAS)
        .context("failed to apply connection pragmas")?;

    apply_migrations(&conn, migrations)
        .with_context(|| format!("failed to migrate database at {}", path.display()))?;

    Ok(conn)
}

fn apply_migrations(conn: &Connection, migrations: &[&str]) -> Result<()> {
    let applied: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    for (index, sql) in migrations.iter().enumerate().skip(applied as usize) {
        conn.execute_batch(sql)
            .with_context(|| format!("migration {} failed", index + 1))?;
        // user_version does not accept bound parameters.
        conn.execute_batch(&format!("PRAGMA user_version = {}", index + 1))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_apply_once_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        let v1 = "CREATE TABLE a (x INTEGER);";
        {
            let conn = open_with_migrations(&path, &[v1]).unwrap();
            let version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0)).unwrap();
            assert_eq!(version, 1);
        }

        // Re-open with an appended migration: only the tail runs.
        let v2 = "CREATE TABLE b (y INTEGER);";
        let conn = open_with_migrations(&path, &[v1, v2]).unwrap();
        let version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0)).unwrap();
        assert_eq!(version, 2);
        conn.execute("INSERT INTO a (x) VALUES (1)", []).unwrap();
        conn.execute("INSERT INTO b (y) VALUES (2)", []).unwrap();
    }
}
