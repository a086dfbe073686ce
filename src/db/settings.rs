// =============================================================================
// Settings store — key/value settings and planner settings (config.db)
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::config::PlannerSettings;

const MIGRATIONS: &[&str] = &[r#"
CREATE TABLE settings (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE planner_settings (
    id         INTEGER PRIMARY KEY CHECK (id = 1),
    value      TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
"#];

pub struct SettingsStore {
    conn: Mutex<Connection>,
}

impl SettingsStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = super::open_with_migrations(path.as_ref(), MIGRATIONS)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .lock()
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set(&self, key: &str, value: &str, now: i64) -> Result<()> {
        self.conn.lock().execute(
            r#"
            INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
            params![key, value, now],
        )?;
        Ok(())
    }

    /// The single planner-settings row; defaults when the row is missing.
    pub fn load_planner_settings(&self) -> Result<PlannerSettings> {
        let json: Option<String> = self
            .conn
            .lock()
            .query_row("SELECT value FROM planner_settings WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        match json {
            Some(json) => {
                serde_json::from_str(&json).context("failed to parse stored planner settings")
            }
            None => Ok(PlannerSettings::default()),
        }
    }

    pub fn save_planner_settings(&self, settings: &PlannerSettings, now: i64) -> Result<()> {
        let json =
            serde_json::to_string(settings).context("failed to serialise planner settings")?;
        self.conn.lock().execute(
            r#"
            INSERT INTO planner_settings (id, value, updated_at) VALUES (1, ?1, ?2)
            ON CONFLICT(id) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
            params![json, now],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::open(dir.path().join("config.db")).unwrap();

        assert_eq!(store.get("base_currency").unwrap(), None);
        store.set("base_currency", "EUR", 1_700_000_000).unwrap();
        store.set("base_currency", "USD", 1_700_000_100).unwrap();
        assert_eq!(store.get("base_currency").unwrap(), Some("USD".into()));
    }

    #[test]
    fn planner_settings_default_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::open(dir.path().join("config.db")).unwrap();

        let loaded = store.load_planner_settings().unwrap();
        assert_eq!(loaded, PlannerSettings::default());
    }

    #[test]
    fn planner_settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::open(dir.path().join("config.db")).unwrap();

        let mut settings = PlannerSettings::default();
        settings.enable_swap_pair = false;
        settings.max_sequences = 64;
        store.save_planner_settings(&settings, 1_700_000_000).unwrap();

        let loaded = store.load_planner_settings().unwrap();
        assert_eq!(loaded, settings);
    }
}
