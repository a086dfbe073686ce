// =============================================================================
// Agents store — sequences, evaluations, best result per hash (agents.db)
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::types::{ActionSequence, BestResult, Evaluation};

const MIGRATIONS: &[&str] = &[r#"
CREATE TABLE sequences (
    id         TEXT PRIMARY KEY,
    provenance TEXT NOT NULL,
    actions    TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE evaluations (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    sequence_id    TEXT NOT NULL,
    portfolio_hash TEXT NOT NULL,
    fitness        REAL NOT NULL,
    complexity     INTEGER NOT NULL,
    evaluated_at   INTEGER NOT NULL
);

CREATE INDEX idx_evaluations_hash ON evaluations(portfolio_hash, fitness DESC);

CREATE TABLE best_result (
    portfolio_hash TEXT PRIMARY KEY,
    sequence       TEXT NOT NULL,
    fitness        REAL NOT NULL,
    evaluated_at   INTEGER NOT NULL
);
"#];

pub struct AgentsStore {
    conn: Mutex<Connection>,
}

impl AgentsStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = super::open_with_migrations(path.as_ref(), MIGRATIONS)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn insert_sequence(&self, sequence: &ActionSequence, now: i64) -> Result<()> {
        let actions =
            serde_json::to_string(&sequence.actions).context("failed to serialise actions")?;
        self.conn.lock().execute(
            r#"
            INSERT INTO sequences (id, provenance, actions, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO NOTHING
            "#,
            params![sequence.id, sequence.provenance, actions, now],
        )?;
        Ok(())
    }

    pub fn insert_evaluation(&self, portfolio_hash: &str, evaluation: &Evaluation) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO evaluations (sequence_id, portfolio_hash, fitness, complexity, evaluated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                evaluation.sequence_id,
                portfolio_hash,
                evaluation.fitness,
                evaluation.complexity,
                evaluation.evaluated_at,
            ],
        )?;
        Ok(())
    }

    pub fn evaluations_for_hash(&self, portfolio_hash: &str) -> Result<Vec<Evaluation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT sequence_id, fitness, complexity, evaluated_at
             FROM evaluations WHERE portfolio_hash = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![portfolio_hash], |row| {
                Ok(Evaluation {
                    sequence_id: row.get(0)?,
                    fitness: row.get(1)?,
                    complexity: row.get(2)?,
                    evaluated_at: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn best_result(&self, portfolio_hash: &str) -> Result<Option<BestResult>> {
        let row = self
            .conn
            .lock()
            .query_row(
                "SELECT sequence, fitness, evaluated_at FROM best_result WHERE portfolio_hash = ?1",
                params![portfolio_hash],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((sequence_json, fitness, evaluated_at)) => {
                let sequence: ActionSequence = serde_json::from_str(&sequence_json)
                    .context("failed to parse stored best sequence")?;
                Ok(Some(BestResult {
                    portfolio_hash: portfolio_hash.to_string(),
                    sequence,
                    fitness,
                    evaluated_at,
                }))
            }
            None => Ok(None),
        }
    }

    /// Install `sequence` as the best result for the hash iff it strictly
    /// beats the stored fitness. The read-modify-write runs inside one
    /// IMMEDIATE transaction so two concurrent batches cannot clobber each
    /// other. Returns whether the row changed.
    pub fn try_update_best(
        &self,
        portfolio_hash: &str,
        sequence: &ActionSequence,
        fitness: f64,
        now: i64,
    ) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<f64> = tx
            .query_row(
                "SELECT fitness FROM best_result WHERE portfolio_hash = ?1",
                params![portfolio_hash],
                |row| row.get(0),
            )
            .optional()?;

        let improved = current.map_or(true, |c| fitness > c);
        if improved {
            let sequence_json =
                serde_json::to_string(sequence).context("failed to serialise best sequence")?;
            tx.execute(
                r#"
                INSERT INTO best_result (portfolio_hash, sequence, fitness, evaluated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(portfolio_hash) DO UPDATE SET
                    sequence = excluded.sequence,
                    fitness = excluded.fitness,
                    evaluated_at = excluded.evaluated_at
                "#,
                params![portfolio_hash, sequence_json, fitness, now],
            )?;
        }

        tx.commit()?;
        Ok(improved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Action, Side};

    fn store() -> (tempfile::TempDir, AgentsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentsStore::open(dir.path().join("agents.db")).unwrap();
        (dir, store)
    }

    fn sequence(symbol: &str) -> ActionSequence {
        ActionSequence::new(
            vec![Action {
                side: Side::Buy,
                symbol: symbol.into(),
                quantity: 1.0,
                price_hint: Some(100.0),
            }],
            "single_buy",
        )
    }

    #[test]
    fn best_result_keeps_the_argmax() {
        let (_dir, store) = store();
        let low = sequence("AAPL");
        let high = sequence("MSFT");

        assert!(store.try_update_best("h1", &low, 0.3, 100).unwrap());
        assert!(store.try_update_best("h1", &high, 0.9, 101).unwrap());
        // A later, weaker candidate must not displace the winner.
        assert!(!store.try_update_best("h1", &low, 0.5, 102).unwrap());

        let best = store.best_result("h1").unwrap().unwrap();
        assert_eq!(best.sequence.id, high.id);
        assert_eq!(best.fitness, 0.9);
    }

    #[test]
    fn equal_fitness_does_not_replace() {
        let (_dir, store) = store();
        let first = sequence("AAPL");
        let second = sequence("MSFT");

        assert!(store.try_update_best("h1", &first, 0.5, 100).unwrap());
        assert!(!store.try_update_best("h1", &second, 0.5, 101).unwrap());

        let best = store.best_result("h1").unwrap().unwrap();
        assert_eq!(best.sequence.id, first.id);
    }

    #[test]
    fn evaluations_are_scoped_by_hash() {
        let (_dir, store) = store();
        let seq = sequence("AAPL");
        store.insert_sequence(&seq, 100).unwrap();

        let eval = Evaluation {
            sequence_id: seq.id.clone(),
            fitness: 0.4,
            complexity: 1,
            evaluated_at: 100,
        };
        store.insert_evaluation("h1", &eval).unwrap();

        assert_eq!(store.evaluations_for_hash("h1").unwrap().len(), 1);
        assert!(store.evaluations_for_hash("h2").unwrap().is_empty());
    }
}
