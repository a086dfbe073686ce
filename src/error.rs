// =============================================================================
// Error taxonomy — what the worker pool is allowed to retry
// =============================================================================

use thiserror::Error;

/// Classified failure returned by job handlers.
///
/// The worker pool is the single point that decides retry vs terminal
/// failure, and it does so purely from this classification:
///
///   - `Transient` — retried with backoff while attempts remain.
///   - `Invalid`   — never retried; the input can never succeed.
///   - `Fatal`     — never retried; local state is unrecoverable and the
///     health-check job decides the global response.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    Fatal(String),
}

impl EngineError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            // SQLITE_BUSY / SQLITE_LOCKED clear on their own; everything
            // else from the database layer is a local problem.
            rusqlite::Error::SqliteFailure(code, _)
                if matches!(
                    code.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                Self::Transient(format!("database busy: {e}"))
            }
            _ => Self::Fatal(format!("database error: {e}")),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transient(format!("http error: {e}"))
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(e: anyhow::Error) -> Self {
        Self::Transient(format!("{e:#}"))
    }
}
