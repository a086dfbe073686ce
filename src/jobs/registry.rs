// =============================================================================
// Job Registry — maps job kinds to their handlers
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;

use super::progress::ProgressReporter;
use super::{Job, JobKind};
use crate::error::EngineError;

/// Everything a handler gets for one attempt.
pub struct JobContext {
    pub job: Job,
    pub progress: ProgressReporter,
    /// Flips to `true` when the worker pool stops; long-running handlers
    /// must check it between units of work.
    pub shutdown: watch::Receiver<bool>,
}

impl JobContext {
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// A registered job handler. Returns `Ok` on success; the error's
/// classification decides whether the worker pool retries.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: &JobContext) -> Result<(), EngineError>;
}

/// Process-wide kind → handler map. Registration happens once at startup;
/// lookups are read-locked.
pub struct JobRegistry {
    handlers: RwLock<HashMap<JobKind, Arc<dyn JobHandler>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        self.handlers.write().insert(kind, handler);
    }

    pub fn resolve(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().get(&kind).cloned()
    }

    pub fn registered_kinds(&self) -> Vec<JobKind> {
        let mut kinds: Vec<JobKind> = self.handlers.read().keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}
