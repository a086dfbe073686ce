// =============================================================================
// Lock Manager — named exclusive locks backed by advisory file locks
// =============================================================================
//
// The only tool in the core for cross-job mutual exclusion (one concurrent
// cash-flow sync, one backup, ...). Locks are files under a known directory
// holding the owning pid; a crashed process leaves no deadlock because the
// OS drops advisory locks with the process.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::EngineError;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out acquiring lock '{name}'")]
    Timeout { name: String },
    #[error("lock io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LockError> for EngineError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Timeout { .. } => EngineError::Transient(e.to_string()),
            LockError::Io(_) => EngineError::Fatal(e.to_string()),
        }
    }
}

/// A held named lock. Released explicitly via `release()` or implicitly on
/// drop, so every exit path (success, error, panic unwind) releases.
#[derive(Debug)]
pub struct HeldLock {
    name: String,
    file: Option<File>,
}

impl HeldLock {
    /// Unlock and close the lock file. Idempotent.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = fs2::FileExt::unlock(&file) {
                warn!(name = %self.name, error = %e, "failed to unlock lock file");
            }
            debug!(name = %self.name, "lock released");
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Creates and arbitrates named locks under a single lock directory.
pub struct LockManager {
    lock_dir: PathBuf,
    retry_tick: Duration,
}

impl LockManager {
    pub fn new(lock_dir: impl Into<PathBuf>, retry_tick: Duration) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            retry_tick,
        }
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.lock_dir.join(format!("{name}.lock"))
    }

    /// Acquire the named lock, retrying on a fixed tick until `timeout`.
    ///
    /// Returns `LockError::Timeout` when another holder keeps the lock past
    /// the deadline.
    pub async fn acquire(&self, name: &str, timeout: Duration) -> Result<HeldLock, LockError> {
        std::fs::create_dir_all(&self.lock_dir)?;

        let path = self.lock_path(name);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    // Record the owner and refresh mtime so the stale-lock
                    // sweep sees an active hold.
                    file.set_len(0)?;
                    writeln!(file, "{}", std::process::id())?;
                    debug!(name, "lock acquired");
                    return Ok(HeldLock {
                        name: name.to_string(),
                        file: Some(file),
                    });
                }
                Err(_) if Instant::now() >= deadline => {
                    return Err(LockError::Timeout {
                        name: name.to_string(),
                    });
                }
                Err(_) => tokio::time::sleep(self.retry_tick).await,
            }
        }
    }

    /// Remove lock files not modified within `max_age` and return the names
    /// freed. Used by the maintenance job; an active hold refreshes its
    /// mtime at acquire time, so only abandoned files age out.
    pub fn clear_stuck_locks(&self, max_age: Duration) -> std::io::Result<Vec<String>> {
        let mut freed = Vec::new();
        let entries = match std::fs::read_dir(&self.lock_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(freed),
            Err(e) => return Err(e),
        };

        let now = std::time::SystemTime::now();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("lock") {
                continue;
            }

            let modified = entry.metadata()?.modified()?;
            let age = now.duration_since(modified).unwrap_or_default();
            if age > max_age {
                let name = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default()
                    .to_string();
                std::fs::remove_file(&path)?;
                warn!(name = %name, age_secs = age.as_secs(), "removed stuck lock file");
                freed.push(name);
            }
        }

        Ok(freed)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn manager(dir: &tempfile::TempDir) -> LockManager {
        LockManager::new(dir.path(), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn acquire_release_reacquire() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);

        let mut lock = mgr.acquire("cash_flow_sync", Duration::from_secs(1)).await.unwrap();
        assert_eq!(lock.name(), "cash_flow_sync");
        lock.release();

        // No competing acquirer: immediate re-acquisition succeeds.
        let _again = mgr.acquire("cash_flow_sync", Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);

        let mut lock = mgr.acquire("backup", Duration::from_secs(1)).await.unwrap();
        lock.release();
        lock.release();
        lock.release();

        let _again = mgr.acquire("backup", Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn second_acquirer_times_out_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);

        let _held = mgr.acquire("sync", Duration::from_secs(1)).await.unwrap();
        let err = mgr.acquire("sync", Duration::from_millis(60)).await.unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
    }

    #[tokio::test]
    async fn waiter_acquires_after_holder_releases() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = Arc::new(manager(&dir));

        let holder = mgr.clone();
        let handle = tokio::spawn(async move {
            let lock = holder.acquire("contended", Duration::from_secs(1)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(120)).await;
            drop(lock);
        });

        // Give the holder a head start, then wait with a generous timeout.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let _lock = mgr.acquire("contended", Duration::from_secs(5)).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn exactly_one_of_two_short_timeout_acquirers_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = Arc::new(manager(&dir));

        let a = mgr.clone();
        let b = mgr.clone();
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move {
                match a.acquire("race", Duration::from_millis(80)).await {
                    Ok(lock) => {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        drop(lock);
                        true
                    }
                    Err(_) => false,
                }
            }),
            tokio::spawn(async move {
                match b.acquire("race", Duration::from_millis(80)).await {
                    Ok(lock) => {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        drop(lock);
                        true
                    }
                    Err(_) => false,
                }
            }),
        );

        let wins = [ra.unwrap(), rb.unwrap()].iter().filter(|w| **w).count();
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn clear_stuck_locks_frees_only_old_files() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);

        // A released lock leaves its file behind.
        let mut lock = mgr.acquire("orphan", Duration::from_secs(1)).await.unwrap();
        lock.release();

        // Fresh file: nothing to clean.
        let freed = mgr.clear_stuck_locks(Duration::from_secs(3600)).unwrap();
        assert!(freed.is_empty());

        // Aged file: cleaned and reported.
        let freed = mgr.clear_stuck_locks(Duration::ZERO).unwrap();
        assert_eq!(freed, vec!["orphan".to_string()]);
        assert!(!dir.path().join("orphan.lock").exists());
    }
}
