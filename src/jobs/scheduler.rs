// =============================================================================
// Job Scheduler — interval trigger that enqueues recurring jobs
// =============================================================================
//
// The cron-like edge of the system: each tick compares every schedule
// entry's interval against the job history's last run and enqueues the
// kinds that are due. A kind already sitting in the queue is skipped so a
// slow worker never stacks duplicates.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::queue::JobQueue;
use super::{Job, JobKind};

#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub kind: JobKind,
    pub every: Duration,
}

impl ScheduleEntry {
    pub fn new(kind: JobKind, every: Duration) -> Self {
        Self { kind, every }
    }
}

pub struct JobScheduler {
    queue: Arc<JobQueue>,
    entries: Vec<ScheduleEntry>,
    tick: Duration,
}

impl JobScheduler {
    pub fn new(queue: Arc<JobQueue>, entries: Vec<ScheduleEntry>, tick: Duration) -> Self {
        Self {
            queue,
            entries,
            tick,
        }
    }

    /// Run until `shutdown` flips. Called from a spawned task in main.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick_once(Utc::now().timestamp()),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("scheduler stopped");
                        return;
                    }
                }
            }
        }
    }

    /// Evaluate every entry once. Split out for tests.
    pub fn tick_once(&self, now: i64) {
        for entry in &self.entries {
            match self.is_due(entry, now) {
                Ok(true) => {
                    let job = Job::new(entry.kind, json!({}));
                    if let Err(e) = self.queue.enqueue(&job) {
                        warn!(kind = %entry.kind, error = %e, "failed to enqueue scheduled job");
                    } else {
                        debug!(kind = %entry.kind, "scheduled job enqueued");
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(kind = %entry.kind, error = %e, "schedule check failed"),
            }
        }
    }

    fn is_due(&self, entry: &ScheduleEntry, now: i64) -> anyhow::Result<bool> {
        if self.queue.contains_kind(entry.kind.as_str())? {
            return Ok(false);
        }
        let due = match self.queue.last_run(entry.kind.as_str())? {
            None => true,
            Some(last) => now - last >= entry.every.as_secs() as i64,
        };
        Ok(due)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobOutcome;

    fn fixture(entries: Vec<ScheduleEntry>) -> (tempfile::TempDir, Arc<JobQueue>, JobScheduler) {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(JobQueue::open(dir.path().join("cache.db")).unwrap());
        let scheduler = JobScheduler::new(queue.clone(), entries, Duration::from_secs(1));
        (dir, queue, scheduler)
    }

    #[test]
    fn never_run_kind_is_enqueued_immediately() {
        let (_dir, queue, scheduler) = fixture(vec![ScheduleEntry::new(
            JobKind::SyncPrices,
            Duration::from_secs(3600),
        )]);

        scheduler.tick_once(1_000);
        assert!(queue.contains_kind("sync-prices").unwrap());
    }

    #[test]
    fn queued_kind_is_not_duplicated() {
        let (_dir, queue, scheduler) = fixture(vec![ScheduleEntry::new(
            JobKind::SyncPrices,
            Duration::from_secs(3600),
        )]);

        scheduler.tick_once(1_000);
        scheduler.tick_once(1_001);
        assert_eq!(queue.depth().unwrap(), 1);
    }

    #[test]
    fn interval_gates_on_last_run() {
        let (_dir, queue, scheduler) = fixture(vec![ScheduleEntry::new(
            JobKind::Backup,
            Duration::from_secs(600),
        )]);

        queue
            .record_execution("backup", JobOutcome::Success, 1_000)
            .unwrap();

        scheduler.tick_once(1_500);
        assert_eq!(queue.depth().unwrap(), 0);

        scheduler.tick_once(1_600);
        assert_eq!(queue.depth().unwrap(), 1);
    }
}
