// =============================================================================
// Worker Pool — dequeues jobs, dispatches handlers, owns the retry policy
// =============================================================================
//
// N workers poll the queue; each attempt runs inside its own task so a
// panicking handler is contained by the JoinHandle and the worker lives on.
// The pool is the single point deciding retry vs terminal failure:
//
//   - retryable error with attempts left: re-enqueue with linear backoff,
//     NO JobFailed event (the next attempt emits a fresh JobStarted)
//   - anything else: JobFailed with the error and the attempt duration
//
// A Fatal error flips the pool into a degraded state; the health-check job
// reads it and decides the global response. The process never exits here.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::progress::ProgressReporter;
use super::queue::JobQueue;
use super::registry::{JobContext, JobRegistry};
use super::{Job, JobKind, JobOutcome};
use crate::error::EngineError;
use crate::events::{EventBus, EventKind};

pub struct WorkerPool {
    queue: Arc<JobQueue>,
    registry: Arc<JobRegistry>,
    bus: EventBus,
    workers: usize,
    poll_interval: Duration,
    progress_throttle: Duration,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    degraded: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<JobQueue>,
        registry: Arc<JobRegistry>,
        bus: EventBus,
        workers: usize,
        poll_interval: Duration,
        progress_throttle: Duration,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            queue,
            registry,
            bus,
            workers,
            poll_interval,
            progress_throttle,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            degraded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the workers. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut handles = self.handles.lock();
        for worker_id in 0..self.workers {
            let pool = self.clone();
            handles.push(tokio::spawn(async move {
                pool.worker_loop(worker_id).await;
            }));
        }
        info!(workers = self.workers, "worker pool started");
    }

    /// Signal shutdown and wait for every worker to exit. Workers observe
    /// the signal between dequeues; a running attempt finishes first.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
        info!("worker pool stopped");
    }

    /// Set once a handler reports a Fatal error; read by the health check.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Shared handle for the health-check job, which must not hold the
    /// pool itself (the pool owns the registry the handler lives in).
    pub fn degraded_handle(&self) -> Arc<AtomicBool> {
        self.degraded.clone()
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        let mut shutdown = self.shutdown_tx.subscribe();
        debug!(worker_id, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let job = match self.queue.dequeue(Utc::now().timestamp()) {
                Ok(job) => job,
                Err(e) => {
                    warn!(worker_id, error = %e, "dequeue failed");
                    None
                }
            };

            match job {
                Some(job) => self.process(job).await,
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        debug!(worker_id, "worker stopped");
    }

    async fn process(&self, job: Job) {
        let Some(kind) = JobKind::parse(&job.kind) else {
            self.fail_undispatchable(&job, "no handler registered");
            return;
        };
        let Some(handler) = self.registry.resolve(kind) else {
            self.fail_undispatchable(&job, "no handler registered");
            return;
        };

        self.bus.emit(
            EventKind::JobStarted,
            "worker",
            json!({
                "job_id": job.id,
                "job_type": job.kind,
                "description": kind.description(),
                "attempt": job.retries + 1,
            }),
        );

        let started = Instant::now();
        let ctx = JobContext {
            job: job.clone(),
            progress: ProgressReporter::new(
                self.bus.clone(),
                job.id.clone(),
                kind,
                self.progress_throttle,
            ),
            shutdown: self.shutdown_tx.subscribe(),
        };

        // The attempt runs in its own task so a panic is contained by the
        // JoinHandle instead of tearing down this worker.
        let attempt = tokio::spawn(async move { handler.run(&ctx).await });
        let outcome = attempt.await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(())) => {
                self.record(&job.kind, JobOutcome::Success);
                self.finish_quietly(&job.id);
                self.bus.emit(
                    EventKind::JobCompleted,
                    "worker",
                    json!({
                        "job_id": job.id,
                        "job_type": job.kind,
                        "description": kind.description(),
                        "duration_ms": duration_ms,
                    }),
                );
            }
            Ok(Err(e)) => self.handle_error(kind, job, e, duration_ms),
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    let payload = join_err.into_panic();
                    let text = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    format!("panic: {text}")
                } else {
                    "attempt task cancelled".to_string()
                };
                error!(job_id = %job.id, job_type = %job.kind, error = %message, "handler crashed");

                self.record(&job.kind, JobOutcome::Failed);
                self.finish_quietly(&job.id);
                self.bus.emit(
                    EventKind::JobFailed,
                    "worker",
                    json!({
                        "job_id": job.id,
                        "job_type": job.kind,
                        "description": kind.description(),
                        "error": message,
                        "duration_ms": duration_ms,
                    }),
                );
            }
        }
    }

    fn handle_error(&self, kind: JobKind, mut job: Job, e: EngineError, duration_ms: u64) {
        self.record(&job.kind, JobOutcome::Failed);

        if matches!(e, EngineError::Fatal(_)) {
            error!(job_type = %job.kind, error = %e, "fatal handler error, pool degraded");
            self.degraded.store(true, Ordering::Relaxed);
        }

        if e.is_retryable() && job.retries < job.max_retries {
            job.retries += 1;
            // Linear backoff of retries × 1 s. The ceil keeps the promise
            // with second-granularity timestamps: a retry is never visible
            // earlier than its full backoff.
            let now_ceil = (Utc::now().timestamp_millis() + 999).div_euclid(1000);
            job.available_at = now_ceil + i64::from(job.retries);
            debug!(
                job_id = %job.id,
                job_type = %job.kind,
                retries = job.retries,
                error = %e,
                "attempt failed, retrying with backoff"
            );
            if let Err(qe) = self.queue.requeue(&job) {
                error!(job_id = %job.id, error = %qe, "requeue failed, dropping job");
            }
            return;
        }

        warn!(job_id = %job.id, job_type = %job.kind, error = %e, "job failed terminally");
        self.finish_quietly(&job.id);
        self.bus.emit(
            EventKind::JobFailed,
            "worker",
            json!({
                "job_id": job.id,
                "job_type": job.kind,
                "description": kind.description(),
                "error": e.to_string(),
                "duration_ms": duration_ms,
            }),
        );
    }

    /// Terminal path for jobs no handler can ever run.
    fn fail_undispatchable(&self, job: &Job, reason: &str) {
        warn!(job_id = %job.id, job_type = %job.kind, reason, "undispatchable job");
        self.record(&job.kind, JobOutcome::Failed);
        self.finish_quietly(&job.id);
        self.bus.emit(
            EventKind::JobFailed,
            "worker",
            json!({
                "job_id": job.id,
                "job_type": job.kind,
                "description": job.kind,
                "error": reason,
                "duration_ms": 0,
            }),
        );
    }

    fn record(&self, kind: &str, outcome: JobOutcome) {
        if let Err(e) = self
            .queue
            .record_execution(kind, outcome, Utc::now().timestamp())
        {
            warn!(kind, error = %e, "failed to record job history");
        }
    }

    fn finish_quietly(&self, job_id: &str) {
        if let Err(e) = self.queue.finish(job_id) {
            warn!(job_id, error = %e, "failed to remove finished job");
        }
    }
}
