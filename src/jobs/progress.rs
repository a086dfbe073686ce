// =============================================================================
// Progress Reporter — throttled JobProgress events for one running job
// =============================================================================
//
// Progress is explicitly lossy: observers may miss intermediate values but
// always see the terminal `current == total` report.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;

use crate::events::{EventBus, EventKind};
use crate::jobs::JobKind;

pub struct ProgressReporter {
    bus: EventBus,
    job_id: String,
    kind: JobKind,
    throttle: Duration,
    last_emit: Mutex<Option<Instant>>,
}

impl ProgressReporter {
    pub fn new(bus: EventBus, job_id: impl Into<String>, kind: JobKind, throttle: Duration) -> Self {
        Self {
            bus,
            job_id: job_id.into(),
            kind,
            throttle,
            last_emit: Mutex::new(None),
        }
    }

    /// Report positional progress. Throttled to one event per throttle
    /// window, except that `current == total` always emits.
    pub fn report(&self, current: u64, total: u64, message: &str) {
        let terminal = current == total;
        if !terminal && !self.should_emit() {
            return;
        }

        self.emit(json!({
            "current": current,
            "total": total,
            "message": message,
        }));
    }

    /// Report a free-form status line. Always throttled.
    pub fn report_message(&self, message: &str) {
        if !self.should_emit() {
            return;
        }

        self.emit(json!({ "message": message }));
    }

    fn should_emit(&self) -> bool {
        let mut last = self.last_emit.lock();
        match *last {
            Some(at) if at.elapsed() < self.throttle => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    fn emit(&self, progress: serde_json::Value) {
        *self.last_emit.lock() = Some(Instant::now());
        self.bus.emit(
            EventKind::JobProgress,
            "worker",
            json!({
                "job_id": self.job_id,
                "job_type": self.kind.as_str(),
                "status": "progress",
                "description": self.kind.description(),
                "progress": progress,
            }),
        );
    }
}
