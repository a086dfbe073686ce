// =============================================================================
// Event Bus — typed pub/sub for job lifecycle and domain events
// =============================================================================
//
// Single process-wide bus. Subscribers register per kind and receive an
// unbounded channel; emitters never block and never drop. A slow subscriber
// costs memory, not correctness, and per-subscriber delivery order always
// matches emission order.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Everything observable about the engine flows through these kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    JobStarted,
    JobProgress,
    JobCompleted,
    JobFailed,
    MarketsStatusChanged,
    TradeExecuted,
    PositionUpdated,
    RecommendationCreated,
    PlanningCompleted,
}

/// Immutable event record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub source: String,
    pub data: serde_json::Value,
    /// Unix seconds.
    pub timestamp: i64,
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::UnboundedSender<Event>,
}

struct Inner {
    subscribers: RwLock<HashMap<EventKind, Vec<Subscriber>>>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
}

/// Cheaply cloneable bus handle.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Register a subscriber for the given kinds.
    ///
    /// Events of any listed kind arrive on the returned channel in
    /// emission order.
    pub fn subscribe(&self, kinds: &[EventKind]) -> (SubscriberId, mpsc::UnboundedReceiver<Event>) {
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();

        let mut subs = self.inner.subscribers.write();
        for kind in kinds {
            subs.entry(*kind).or_default().push(Subscriber {
                id,
                tx: tx.clone(),
            });
        }

        (id, rx)
    }

    /// Remove a subscriber from every kind it was registered for.
    pub fn unsubscribe(&self, id: SubscriberId) {
        let mut subs = self.inner.subscribers.write();
        for list in subs.values_mut() {
            list.retain(|s| s.id != id);
        }
    }

    /// Publish an event to every subscriber of `kind`.
    ///
    /// Non-blocking; a no-op after `shutdown()`. Subscribers whose receiver
    /// has been dropped are pruned on the next emit of that kind.
    pub fn emit(&self, kind: EventKind, source: &str, data: serde_json::Value) {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return;
        }

        let event = Event {
            kind,
            source: source.to_string(),
            data,
            timestamp: Utc::now().timestamp(),
        };

        let dead: Vec<SubscriberId> = {
            let subs = self.inner.subscribers.read();
            let Some(list) = subs.get(&kind) else {
                return;
            };
            list.iter()
                .filter(|s| s.tx.send(event.clone()).is_err())
                .map(|s| s.id)
                .collect()
        };

        if !dead.is_empty() {
            debug!(kind = ?kind, count = dead.len(), "pruning dropped subscribers");
            let mut subs = self.inner.subscribers.write();
            if let Some(list) = subs.get_mut(&kind) {
                list.retain(|s| !dead.contains(&s.id));
            }
        }
    }

    /// After this call every `emit` is a no-op. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::Release);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn delivery_order_matches_emission_order() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe(&[EventKind::JobStarted]);

        for i in 0..10 {
            bus.emit(EventKind::JobStarted, "test", json!({ "i": i }));
        }

        for i in 0..10 {
            let ev = rx.recv().await.unwrap();
            assert_eq!(ev.data["i"], i);
        }
    }

    #[tokio::test]
    async fn subscriber_only_sees_registered_kinds() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe(&[EventKind::JobCompleted]);

        bus.emit(EventKind::JobStarted, "test", json!({}));
        bus.emit(EventKind::JobCompleted, "test", json!({ "done": true }));

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::JobCompleted);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (id, mut rx) = bus.subscribe(&[EventKind::JobFailed]);

        bus.unsubscribe(id);
        bus.emit(EventKind::JobFailed, "test", json!({}));

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn emit_after_shutdown_is_noop() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe(&[EventKind::TradeExecuted]);

        bus.shutdown();
        bus.emit(EventKind::TradeExecuted, "test", json!({}));

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_receiver_does_not_poison_other_subscribers() {
        let bus = EventBus::new();
        let (_a, rx_a) = bus.subscribe(&[EventKind::JobProgress]);
        let (_b, mut rx_b) = bus.subscribe(&[EventKind::JobProgress]);

        drop(rx_a);
        bus.emit(EventKind::JobProgress, "test", json!({ "n": 1 }));
        bus.emit(EventKind::JobProgress, "test", json!({ "n": 2 }));

        assert_eq!(rx_b.recv().await.unwrap().data["n"], 1);
        assert_eq!(rx_b.recv().await.unwrap().data["n"], 2);
    }
}
