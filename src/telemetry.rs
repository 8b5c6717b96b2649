//! Telemetry Bus (C6): fans out per-test progress and terminal events to
//! WebSocket subscribers.
//!
//! Grounded on `worker.rs::should_sample`'s counter-driven sampling for the
//! "drop rather than block the hot path" posture, generalized here from
//! sampling raw request events to dropping non-terminal telemetry frames
//! under subscriber backpressure. Terminal events are never dropped: a full
//! outbox evicts its oldest non-terminal frame to make room, following
//! SPEC_FULL.md's ring-buffer bus contract.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::Notify;

use crate::aggregator::{Summary, TimeSeriesPoint};
use crate::metrics::TELEMETRY_DROPPED_TOTAL;

/// Server-to-client events sent over a test's WebSocket subscription.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Connected {
        #[serde(rename = "testId")]
        test_id: String,
    },
    TestUpdate {
        #[serde(rename = "testId")]
        test_id: String,
        elapsed: f64,
        progress: f64,
        #[serde(rename = "totalRequests")]
        total_requests: u64,
        #[serde(rename = "successfulRequests")]
        successful_requests: u64,
        #[serde(rename = "failedRequests")]
        failed_requests: u64,
        point: TimeSeriesPoint,
        timestamp: String,
    },
    TestCompleted {
        #[serde(rename = "testId")]
        test_id: String,
        summary: Summary,
    },
    TestFailed {
        #[serde(rename = "testId")]
        test_id: String,
        error: String,
    },
    TestStopped {
        #[serde(rename = "testId")]
        test_id: String,
        summary: Summary,
    },
}

impl TelemetryEvent {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            TelemetryEvent::TestCompleted { .. }
                | TelemetryEvent::TestFailed { .. }
                | TelemetryEvent::TestStopped { .. }
        )
    }
}

/// A bounded, evicting FIFO queue plus a wakeup signal. `push` never blocks
/// and never fails: it is the single place the drop policy in SPEC_FULL.md
/// §4.6 is enforced.
struct Outbox {
    queue: Mutex<VecDeque<TelemetryEvent>>,
    notify: Notify,
    capacity: usize,
}

impl Outbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, event: TelemetryEvent) {
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= self.capacity {
                if event.is_terminal() {
                    // Evict the oldest non-terminal frame to make room; a
                    // terminal event is never dropped.
                    match queue.iter().position(|e| !e.is_terminal()) {
                        Some(pos) => {
                            queue.remove(pos);
                        }
                        None => {
                            queue.pop_front();
                        }
                    }
                } else {
                    queue.pop_front();
                    TELEMETRY_DROPPED_TOTAL.inc();
                }
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Waits for and returns the next event. Returns `None` only once the
    /// owning `Subscription` has dropped its last clone (checked by the
    /// caller via `Arc::strong_count`, not tracked here).
    async fn recv(&self) -> TelemetryEvent {
        loop {
            let notified = self.notify.notified();
            {
                let mut queue = self.queue.lock().unwrap();
                if let Some(event) = queue.pop_front() {
                    return event;
                }
            }
            notified.await;
        }
    }
}

/// A live WebSocket subscription. Dropping it unsubscribes implicitly: the
/// bus prunes entries whose `Outbox` has no other owner on the next publish
/// to that key.
pub struct Subscription {
    outbox: Arc<Outbox>,
}

impl Subscription {
    pub async fn recv(&self) -> TelemetryEvent {
        self.outbox.recv().await
    }
}

/// Pub/sub hub keyed by test id, with `None` meaning "all tests". Each
/// subscriber gets its own bounded outbox; a slow subscriber can only ever
/// fall behind on its own queue, never block a publisher or another
/// subscriber.
pub struct TelemetryBus {
    subscribers: Mutex<HashMap<Option<String>, Vec<Arc<Outbox>>>>,
    outbox_capacity: usize,
}

impl TelemetryBus {
    pub fn new(outbox_capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            outbox_capacity,
        }
    }

    /// Subscribes to `test_id`'s events (`None` subscribes to every test),
    /// immediately enqueuing `Connected`. Dropping the returned
    /// `Subscription` unsubscribes.
    pub fn subscribe(&self, test_id: Option<&str>) -> Subscription {
        let outbox = Arc::new(Outbox::new(self.outbox_capacity));
        outbox.push(TelemetryEvent::Connected {
            test_id: test_id.unwrap_or("*").to_string(),
        });

        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers
            .entry(test_id.map(str::to_string))
            .or_default()
            .push(Arc::clone(&outbox));
        Subscription { outbox }
    }

    /// Publishes `event` to every live subscriber of `test_id` plus every
    /// "all tests" subscriber. Event ordering per test id is FIFO to every
    /// observer of that id, since each observer's outbox is itself FIFO.
    pub fn publish(&self, test_id: &str, event: TelemetryEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();

        for key in [Some(test_id.to_string()), None] {
            let Some(list) = subscribers.get_mut(&key) else {
                continue;
            };
            list.retain(|outbox| Arc::strong_count(outbox) > 1);
            for outbox in list.iter() {
                outbox.push(event.clone());
            }
        }

        if subscribers
            .get(&Some(test_id.to_string()))
            .is_some_and(Vec::is_empty)
        {
            subscribers.remove(&Some(test_id.to_string()));
        }
    }

    /// Drops all per-test subscriber handles for `test_id` once its
    /// terminal event has been published; "all tests" subscribers are
    /// untouched.
    pub fn retire(&self, test_id: &str) {
        self.subscribers
            .lock()
            .unwrap()
            .remove(&Some(test_id.to_string()));
    }
}
