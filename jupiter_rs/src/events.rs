//! Typed pub/sub event bus.
//!
//! Per-subscriber bounded mailboxes: `emit` never blocks the producer;
//! on overflow the oldest queued event is dropped and the `bus_overflow`
//! counter incremented. Delivery to one subscriber preserves production
//! FIFO; order across subscribers is unspecified. Callbacks run on
//! dedicated tokio tasks, never on the producer's thread.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

/// Default mailbox depth per subscriber.
pub const DEFAULT_MAILBOX_DEPTH: usize = 1024;

/// Enumerated event topics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Topic {
    ScanStarted,
    ScanFinished,
    RunStarted,
    RunFinished,
    ConfigUpdated,
    PluginToggled,
    PluginReloaded,
    SnapshotCreated,
    JobStarted,
    JobProgress,
    JobCompleted,
    JobFailed,
    PluginNotification,
}

impl Topic {
    pub const ALL: [Topic; 13] = [
        Topic::ScanStarted,
        Topic::ScanFinished,
        Topic::RunStarted,
        Topic::RunFinished,
        Topic::ConfigUpdated,
        Topic::PluginToggled,
        Topic::PluginReloaded,
        Topic::SnapshotCreated,
        Topic::JobStarted,
        Topic::JobProgress,
        Topic::JobCompleted,
        Topic::JobFailed,
        Topic::PluginNotification,
    ];

    /// Wire name (`SCAN_STARTED`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::ScanStarted => "SCAN_STARTED",
            Topic::ScanFinished => "SCAN_FINISHED",
            Topic::RunStarted => "RUN_STARTED",
            Topic::RunFinished => "RUN_FINISHED",
            Topic::ConfigUpdated => "CONFIG_UPDATED",
            Topic::PluginToggled => "PLUGIN_TOGGLED",
            Topic::PluginReloaded => "PLUGIN_RELOADED",
            Topic::SnapshotCreated => "SNAPSHOT_CREATED",
            Topic::JobStarted => "JOB_STARTED",
            Topic::JobProgress => "JOB_PROGRESS",
            Topic::JobCompleted => "JOB_COMPLETED",
            Topic::JobFailed => "JOB_FAILED",
            Topic::PluginNotification => "PLUGIN_NOTIFICATION",
        }
    }
}

/// One event on the bus.
#[derive(Clone, Debug, Serialize)]
pub struct Event {
    pub topic: Topic,
    pub payload: serde_json::Value,
    pub produced_at: DateTime<Utc>,
}

pub type Callback = Arc<dyn Fn(Event) + Send + Sync>;

struct Mailbox {
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
}

struct Subscriber {
    id: u64,
    mailbox: Arc<Mailbox>,
}

/// Handle returned by `subscribe`; dropping it does not unsubscribe,
/// call [`EventBus::unsubscribe`] explicitly.
#[derive(Clone, Copy, Debug)]
pub struct SubscriptionHandle {
    id: u64,
}

#[derive(Default)]
pub struct BusCounters {
    pub emitted: AtomicU64,
    pub delivered: AtomicU64,
    pub bus_overflow: AtomicU64,
}

pub struct EventBus {
    subscribers: RwLock<HashMap<Topic, Vec<Subscriber>>>,
    counters: BusCounters,
    capacity: usize,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_MAILBOX_DEPTH)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            counters: BusCounters::default(),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe one callback to a set of topics through a single
    /// mailbox, preserving FIFO across those topics for this subscriber.
    /// The `ordered` flag is part of the contract; only ordered delivery
    /// is implemented and the flag documents the subscriber's
    /// expectation.
    pub fn subscribe(
        self: &Arc<Self>,
        topics: &[Topic],
        callback: Callback,
        _ordered: bool,
    ) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mailbox = Arc::new(Mailbox {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity: self.capacity,
        });

        {
            let mut map = self.subscribers.write().expect("subscriber map poisoned");
            for topic in topics {
                map.entry(*topic).or_default().push(Subscriber {
                    id,
                    mailbox: Arc::clone(&mailbox),
                });
            }
        }

        // Dedicated delivery task per subscriber.
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let next = {
                    let mut queue = mailbox.queue.lock().expect("mailbox poisoned");
                    queue.pop_front()
                };
                match next {
                    Some(event) => {
                        callback(event);
                        bus.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    None => {
                        if mailbox.closed.load(Ordering::Acquire) {
                            return;
                        }
                        mailbox.notify.notified().await;
                    }
                }
            }
        });

        SubscriptionHandle { id }
    }

    /// Convenience: subscribe to every topic.
    pub fn subscribe_all(self: &Arc<Self>, callback: Callback) -> SubscriptionHandle {
        self.subscribe(&Topic::ALL, callback, true)
    }

    /// Remove a subscription; its delivery task drains and exits.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut map = self.subscribers.write().expect("subscriber map poisoned");
        for subscribers in map.values_mut() {
            subscribers.retain(|s| {
                if s.id == handle.id {
                    s.mailbox.closed.store(true, Ordering::Release);
                    s.mailbox.notify.notify_one();
                    false
                } else {
                    true
                }
            });
        }
    }

    /// Non-blocking publish. Overflowing mailboxes drop their oldest
    /// event.
    pub fn emit(&self, topic: Topic, payload: serde_json::Value) {
        let event = Event {
            topic,
            payload,
            produced_at: Utc::now(),
        };
        self.counters.emitted.fetch_add(1, Ordering::Relaxed);
        let map = self.subscribers.read().expect("subscriber map poisoned");
        let Some(subscribers) = map.get(&topic) else {
            return;
        };
        for subscriber in subscribers {
            let mut queue = subscriber.mailbox.queue.lock().expect("mailbox poisoned");
            queue.push_back(event.clone());
            if queue.len() > subscriber.mailbox.capacity {
                queue.pop_front();
                self.counters.bus_overflow.fetch_add(1, Ordering::Relaxed);
                debug!(topic = topic.as_str(), "mailbox overflow, oldest event dropped");
            }
            drop(queue);
            subscriber.mailbox.notify.notify_one();
        }
    }

    pub fn overflow_count(&self) -> u64 {
        self.counters.bus_overflow.load(Ordering::Relaxed)
    }

    pub fn emitted_count(&self) -> u64 {
        self.counters.emitted.load(Ordering::Relaxed)
    }

    pub fn delivered_count(&self) -> u64 {
        self.counters.delivered.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    async fn drain(bus: &Arc<EventBus>, expected: u64) {
        for _ in 0..200 {
            if bus.delivered_count() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("bus never delivered {expected} events");
    }

    #[tokio::test]
    async fn fifo_per_subscriber() {
        let bus = Arc::new(EventBus::default());
        let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            &[Topic::ScanFinished],
            Arc::new(move |event| {
                sink.lock()
                    .expect("sink")
                    .push(event.payload["n"].as_i64().unwrap_or(-1));
            }),
            true,
        );

        for n in 0..50 {
            bus.emit(Topic::ScanFinished, json!({ "n": n }));
        }
        drain(&bus, 50).await;

        let order = seen.lock().expect("sink").clone();
        assert_eq!(order, (0..50).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = Arc::new(EventBus::default());
        let count = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&count);
        bus.subscribe(
            &[Topic::JobStarted],
            Arc::new(move |_| {
                sink.fetch_add(1, Ordering::Relaxed);
            }),
            true,
        );

        bus.emit(Topic::ScanStarted, json!({}));
        bus.emit(Topic::JobStarted, json!({}));
        drain(&bus, 1).await;
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overflow_drops_oldest_and_counts() {
        let bus = Arc::new(EventBus::new(4));
        let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let gate = Arc::new(AtomicBool::new(false));
        let gate_reader = Arc::clone(&gate);
        bus.subscribe(
            &[Topic::JobProgress],
            Arc::new(move |event| {
                // Busy-wait until the producer finished flooding, so the
                // mailbox actually overflows.
                while !gate_reader.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(1));
                }
                sink.lock()
                    .expect("sink")
                    .push(event.payload["n"].as_i64().unwrap_or(-1));
            }),
            true,
        );
        // Let the delivery task pick up the first event and block on it.
        bus.emit(Topic::JobProgress, json!({ "n": 0 }));
        tokio::time::sleep(Duration::from_millis(20)).await;
        for n in 1..=10 {
            bus.emit(Topic::JobProgress, json!({ "n": n }));
        }
        gate.store(true, Ordering::Release);
        drain(&bus, 5).await;

        assert!(bus.overflow_count() > 0);
        let order = seen.lock().expect("sink").clone();
        // Newest events survive; the kept ones stay in FIFO order.
        assert!(order.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(order.last(), Some(&10));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = Arc::new(EventBus::default());
        let count = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&count);
        let handle = bus.subscribe(
            &[Topic::ScanStarted],
            Arc::new(move |_| {
                sink.fetch_add(1, Ordering::Relaxed);
            }),
            true,
        );
        bus.emit(Topic::ScanStarted, json!({}));
        drain(&bus, 1).await;

        bus.unsubscribe(handle);
        bus.emit(Topic::ScanStarted, json!({}));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn subscribe_all_sees_every_topic() {
        let bus = Arc::new(EventBus::default());
        let count = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&count);
        bus.subscribe_all(Arc::new(move |_| {
            sink.fetch_add(1, Ordering::Relaxed);
        }));
        for topic in Topic::ALL {
            bus.emit(topic, json!({}));
        }
        drain(&bus, Topic::ALL.len() as u64).await;
        assert_eq!(count.load(Ordering::Relaxed), Topic::ALL.len() as u64);
    }

    #[test]
    fn topic_wire_names_are_screaming_snake() {
        assert_eq!(Topic::ScanStarted.as_str(), "SCAN_STARTED");
        assert_eq!(Topic::PluginNotification.as_str(), "PLUGIN_NOTIFICATION");
        assert_eq!(
            serde_json::to_string(&Topic::JobProgress).expect("serialize"),
            "\"JOB_PROGRESS\""
        );
    }
}
