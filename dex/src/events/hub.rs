//! Event Hub - central pub/sub for Poindexter events
//!
//! Unlike a broadcast channel, every subscriber owns a bounded queue: a slow
//! consumer is dropped rather than ever blocking a publisher, and the drop is
//! announced once with a `subscriber.dropped` event to the remaining
//! subscribers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::types::{topic_matches, topics, Event};

/// Default per-subscriber queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Queues smaller than this are rounded up
pub const MIN_QUEUE_CAPACITY: usize = 64;

struct Subscriber {
    id: u64,
    pattern: String,
    tx: mpsc::Sender<Event>,
}

struct HubInner {
    subscribers: Vec<Subscriber>,
}

/// Central event hub
///
/// Cheap to share as `Arc<EventHub>`. Within one publisher, a subscriber
/// observes events in publish order; there is no total order across
/// publishers.
pub struct EventHub {
    inner: Arc<Mutex<HubInner>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_QUEUE_CAPACITY);
        debug!(capacity, "EventHub::with_capacity: creating hub");
        Self {
            inner: Arc::new(Mutex::new(HubInner { subscribers: Vec::new() })),
            capacity,
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe with a topic pattern (`*`, `prefix.*` or an exact type)
    pub fn subscribe(&self, pattern: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().expect("event hub lock poisoned");
        inner.subscribers.push(Subscriber {
            id,
            pattern: pattern.to_string(),
            tx,
        });
        debug!(id, %pattern, "EventHub::subscribe: new subscriber");
        Subscription {
            id,
            rx,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Publish an event to all matching subscribers
    ///
    /// Never blocks. A subscriber whose queue is full is removed and a single
    /// `subscriber.dropped` event goes out to everyone left.
    pub fn publish(&self, event: Event) {
        let dropped = self.deliver(&event);
        for id in dropped {
            warn!(subscriber_id = id, "EventHub::publish: dropped slow subscriber");
            let notice = Event::new(
                topics::SUBSCRIBER_DROPPED,
                json!({ "subscriber_id": id, "while_publishing": event.event_type }),
            );
            // Best effort; anyone overflowing on the notice itself is silently removed
            self.deliver(&notice);
        }
    }

    /// Deliver to matching subscribers; returns ids dropped for overflow
    fn deliver(&self, event: &Event) -> Vec<u64> {
        let mut inner = self.inner.lock().expect("event hub lock poisoned");
        let mut overflowed = Vec::new();
        inner.subscribers.retain(|sub| {
            if !topic_matches(&sub.pattern, &event.event_type) {
                return true;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    overflowed.push(sub.id);
                    false
                }
                // Receiver gone: quietly deregister
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        overflowed
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("event hub lock poisoned").subscribers.len()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription; dropping it deregisters and releases the queue
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Event>,
    inner: Arc<Mutex<HubInner>>,
}

impl Subscription {
    /// Receive the next matching event; `None` once unsubscribed and drained
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.subscribers.retain(|sub| sub.id != self.id);
        }
    }
}

/// Create a hub wrapped in an Arc for shared ownership
pub fn create_event_hub() -> Arc<EventHub> {
    Arc::new(EventHub::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: &str) -> Event {
        Event::new(event_type, json!({"task_id": "t-1"}))
    }

    #[tokio::test]
    async fn test_publish_and_receive() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe("*");

        hub.publish(event("task.created"));

        let received = sub.recv().await.unwrap();
        assert_eq!(received.event_type, "task.created");
        assert_eq!(received.payload["task_id"], "t-1");
    }

    #[tokio::test]
    async fn test_topic_filtering() {
        let hub = EventHub::new();
        let mut task_sub = hub.subscribe("task.*");
        let mut exact_sub = hub.subscribe("session.completed");

        hub.publish(event("task.created"));
        hub.publish(event("session.iteration"));
        hub.publish(event("session.completed"));

        assert_eq!(task_sub.recv().await.unwrap().event_type, "task.created");
        assert!(task_sub.try_recv().is_none());

        assert_eq!(exact_sub.recv().await.unwrap().event_type, "session.completed");
        assert!(exact_sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_publish_with_no_subscribers() {
        let hub = EventHub::new();
        // Must not panic or block
        hub.publish(event("task.created"));
    }

    #[tokio::test]
    async fn test_publish_order_preserved() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe("*");

        for i in 0..10 {
            hub.publish(Event::new("session.iteration", json!({ "iteration": i })));
        }

        for i in 0..10 {
            let received = sub.recv().await.unwrap();
            assert_eq!(received.payload["iteration"], i);
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_dropped_once() {
        let hub = EventHub::with_capacity(MIN_QUEUE_CAPACITY);
        let slow = hub.subscribe("session.*");
        let mut watcher = hub.subscribe("subscriber.*");

        // Overflow the slow subscriber without ever receiving
        for i in 0..(MIN_QUEUE_CAPACITY + 10) {
            hub.publish(Event::new("session.iteration", json!({ "iteration": i })));
        }

        // Exactly one drop notice
        let notice = watcher.recv().await.unwrap();
        assert_eq!(notice.event_type, "subscriber.dropped");
        assert!(watcher.try_recv().is_none());

        // Slow subscriber is gone from the registry (watcher remains)
        assert_eq!(hub.subscriber_count(), 1);
        drop(slow);
    }

    #[tokio::test]
    async fn test_unsubscribe_on_drop() {
        let hub = EventHub::new();
        let sub = hub.subscribe("*");
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);

        // Publishing after drop is fine
        hub.publish(event("task.created"));
    }

    #[tokio::test]
    async fn test_multiple_subscribers_all_receive() {
        let hub = EventHub::new();
        let mut a = hub.subscribe("*");
        let mut b = hub.subscribe("task.*");

        hub.publish(event("task.completed"));

        assert_eq!(a.recv().await.unwrap().event_type, "task.completed");
        assert_eq!(b.recv().await.unwrap().event_type, "task.completed");
    }

    #[tokio::test]
    async fn test_closed_receiver_removed_silently() {
        let hub = EventHub::new();
        let sub = hub.subscribe("*");
        let mut watcher = hub.subscribe("subscriber.*");

        drop(sub);
        hub.publish(event("task.created"));

        // A closed receiver is not an overflow: no drop notice
        assert!(watcher.try_recv().is_none());
    }

    #[test]
    fn test_capacity_floor() {
        let hub = EventHub::with_capacity(1);
        assert_eq!(hub.capacity, MIN_QUEUE_CAPACITY);
    }
}
