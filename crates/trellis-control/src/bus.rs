//! In-memory event bus.
//!
//! Type-filtered publish/subscribe with a bounded queue per subscriber
//! and a bounded global history ring. Publishing never blocks: a full
//! subscriber queue drops the event for that subscriber only, so one
//! slow consumer can never stall the publisher or its peers. Delivery
//! to any single subscriber preserves publish order.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use trellis_common::protocol::Event;

const DEFAULT_HISTORY_SIZE: usize = 100;
const SUBSCRIBER_QUEUE_SIZE: usize = 256;

struct SubscriberHandle {
    /// Event types this subscriber wants; None = all.
    filter: Option<HashSet<String>>,
    tx: mpsc::Sender<Event>,
}

struct BusInner {
    subscribers: Mutex<Vec<SubscriberHandle>>,
    history: Mutex<VecDeque<Event>>,
    history_size: usize,
    event_count: AtomicU64,
}

/// Handle to the shared event bus. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_SIZE)
    }
}

impl EventBus {
    pub fn new(history_size: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                history: Mutex::new(VecDeque::with_capacity(history_size)),
                history_size,
                event_count: AtomicU64::new(0),
            }),
        }
    }

    /// Create a new subscription, optionally filtered by event type.
    pub fn subscribe(&self, event_types: Option<Vec<String>>) -> Subscriber {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_SIZE);
        let handle = SubscriberHandle {
            filter: event_types.map(|ts| ts.into_iter().collect()),
            tx,
        };
        let mut subscribers = self.inner.subscribers.lock().expect("bus lock poisoned");
        subscribers.push(handle);
        tracing::debug!(total = subscribers.len(), "subscriber added");
        Subscriber { rx }
    }

    /// Publish an event to all matching subscribers.
    ///
    /// The event is recorded in history regardless of subscribers. A
    /// subscriber whose queue is full misses this event (logged); closed
    /// subscribers are pruned here.
    pub fn publish(&self, event_type: &str, data: serde_json::Value, source: &str) -> Event {
        let event = Event::new(event_type, data, source);

        {
            let mut history = self.inner.history.lock().expect("bus lock poisoned");
            if history.len() >= self.inner.history_size {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        self.inner.event_count.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self.inner.subscribers.lock().expect("bus lock poisoned");
        subscribers.retain(|sub| !sub.tx.is_closed());
        for sub in subscribers.iter() {
            let wanted = sub
                .filter
                .as_ref()
                .map(|f| f.contains(event_type))
                .unwrap_or(true);
            if !wanted {
                continue;
            }
            if let Err(mpsc::error::TrySendError::Full(_)) = sub.tx.try_send(event.clone()) {
                tracing::warn!(event_type, "subscriber queue full, dropping event");
            }
        }

        event
    }

    /// Recent events, newest last, optionally filtered by type.
    pub fn history(&self, event_type: Option<&str>, limit: usize) -> Vec<Event> {
        let history = self.inner.history.lock().expect("bus lock poisoned");
        let filtered: Vec<Event> = history
            .iter()
            .filter(|e| event_type.map(|t| e.event_type == t).unwrap_or(true))
            .cloned()
            .collect();
        let skip = filtered.len().saturating_sub(limit);
        filtered.into_iter().skip(skip).collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .expect("bus lock poisoned")
            .len()
    }

    /// Total events published over the bus lifetime.
    pub fn event_count(&self) -> u64 {
        self.inner.event_count.load(Ordering::Relaxed)
    }
}

/// One subscription; dropped or closed subscribers are pruned lazily.
pub struct Subscriber {
    rx: mpsc::Receiver<Event>,
}

impl Subscriber {
    /// Wait for the next matching event.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Wait for the next matching event, up to `timeout`.
    pub async fn next(&mut self, timeout: Duration) -> Option<Event> {
        tokio::time::timeout(timeout, self.rx.recv()).await.ok()?
    }

    /// Stop receiving; pending queued events are discarded.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
