//! Multi-subscriber fan-out of [`ChangeEvent`]s.
//!
//! Every subscriber owns an unbounded channel; [`EventBroadcaster::publish`]
//! pushes a clone of the event into each one. A subscriber that never reads
//! only grows its own queue and never holds back anybody else.
//!
//! Lifecycle: created at process start, subscribers attach and detach freely
//! while live, and [`EventBroadcaster::close`] drains: queued events stay
//! readable, after which every subscription ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::models::ChangeEvent;

struct Registry {
    closed: bool,
    subscribers: HashMap<u64, mpsc::UnboundedSender<ChangeEvent>>,
}

struct Shared {
    next_id: AtomicU64,
    registry: Mutex<Registry>,
}

/// Cheaply cloneable handle to the process-wide event bus.
#[derive(Clone)]
pub struct EventBroadcaster {
    shared: Arc<Shared>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                next_id: AtomicU64::new(1),
                registry: Mutex::new(Registry {
                    closed: false,
                    subscribers: HashMap::new(),
                }),
            }),
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        // The registry holds no invariants a panicking holder could break.
        self.shared
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deliver `event` to every live subscriber. Never blocks.
    ///
    /// Returns the number of subscribers the event was queued for.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let mut registry = self.registry();
        if registry.closed {
            tracing::debug!(action = %event.action, filename = %event.filename, "broadcaster closed; event dropped");
            return 0;
        }
        // A failed send means the receiver is gone; forget that subscriber.
        registry
            .subscribers
            .retain(|_, tx| tx.send(event.clone()).is_ok());
        registry.subscribers.len()
    }

    /// Attach a new subscriber. It receives events published from now on.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);

        let mut registry = self.registry();
        if !registry.closed {
            registry.subscribers.insert(id, tx);
        }
        // When closed, `tx` drops here and the subscription ends immediately.

        Subscription {
            id,
            rx,
            broadcaster: Arc::downgrade(&self.shared),
        }
    }

    /// Detach a subscriber, discarding anything it has not read.
    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry().subscribers.len()
    }

    /// Stop accepting events. Subscribers can still read what is queued;
    /// after that their `recv` returns `None`.
    pub fn close(&self) {
        let mut registry = self.registry();
        registry.closed = true;
        registry.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.registry().closed
    }
}

/// A per-subscriber, ordered stream of events. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
    broadcaster: std::sync::Weak<Shared>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the broadcaster has closed and the queue is drained.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    /// Next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.rx.try_recv().ok()
    }

    /// Number of events queued and not yet read.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.broadcaster.upgrade() {
            let mut registry = shared
                .registry
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            registry.subscribers.remove(&self.id);
        }
        self.rx.close();
    }
}
