use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

/// A typed publish/subscribe topic.
///
/// Publishing never blocks. Slow subscribers lag and lose the oldest events
/// rather than stalling the publisher; events published while nobody is
/// subscribed are counted as undelivered.
pub struct Topic<T: Clone> {
    tx: broadcast::Sender<T>,
    undelivered: Arc<AtomicU64>,
}

impl<T: Clone> Topic<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            undelivered: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn publish(&self, event: T) {
        if self.tx.send(event).is_err() {
            self.undelivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Events published while the topic had no subscribers.
    pub fn undelivered_count(&self) -> u64 {
        self.undelivered.load(Ordering::Relaxed)
    }
}

impl<T: Clone> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            undelivered: Arc::clone(&self.undelivered),
        }
    }
}

impl<T: Clone> Default for Topic<T> {
    fn default() -> Self {
        Self::new(256)
    }
}
