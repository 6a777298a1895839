//! Bounded event queue
//!
//! Multi-producer FIFO with a fixed capacity. Pushing never blocks: when the
//! queue is full the new item is dropped and counted. Popping waits up to a
//! caller-supplied timeout.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

/// Default capacity of the MIDI event queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 50;

#[derive(Debug, Default)]
struct QueueStats {
    pushed: AtomicU64,
    dropped: AtomicU64,
}

/// Bounded, drop-on-full FIFO shared between producers and a consumer
pub struct EventQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
    stats: Arc<QueueStats>,
}

impl<T> Clone for EventQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            capacity: self.capacity,
            stats: self.stats.clone(),
        }
    }
}

impl<T> EventQueue<T> {
    /// Create a queue holding at most `capacity` items
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            stats: Arc::new(QueueStats::default()),
        }
    }

    /// Push without blocking
    ///
    /// Returns false if the queue was full and `item` was dropped.
    pub fn push(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => {
                self.stats.pushed.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                trace!("Event queue full, dropped item (total dropped: {})", dropped);
                false
            }
        }
    }

    /// Pop the oldest item, waiting up to `wait`
    ///
    /// A zero `wait` polls without blocking.
    pub fn try_pop(&self, wait: Duration) -> Option<T> {
        if wait.is_zero() {
            return self.rx.try_recv().ok();
        }
        match self.rx.recv_timeout(wait) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Drain everything currently queued
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items accepted since creation
    pub fn pushed(&self) -> u64 {
        self.stats.pushed.load(Ordering::Relaxed)
    }

    /// Items dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
