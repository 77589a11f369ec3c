//! Poolable batches of time-ordered events
//!
//! A [`Batch`] is the unit of data exchanged between pipes: a run of
//! events sharing one grouping key, ordered by non-decreasing event time,
//! with a read cursor that operators advance as they consume. Batches are
//! leased from a [`BatchPool`] and must be handed back with
//! [`Batch::release`] by exactly one owner; the synchronization engine
//! releases every batch it dequeues unless the operator reports that it
//! retained it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::event::Event;

/// Pool of reusable event storage for batches.
///
/// Tracks how many leased batches are still outstanding so completion and
/// error paths can be checked for leaks.
#[derive(Default)]
pub struct BatchPool {
    free: Mutex<Vec<Vec<Event>>>,
    leased: AtomicUsize,
    reclaimed: AtomicUsize,
}

impl BatchPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Lease a batch for one grouping key, reusing pooled storage when
    /// available. Events must already be in non-decreasing timestamp order.
    pub fn lease(
        self: &Arc<Self>,
        key: impl Into<Arc<str>>,
        events: impl IntoIterator<Item = Event>,
    ) -> Batch {
        let mut storage = self
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .unwrap_or_default();
        storage.clear();
        storage.extend(events);
        self.leased.fetch_add(1, Ordering::Relaxed);
        Batch::with_pool(key, storage, Arc::clone(self))
    }

    /// Number of leased batches not yet released back to the pool.
    pub fn outstanding(&self) -> usize {
        self.leased.load(Ordering::Relaxed) - self.reclaimed.load(Ordering::Relaxed)
    }

    fn reclaim(&self, mut storage: Vec<Event>) {
        storage.clear();
        self.free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(storage);
        self.reclaimed.fetch_add(1, Ordering::Relaxed);
    }
}

/// A container of time-ordered events for one grouping key.
pub struct Batch {
    key: Arc<str>,
    events: Vec<Event>,
    cursor: usize,
    count: usize,
    pool: Option<Arc<BatchPool>>,
}

impl Batch {
    /// Create a batch that is not backed by any pool.
    pub fn detached(key: impl Into<Arc<str>>, events: Vec<Event>) -> Self {
        let count = events.len();
        let batch = Self {
            key: key.into(),
            events,
            cursor: 0,
            count,
            pool: None,
        };
        batch.debug_check_ordered();
        batch
    }

    fn with_pool(key: impl Into<Arc<str>>, events: Vec<Event>, pool: Arc<BatchPool>) -> Self {
        let count = events.len();
        let batch = Self {
            key: key.into(),
            events,
            cursor: 0,
            count,
            pool: Some(pool),
        };
        batch.debug_check_ordered();
        batch
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Element count as of the last [`refresh_count`](Self::refresh_count).
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Events not yet consumed by the cursor.
    pub fn remaining(&self) -> usize {
        self.count.saturating_sub(self.cursor)
    }

    /// Move the read cursor back to the first event.
    pub fn reset_cursor(&mut self) {
        self.cursor = 0;
    }

    /// Recompute the element count from the underlying storage.
    pub fn refresh_count(&mut self) {
        self.count = self.events.len();
    }

    /// The event under the cursor, if any.
    pub fn peek(&self) -> Option<&Event> {
        self.events.get(self.cursor).filter(|_| self.cursor < self.count)
    }

    /// Advance the cursor past the current event.
    pub fn advance(&mut self) {
        if self.cursor < self.count {
            self.cursor += 1;
        }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Drop every event that fails the predicate, in place, keeping the
    /// pool backing. Resets the cursor.
    pub fn retain(&mut self, f: impl FnMut(&Event) -> bool) {
        self.events.retain(f);
        self.count = self.events.len();
        self.cursor = 0;
    }

    /// Take the unconsumed tail of the batch, leaving it fully consumed.
    pub fn take_remaining(&mut self) -> Vec<Event> {
        let tail: Vec<Event> = self.events.drain(self.cursor..).collect();
        self.count = self.events.len();
        tail
    }

    /// Event time of the first unconsumed event.
    pub fn head_timestamp(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.peek().map(|e| e.timestamp)
    }

    /// Return the batch to its pool. Poolless batches just drop their
    /// storage.
    pub fn release(mut self) {
        if let Some(pool) = self.pool.take() {
            pool.reclaim(std::mem::take(&mut self.events));
        }
    }

    fn debug_check_ordered(&self) {
        debug_assert!(
            self.events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp),
            "batch events must be in non-decreasing timestamp order"
        );
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("key", &self.key)
            .field("count", &self.count)
            .field("cursor", &self.cursor)
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}
