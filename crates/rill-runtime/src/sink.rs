//! Terminal observers for query graphs
//!
//! A sink is the single downstream observer at the bottom of a pipe tree.
//! [`CollectingSink`] records everything it receives and is the workhorse
//! of the test suites; [`NullSink`] discards batches while still
//! releasing them to their pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::batch::Batch;
use crate::error::RuntimeError;
use crate::event::Event;
use crate::node::StreamObserver;
use crate::plan::PlanNode;

/// Sink that records received events, lifecycle signals, and the plan
/// tree.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<Event>>,
    completions: AtomicUsize,
    flushes: AtomicUsize,
    errors: Mutex<Vec<Arc<RuntimeError>>>,
    plan: Mutex<Option<PlanNode>>,
}

impl CollectingSink {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Received event timestamps, in arrival order.
    pub fn timestamps(&self) -> Vec<chrono::DateTime<chrono::Utc>> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|e| e.timestamp)
            .collect()
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> usize {
        self.errors.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn last_error(&self) -> Option<Arc<RuntimeError>> {
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .cloned()
    }

    pub fn plan(&self) -> Option<PlanNode> {
        self.plan
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl StreamObserver for CollectingSink {
    fn on_next(&self, mut batch: Batch) {
        let received = batch.take_remaining();
        batch.release();
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(received);
    }

    fn on_flush(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_completed(&self) {
        self.completions.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, error: Arc<RuntimeError>) {
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(error);
    }

    fn produce_plan(&self, upstream: PlanNode) {
        *self.plan.lock().unwrap_or_else(|e| e.into_inner()) = Some(upstream);
    }
}

/// Sink that discards all input while keeping pool accounting correct.
#[derive(Default)]
pub struct NullSink;

impl NullSink {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl StreamObserver for NullSink {
    fn on_next(&self, batch: Batch) {
        batch.release();
    }

    fn on_flush(&self) {}

    fn on_completed(&self) {}

    fn on_error(&self, _error: Arc<RuntimeError>) {}

    fn produce_plan(&self, _upstream: PlanNode) {}
}
