//! Concrete operators
//!
//! [`FilterOperator`] is the reference single-input operator: it drops
//! events in place and forwards the surviving batch. [`UnionOperator`]
//! is the reference dual-input operator: a time-ordered merge of both
//! sides that only emits an event once the other side has proven time
//! has moved past it.

use std::io::{Read, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::batch::Batch;
use crate::binary::{BinaryOperator, SideOutcome};
use crate::checkpoint::{read_json_state, write_json_state, Checkpointable};
use crate::error::RuntimeError;
use crate::event::Event;
use crate::node::{StreamObserver, UnaryOperator};

/// Stateless-per-event predicate filter.
///
/// The predicate itself cannot be fingerprinted; `label` stands in for it
/// in the schema, so two filters agree on checkpoint layout exactly when
/// their labels agree.
pub struct FilterOperator {
    label: String,
    predicate: Box<dyn Fn(&Event) -> bool + Send>,
    passed: u64,
}

#[derive(Serialize, Deserialize)]
struct FilterState {
    passed: u64,
}

impl FilterOperator {
    pub fn new(
        label: impl Into<String>,
        predicate: impl Fn(&Event) -> bool + Send + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            predicate: Box::new(predicate),
            passed: 0,
        }
    }

    /// Events passed through since construction or the last restore.
    pub fn passed(&self) -> u64 {
        self.passed
    }
}

impl Checkpointable for FilterOperator {
    fn type_name(&self) -> &'static str {
        "filter"
    }

    fn schema_fields(&self) -> Vec<(&'static str, String)> {
        vec![("label", self.label.clone())]
    }

    fn write_state(&self, w: &mut dyn Write) -> Result<(), RuntimeError> {
        write_json_state(w, &FilterState { passed: self.passed })
    }

    fn read_state(&mut self, r: &mut dyn Read) -> Result<(), RuntimeError> {
        let state: FilterState = read_json_state(r)?;
        self.passed = state.passed;
        Ok(())
    }
}

impl UnaryOperator for FilterOperator {
    fn process(&mut self, mut batch: Batch, out: &dyn StreamObserver) {
        batch.retain(|e| (self.predicate)(e));
        if batch.is_empty() {
            batch.release();
            return;
        }
        self.passed += batch.len() as u64;
        trace!(label = %self.label, passed = batch.len(), "filter forwarded");
        out.on_next(batch);
    }
}

/// Time-ordered merge of two already-ordered streams.
///
/// An event is only safe to emit once the opposite side's head timestamp
/// is at or past it, so single-sided batches always stall and two-sided
/// processing merges up to the point one side runs out. Merged output
/// accumulates in `pending` and is emitted in chunks of `emit_threshold`
/// events, with the remainder carried until the next merge or a flush.
pub struct UnionOperator {
    label: String,
    emit_threshold: usize,
    pending: Vec<Event>,
    emitted: u64,
}

#[derive(Serialize, Deserialize)]
struct UnionState {
    pending: Vec<Event>,
    emitted: u64,
}

impl UnionOperator {
    pub fn new(label: impl Into<String>, emit_threshold: usize) -> Self {
        Self {
            label: label.into(),
            emit_threshold: emit_threshold.max(1),
            pending: Vec::new(),
            emitted: 0,
        }
    }

    /// Events emitted downstream since construction or the last restore.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Merged events not yet emitted downstream.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn merge_heads(&mut self, left: &mut Batch, right: &mut Batch) {
        loop {
            let take_left = match (left.head_timestamp(), right.head_timestamp()) {
                (Some(l), Some(r)) => l <= r,
                _ => break,
            };
            let src = if take_left { &mut *left } else { &mut *right };
            if let Some(event) = src.peek().cloned() {
                self.pending.push(event);
                src.advance();
            }
        }
    }

    fn emit(&mut self, out: &dyn StreamObserver) {
        if self.pending.is_empty() {
            return;
        }
        let events = std::mem::take(&mut self.pending);
        self.emitted += events.len() as u64;
        trace!(label = %self.label, events = events.len(), "union emitted");
        out.on_next(Batch::detached(Arc::from(self.label.as_str()), events));
    }

    fn settle_side(batch: Batch) -> SideOutcome {
        if batch.remaining() == 0 {
            SideOutcome::Finished(batch)
        } else {
            SideOutcome::Pending(batch)
        }
    }
}

impl Checkpointable for UnionOperator {
    fn type_name(&self) -> &'static str {
        "union"
    }

    fn schema_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("label", self.label.clone()),
            ("emit_threshold", self.emit_threshold.to_string()),
        ]
    }

    fn write_state(&self, w: &mut dyn Write) -> Result<(), RuntimeError> {
        write_json_state(
            w,
            &UnionState {
                pending: self.pending.clone(),
                emitted: self.emitted,
            },
        )
    }

    fn read_state(&mut self, r: &mut dyn Read) -> Result<(), RuntimeError> {
        let state: UnionState = read_json_state(r)?;
        self.pending = state.pending;
        self.emitted = state.emitted;
        Ok(())
    }
}

impl BinaryOperator for UnionOperator {
    fn process_left(&mut self, batch: Batch, _out: &dyn StreamObserver) -> SideOutcome {
        // Cannot emit without knowing the right side has caught up
        SideOutcome::Pending(batch)
    }

    fn process_right(&mut self, batch: Batch, _out: &dyn StreamObserver) -> SideOutcome {
        SideOutcome::Pending(batch)
    }

    fn process_both(
        &mut self,
        mut left: Batch,
        mut right: Batch,
        out: &dyn StreamObserver,
    ) -> (SideOutcome, SideOutcome) {
        self.merge_heads(&mut left, &mut right);
        if self.pending.len() >= self.emit_threshold {
            self.emit(out);
        }
        (Self::settle_side(left), Self::settle_side(right))
    }

    fn flush(&mut self, out: &dyn StreamObserver) {
        self.emit(out);
    }
}
