//! Dual-input synchronization engine
//!
//! A [`BinaryPipe`] merges two independently-arriving, already
//! time-ordered batch streams into a single time-ordered processing
//! sequence. Each side buffers arriving batches in its own thread-safe
//! FIFO; a drain loop guarded by a try-lock feeds them to the operator's
//! three processing hooks (left alone, right alone, both together) with
//! at most one thread inside operator logic at a time.
//!
//! Core invariant: whenever no thread holds the processing lock, at
//! least one of the two side buffers is empty. Both start empty, and the
//! drain loop never stops while both are non-empty, so the property holds
//! inductively.
//!
//! A producer that fails the try-lock simply returns: its enqueue
//! happened before the lock attempt, so the thread holding the lock is
//! guaranteed to observe the new batch before releasing.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, TryLockError};

use tracing::{debug, trace, warn};

use crate::batch::Batch;
use crate::checkpoint::{checkpoint_state, restore_state, Checkpointable, NodeCore, NodeId};
use crate::error::RuntimeError;
use crate::node::{Node, StreamObserver};
use crate::plan::{BinarySideStats, PlanNode};

/// One of the two inputs of a dual-input node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Left => write!(f, "left"),
            Side::Right => write!(f, "right"),
        }
    }
}

/// What the node is waiting on before it can safely advance time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Both buffers were empty the last time anyone checked.
    WaitingForAny,
    /// Left is empty; right holds a batch that cannot advance until left
    /// proves time has moved past it.
    WaitingForLeft,
    /// Right is empty; left holds a batch waiting on right.
    WaitingForRight,
    /// Exactly one thread is draining. Never observable once the
    /// processing lock is released.
    Processing,
}

/// Per-side report from a processing hook.
///
/// Ownership encodes the protocol: a pending batch comes back to the
/// engine for re-queueing, a finished batch is handed back for release,
/// and a retained batch stays with the operator.
pub enum SideOutcome {
    /// Not fully consumed; the engine re-queues it at the head and stalls
    /// this side.
    Pending(Batch),
    /// Fully consumed; the engine releases it to its pool.
    Finished(Batch),
    /// Fully consumed and kept by the operator for later reuse.
    Retained,
}

impl SideOutcome {
    pub fn is_done(&self) -> bool {
        !matches!(self, SideOutcome::Pending(_))
    }
}

/// Batch-processing logic plugged into a [`BinaryPipe`].
///
/// Hooks are only ever invoked by one thread at a time, in an order
/// consistent with non-decreasing event time across both sides combined.
/// `process_both` must finish at least one of the two batches; returning
/// both sides pending is a contract violation (the engine logs it and
/// stalls rather than spin).
pub trait BinaryOperator: Checkpointable + Send {
    /// Process a left batch with no right batch available.
    fn process_left(&mut self, batch: Batch, out: &dyn StreamObserver) -> SideOutcome;

    /// Process a right batch with no left batch available.
    fn process_right(&mut self, batch: Batch, out: &dyn StreamObserver) -> SideOutcome;

    /// Process the heads of both buffers together.
    fn process_both(
        &mut self,
        left: Batch,
        right: Batch,
        out: &dyn StreamObserver,
    ) -> (SideOutcome, SideOutcome);

    /// Emit any retained partial output.
    fn flush(&mut self, _out: &dyn StreamObserver) {}

    /// Release operator-owned resources.
    fn dispose(&mut self) {}

    fn payload_type(&self) -> &'static str {
        "event"
    }

    fn key_type(&self) -> &'static str {
        "str"
    }
}

/// Which side, if any, has an in-flight checkpoint or restore round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinationState {
    Open,
    CheckpointingLeft,
    CheckpointingRight,
    RestoringLeft,
    RestoringRight,
}

/// Unbounded thread-safe FIFO of batches for one side.
///
/// The event counter is a shared atomic so plan introspection can read
/// buffered totals without touching any lock.
struct SideBuffer {
    queue: Mutex<VecDeque<Batch>>,
    events: Arc<AtomicUsize>,
}

impl SideBuffer {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            events: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn push_back(&self, batch: Batch) {
        let added = batch.remaining();
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(batch);
        self.events.fetch_add(added, Ordering::Relaxed);
    }

    fn push_front(&self, batch: Batch) {
        let added = batch.remaining();
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_front(batch);
        self.events.fetch_add(added, Ordering::Relaxed);
    }

    fn pop_front(&self) -> Option<Batch> {
        let batch = self
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()?;
        self.events.fetch_sub(batch.remaining(), Ordering::Relaxed);
        Some(batch)
    }

    /// Authoritative emptiness check (synchronizes with producers).
    fn is_empty(&self) -> bool {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    /// Lock-free buffered-event count for diagnostics. May be stale.
    fn buffered_events(&self) -> usize {
        self.events.load(Ordering::Relaxed)
    }

    /// Release every buffered batch. Defensive: must not panic.
    fn clear_release(&self) -> usize {
        let mut drained = 0;
        while let Some(batch) = self.pop_front() {
            batch.release();
            drained += 1;
        }
        drained
    }
}

/// Operator plus process state, guarded together by the processing lock.
struct ProcessCore<O> {
    operator: O,
    state: ProcessState,
}

#[derive(Default)]
struct PlanSlots {
    left: Option<PlanNode>,
    right: Option<PlanNode>,
}

/// Value of the completion counter once the node is finished, whether by
/// two per-side completions or by an error marking both sides done.
const BOTH_COMPLETED: usize = 2;

/// Dual-input node: buffers per side and drains both buffers through the
/// operator whenever it is safe to advance time.
pub struct BinaryPipe<O: BinaryOperator> {
    core: NodeCore,
    process: Mutex<ProcessCore<O>>,
    left: SideBuffer,
    right: SideBuffer,
    downstream: Arc<dyn StreamObserver>,
    completions: AtomicUsize,
    disposed: AtomicBool,
    /// Short-held bookkeeping lock for cross-side error coordination;
    /// never held across operator logic or the processing lock.
    error_gate: Mutex<()>,
    coordination: Mutex<CoordinationState>,
    plan_slots: Mutex<PlanSlots>,
}

impl<O: BinaryOperator + 'static> BinaryPipe<O> {
    pub fn new(operator: O, downstream: Arc<dyn StreamObserver>) -> Arc<Self> {
        Arc::new(Self {
            core: NodeCore::new(),
            process: Mutex::new(ProcessCore {
                operator,
                state: ProcessState::WaitingForAny,
            }),
            left: SideBuffer::new(),
            right: SideBuffer::new(),
            downstream,
            completions: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
            error_gate: Mutex::new(()),
            coordination: Mutex::new(CoordinationState::Open),
            plan_slots: Mutex::new(PlanSlots::default()),
        })
    }

    /// Observer endpoint upstream pushes left-side traffic into.
    pub fn left_input(self: &Arc<Self>) -> Arc<BinaryInput<O>> {
        Arc::new(BinaryInput {
            pipe: Arc::clone(self),
            side: Side::Left,
        })
    }

    /// Observer endpoint upstream pushes right-side traffic into.
    pub fn right_input(self: &Arc<Self>) -> Arc<BinaryInput<O>> {
        Arc::new(BinaryInput {
            pipe: Arc::clone(self),
            side: Side::Right,
        })
    }

    fn buffer(&self, side: Side) -> &SideBuffer {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    /// Whether a side currently holds any buffered batches. Lock-free.
    pub fn has_buffered_state(&self, side: Side) -> bool {
        self.buffer(side).buffered_events() > 0
    }

    /// Total buffered events on a side. Lock-free, may be stale.
    pub fn buffered_event_count(&self, side: Side) -> usize {
        self.buffer(side).buffered_events()
    }

    /// Current process state. Takes the processing lock; diagnostics and
    /// tests only.
    pub fn process_state(&self) -> ProcessState {
        self.process
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .state
    }

    fn on_input(&self, side: Side, mut batch: Batch) {
        if self.completions.load(Ordering::Acquire) >= BOTH_COMPLETED {
            warn!(
                node_id = self.core.id(),
                %side,
                "batch arrived after completion; releasing"
            );
            batch.release();
            return;
        }
        batch.reset_cursor();
        batch.refresh_count();
        if batch.is_empty() {
            batch.release();
            return;
        }
        trace!(
            node_id = self.core.id(),
            %side,
            events = batch.len(),
            "batch enqueued"
        );
        self.buffer(side).push_back(batch);
        self.try_drain();
    }

    /// Non-reentrant drain attempt. A thread that fails the try-lock
    /// returns immediately; its enqueue happened before the attempt, so
    /// the lock holder observes the batch before releasing.
    fn try_drain(&self) {
        match self.process.try_lock() {
            Ok(mut core) => self.run_drain(&mut core),
            Err(TryLockError::Poisoned(poisoned)) => {
                let mut core = poisoned.into_inner();
                self.run_drain(&mut core);
            }
            Err(TryLockError::WouldBlock) => {}
        }
    }

    fn run_drain(&self, core: &mut ProcessCore<O>) {
        loop {
            let eligible = match core.state {
                ProcessState::WaitingForAny => !self.left.is_empty() || !self.right.is_empty(),
                ProcessState::WaitingForLeft => !self.left.is_empty(),
                ProcessState::WaitingForRight => !self.right.is_empty(),
                // State is never left at Processing across a lock
                // release; a fresh pass may always run.
                ProcessState::Processing => true,
            };
            if !eligible {
                return;
            }
            core.state = ProcessState::Processing;
            loop {
                match (self.left.pop_front(), self.right.pop_front()) {
                    (Some(left), Some(right)) => {
                        let (left_outcome, right_outcome) =
                            core.operator.process_both(left, right, &*self.downstream);
                        let left_done = left_outcome.is_done();
                        let right_done = right_outcome.is_done();
                        self.settle(Side::Left, left_outcome);
                        self.settle(Side::Right, right_outcome);
                        if !left_done && !right_done {
                            warn!(
                                node_id = self.core.id(),
                                "process_both finished neither side; stalling"
                            );
                            core.state = ProcessState::WaitingForAny;
                            return;
                        }
                    }
                    (Some(left), None) => {
                        let outcome = core.operator.process_left(left, &*self.downstream);
                        let done = outcome.is_done();
                        self.settle(Side::Left, outcome);
                        if !done {
                            // Left cannot advance until right proves time
                            // has moved past it.
                            core.state = ProcessState::WaitingForRight;
                            break;
                        }
                    }
                    (None, Some(right)) => {
                        let outcome = core.operator.process_right(right, &*self.downstream);
                        let done = outcome.is_done();
                        self.settle(Side::Right, outcome);
                        if !done {
                            core.state = ProcessState::WaitingForLeft;
                            break;
                        }
                    }
                    (None, None) => {
                        core.state = ProcessState::WaitingForAny;
                        break;
                    }
                }
            }
            // Re-check eligibility: new batches may have arrived while
            // the lock was held.
        }
    }

    fn settle(&self, side: Side, outcome: SideOutcome) {
        match outcome {
            SideOutcome::Pending(batch) => self.buffer(side).push_front(batch),
            SideOutcome::Finished(batch) => batch.release(),
            SideOutcome::Retained => {}
        }
    }

    fn on_flush(&self) {
        {
            let mut core = self.process.lock().unwrap_or_else(|e| e.into_inner());
            core.operator.flush(&*self.downstream);
        }
        self.downstream.on_flush();
    }

    fn on_side_completed(&self) {
        let prev = self.completions.fetch_add(1, Ordering::AcqRel);
        match prev {
            0 => {
                // First side done; keep draining on behalf of the other.
            }
            1 => {
                // Final drain covers a completing thread whose own drain
                // attempt was pre-empted by the try-lock. One extra,
                // safe, no-op pass is possible and deliberate.
                {
                    let mut core = self.process.lock().unwrap_or_else(|e| e.into_inner());
                    self.run_drain(&mut core);
                }
                self.release_buffers();
                self.dispose_once();
                self.downstream.on_completed();
            }
            _ => {
                warn!(node_id = self.core.id(), "spurious completion ignored");
            }
        }
    }

    fn on_upstream_error(&self, error: Arc<RuntimeError>) {
        let first = {
            let _gate = self.error_gate.lock().unwrap_or_else(|e| e.into_inner());
            // Mark both sides completed so the other side's error or
            // completion is suppressed.
            self.completions.swap(BOTH_COMPLETED, Ordering::AcqRel) < BOTH_COMPLETED
        };
        if !first {
            debug!(node_id = self.core.id(), "duplicate upstream error suppressed");
            return;
        }
        self.release_buffers();
        self.dispose_once();
        // A drain that was mid-hook when the error arrived may have
        // re-queued a pending batch after the sweep above. dispose_once
        // has since synchronized with the processing lock, so no further
        // re-queue is possible; sweep once more.
        self.release_buffers();
        self.downstream.on_error(error);
    }

    fn release_buffers(&self) {
        let drained = self.left.clear_release() + self.right.clear_release();
        if drained > 0 {
            debug!(
                node_id = self.core.id(),
                batches = drained,
                "released batches left unconsumed at shutdown"
            );
        }
    }

    fn dispose_once(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            let mut core = self.process.lock().unwrap_or_else(|e| e.into_inner());
            core.operator.dispose();
            debug!(node_id = self.core.id(), "binary pipe disposed");
        }
    }

    /// One side's half of a checkpoint round. The first arrival performs
    /// the I/O; the matching arrival from the other side resets the round.
    ///
    /// Lock order is always coordination then processing, so holding the
    /// coordination guard across the I/O cannot deadlock.
    pub fn checkpoint_from(&self, side: Side, w: &mut dyn Write) -> Result<(), RuntimeError> {
        let mut st = self.coordination.lock().unwrap_or_else(|e| e.into_inner());
        match (*st, side) {
            (CoordinationState::Open, Side::Left) => *st = CoordinationState::CheckpointingLeft,
            (CoordinationState::Open, Side::Right) => *st = CoordinationState::CheckpointingRight,
            (CoordinationState::CheckpointingLeft, Side::Right)
            | (CoordinationState::CheckpointingRight, Side::Left) => {
                *st = CoordinationState::Open;
                return Ok(());
            }
            (state, side) => {
                return Err(RuntimeError::ProtocolViolation(format!(
                    "checkpoint request from {} side in coordination state {:?}",
                    side, state
                )));
            }
        }
        let result = self.checkpoint_inner(w);
        if result.is_err() {
            // Reset so a retried checkpoint is not permanently wedged.
            *st = CoordinationState::Open;
        }
        result
    }

    /// One side's half of a restore round; symmetric to
    /// [`checkpoint_from`](Self::checkpoint_from).
    pub fn restore_from(&self, side: Side, r: &mut dyn Read) -> Result<(), RuntimeError> {
        let mut st = self.coordination.lock().unwrap_or_else(|e| e.into_inner());
        match (*st, side) {
            (CoordinationState::Open, Side::Left) => *st = CoordinationState::RestoringLeft,
            (CoordinationState::Open, Side::Right) => *st = CoordinationState::RestoringRight,
            (CoordinationState::RestoringLeft, Side::Right)
            | (CoordinationState::RestoringRight, Side::Left) => {
                *st = CoordinationState::Open;
                return Ok(());
            }
            (state, side) => {
                return Err(RuntimeError::ProtocolViolation(format!(
                    "restore request from {} side in coordination state {:?}",
                    side, state
                )));
            }
        }
        let result = self.restore_inner(r);
        if result.is_err() {
            *st = CoordinationState::Open;
        }
        result
    }

    /// Current coordination state; diagnostics and tests only.
    pub fn coordination_state(&self) -> CoordinationState {
        *self.coordination.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn checkpoint_inner(&self, w: &mut dyn Write) -> Result<(), RuntimeError> {
        let core = self.process.lock().unwrap_or_else(|e| e.into_inner());
        checkpoint_state(self.core.fingerprint(&core.operator), &core.operator, w)
    }

    fn restore_inner(&self, r: &mut dyn Read) -> Result<(), RuntimeError> {
        let mut core = self.process.lock().unwrap_or_else(|e| e.into_inner());
        let fingerprint = self.core.fingerprint(&core.operator);
        restore_state(fingerprint, &mut core.operator, r)
    }

    fn produce_plan_from(&self, side: Side, upstream: PlanNode) -> Result<(), RuntimeError> {
        let pair = {
            let mut slots = self.plan_slots.lock().unwrap_or_else(|e| e.into_inner());
            let slot = match side {
                Side::Left => &mut slots.left,
                Side::Right => &mut slots.right,
            };
            if slot.is_some() {
                return Err(RuntimeError::ProtocolViolation(format!(
                    "{} side reported its plan twice without a matching report",
                    side
                )));
            }
            *slot = Some(upstream);
            match (slots.left.take(), slots.right.take()) {
                (Some(left), Some(right)) => Some((left, right)),
                (left, right) => {
                    slots.left = left;
                    slots.right = right;
                    None
                }
            }
        };
        if let Some((left, right)) = pair {
            let (operator, payload_type, key_type) = {
                let core = self.process.lock().unwrap_or_else(|e| e.into_inner());
                (
                    core.operator.type_name(),
                    core.operator.payload_type(),
                    core.operator.key_type(),
                )
            };
            let stats = BinarySideStats::new(
                Arc::clone(&self.left.events),
                Arc::clone(&self.right.events),
            );
            let node = PlanNode::binary(
                self.core.id(),
                operator,
                payload_type,
                key_type,
                left,
                right,
                stats,
            );
            self.downstream.produce_plan(node);
        }
        Ok(())
    }
}

impl<O: BinaryOperator + 'static> Node for BinaryPipe<O> {
    fn node_id(&self) -> NodeId {
        self.core.id()
    }

    fn schema_fingerprint(&self) -> u32 {
        let core = self.process.lock().unwrap_or_else(|e| e.into_inner());
        self.core.fingerprint(&core.operator)
    }

    fn checkpoint(&self, w: &mut dyn Write) -> Result<(), RuntimeError> {
        self.checkpoint_inner(w)
    }

    fn restore(&self, r: &mut dyn Read) -> Result<(), RuntimeError> {
        self.restore_inner(r)
    }

    fn reset(&self) {
        *self.coordination.lock().unwrap_or_else(|e| e.into_inner()) = CoordinationState::Open;
        let mut core = self.process.lock().unwrap_or_else(|e| e.into_inner());
        core.operator.reset();
    }

    fn dispose(&self) {
        self.dispose_once();
    }
}

/// Forwarding wrapper delivering one side's traffic into the pipe.
pub struct BinaryInput<O: BinaryOperator + 'static> {
    pipe: Arc<BinaryPipe<O>>,
    side: Side,
}

impl<O: BinaryOperator + 'static> BinaryInput<O> {
    pub fn side(&self) -> Side {
        self.side
    }

    /// Deliver this side's half of a checkpoint round.
    pub fn checkpoint(&self, w: &mut dyn Write) -> Result<(), RuntimeError> {
        self.pipe.checkpoint_from(self.side, w)
    }

    /// Deliver this side's half of a restore round.
    pub fn restore(&self, r: &mut dyn Read) -> Result<(), RuntimeError> {
        self.pipe.restore_from(self.side, r)
    }
}

impl<O: BinaryOperator + 'static> StreamObserver for BinaryInput<O> {
    fn on_next(&self, batch: Batch) {
        self.pipe.on_input(self.side, batch);
    }

    fn on_flush(&self) {
        self.pipe.on_flush();
    }

    fn on_completed(&self) {
        self.pipe.on_side_completed();
    }

    fn on_error(&self, error: Arc<RuntimeError>) {
        self.pipe.on_upstream_error(error);
    }

    fn produce_plan(&self, upstream: PlanNode) {
        if let Err(e) = self.pipe.produce_plan_from(self.side, upstream) {
            warn!(node_id = self.pipe.core.id(), %e, "plan report rejected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchPool;
    use crate::checkpoint::{read_json_state, write_json_state};
    use crate::event::Event;
    use crate::sink::CollectingSink;
    use chrono::{Duration, Utc};

    #[derive(Default)]
    struct HookLog {
        left: AtomicUsize,
        right: AtomicUsize,
        both: AtomicUsize,
        flushes: AtomicUsize,
        disposals: AtomicUsize,
    }

    /// Scripted operator: single-sided batches stall, two-sided calls
    /// consume both batches outright.
    struct StallThenMerge {
        log: Arc<HookLog>,
        seen: u64,
    }

    impl StallThenMerge {
        fn new(log: Arc<HookLog>) -> Self {
            Self { log, seen: 0 }
        }
    }

    impl Checkpointable for StallThenMerge {
        fn type_name(&self) -> &'static str {
            "StallThenMerge"
        }

        fn write_state(&self, w: &mut dyn Write) -> Result<(), RuntimeError> {
            write_json_state(w, &self.seen)
        }

        fn read_state(&mut self, r: &mut dyn Read) -> Result<(), RuntimeError> {
            self.seen = read_json_state(r)?;
            Ok(())
        }
    }

    impl BinaryOperator for StallThenMerge {
        fn process_left(&mut self, batch: Batch, _out: &dyn StreamObserver) -> SideOutcome {
            self.log.left.fetch_add(1, Ordering::SeqCst);
            SideOutcome::Pending(batch)
        }

        fn process_right(&mut self, batch: Batch, _out: &dyn StreamObserver) -> SideOutcome {
            self.log.right.fetch_add(1, Ordering::SeqCst);
            SideOutcome::Pending(batch)
        }

        fn process_both(
            &mut self,
            left: Batch,
            right: Batch,
            _out: &dyn StreamObserver,
        ) -> (SideOutcome, SideOutcome) {
            self.log.both.fetch_add(1, Ordering::SeqCst);
            self.seen += (left.remaining() + right.remaining()) as u64;
            (SideOutcome::Finished(left), SideOutcome::Finished(right))
        }

        fn flush(&mut self, _out: &dyn StreamObserver) {
            self.log.flushes.fetch_add(1, Ordering::SeqCst);
        }

        fn dispose(&mut self) {
            self.log.disposals.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn batch_at(pool: &Arc<BatchPool>, key: &str, offsets: &[i64]) -> Batch {
        let base = Utc::now();
        pool.lease(
            key,
            offsets
                .iter()
                .map(|&s| Event::at("Tick", base + Duration::seconds(s))),
        )
    }

    fn make_pipe() -> (
        Arc<BinaryPipe<StallThenMerge>>,
        Arc<HookLog>,
        Arc<CollectingSink>,
    ) {
        let log = Arc::new(HookLog::default());
        let sink = CollectingSink::shared();
        let pipe = BinaryPipe::new(StallThenMerge::new(Arc::clone(&log)), sink.clone());
        (pipe, log, sink)
    }

    #[test]
    fn test_left_alone_stalls_then_both_drain() {
        let pool = BatchPool::new();
        let (pipe, log, _sink) = make_pipe();

        // Left delivers [0,10); nothing on the right yet
        pipe.left_input().on_next(batch_at(&pool, "k", &[0, 4, 9]));
        assert_eq!(log.left.load(Ordering::SeqCst), 1);
        assert_eq!(pipe.process_state(), ProcessState::WaitingForRight);
        assert!(pipe.has_buffered_state(Side::Left));
        assert!(!pipe.has_buffered_state(Side::Right));

        // Right delivers [5,15): the two-sided hook fires with both heads
        pipe.right_input().on_next(batch_at(&pool, "k", &[5, 14]));
        assert_eq!(log.both.load(Ordering::SeqCst), 1);
        assert_eq!(pipe.process_state(), ProcessState::WaitingForAny);

        // Both batches were reported done and released
        assert_eq!(pool.outstanding(), 0);
        assert!(!pipe.has_buffered_state(Side::Left));
        assert!(!pipe.has_buffered_state(Side::Right));
    }

    /// Operator that consumes left batches whole and keeps them for
    /// later reuse instead of handing them back.
    struct KeepLeft {
        kept: Option<Batch>,
    }

    impl Checkpointable for KeepLeft {
        fn type_name(&self) -> &'static str {
            "KeepLeft"
        }

        fn write_state(&self, w: &mut dyn Write) -> Result<(), RuntimeError> {
            write_json_state(w, &())
        }

        fn read_state(&mut self, r: &mut dyn Read) -> Result<(), RuntimeError> {
            read_json_state::<()>(r)
        }
    }

    impl BinaryOperator for KeepLeft {
        fn process_left(&mut self, batch: Batch, _out: &dyn StreamObserver) -> SideOutcome {
            self.kept = Some(batch);
            SideOutcome::Retained
        }

        fn process_right(&mut self, batch: Batch, _out: &dyn StreamObserver) -> SideOutcome {
            SideOutcome::Finished(batch)
        }

        fn process_both(
            &mut self,
            left: Batch,
            right: Batch,
            _out: &dyn StreamObserver,
        ) -> (SideOutcome, SideOutcome) {
            (SideOutcome::Finished(left), SideOutcome::Finished(right))
        }

        fn dispose(&mut self) {
            if let Some(batch) = self.kept.take() {
                batch.release();
            }
        }
    }

    #[test]
    fn test_retained_batch_stays_with_operator() {
        let pool = BatchPool::new();
        let sink = CollectingSink::shared();
        let pipe = BinaryPipe::new(KeepLeft { kept: None }, sink.clone());

        pipe.left_input().on_next(batch_at(&pool, "k", &[0, 1]));

        // Retained counts as done: the buffer is empty, the engine did
        // not release, and the operator now owns the lease
        assert!(!pipe.has_buffered_state(Side::Left));
        assert_eq!(pipe.process_state(), ProcessState::WaitingForAny);
        assert_eq!(pool.outstanding(), 1);
        {
            let core = pipe.process.lock().unwrap();
            assert!(core.operator.kept.is_some());
        }

        // Disposal releases the retained batch exactly once
        pipe.left_input().on_completed();
        pipe.right_input().on_completed();
        assert_eq!(sink.completions(), 1);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_empty_batch_released_without_buffering() {
        let pool = BatchPool::new();
        let (pipe, log, _sink) = make_pipe();

        pipe.left_input().on_next(pool.lease("k", Vec::<Event>::new()));

        assert_eq!(pool.outstanding(), 0);
        assert_eq!(log.left.load(Ordering::SeqCst), 0);
        assert_eq!(pipe.process_state(), ProcessState::WaitingForAny);
    }

    #[test]
    fn test_buffer_invariant_one_side_always_empty() {
        let pool = BatchPool::new();
        let (pipe, _log, _sink) = make_pipe();

        for i in 0..10 {
            if i % 2 == 0 {
                pipe.left_input().on_next(batch_at(&pool, "k", &[i]));
            } else {
                pipe.right_input().on_next(batch_at(&pool, "k", &[i]));
            }
            // No thread is processing between pushes; at least one
            // buffer must be empty.
            assert!(
                !pipe.has_buffered_state(Side::Left) || !pipe.has_buffered_state(Side::Right),
                "both buffers non-empty while idle"
            );
        }
    }

    #[test]
    fn test_completion_releases_leftovers_and_disposes_once() {
        let pool = BatchPool::new();
        let (pipe, log, sink) = make_pipe();

        // Left batch stalls waiting on right, then both sides complete
        pipe.left_input().on_next(batch_at(&pool, "k", &[0, 1]));
        assert_eq!(pool.outstanding(), 1);

        pipe.left_input().on_completed();
        assert_eq!(sink.completions(), 0);

        pipe.right_input().on_completed();
        assert_eq!(sink.completions(), 1);
        assert_eq!(log.disposals.load(Ordering::SeqCst), 1);
        assert_eq!(pool.outstanding(), 0, "leftover batch leaked");

        // Spurious third completion is ignored
        pipe.left_input().on_completed();
        assert_eq!(sink.completions(), 1);
        assert_eq!(log.disposals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_batch_after_completion_released() {
        let pool = BatchPool::new();
        let (pipe, log, _sink) = make_pipe();

        pipe.left_input().on_completed();
        pipe.right_input().on_completed();

        pipe.left_input().on_next(batch_at(&pool, "k", &[0]));
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(log.left.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_error_forwarded_once_and_buffers_cleared() {
        let pool = BatchPool::new();
        let (pipe, log, sink) = make_pipe();

        pipe.right_input().on_next(batch_at(&pool, "k", &[3]));
        assert_eq!(pool.outstanding(), 1);

        let error = Arc::new(RuntimeError::Upstream("left source failed".into()));
        pipe.left_input().on_error(Arc::clone(&error));
        assert_eq!(sink.errors(), 1);
        assert_eq!(log.disposals.load(Ordering::SeqCst), 1);
        assert_eq!(pool.outstanding(), 0);

        // The other side erroring afterwards is suppressed
        pipe.right_input()
            .on_error(Arc::new(RuntimeError::Upstream("right too".into())));
        assert_eq!(sink.errors(), 1);

        // So is a straggling completion
        pipe.right_input().on_completed();
        assert_eq!(sink.completions(), 0);
    }

    #[test]
    fn test_error_after_completion_suppressed() {
        let (pipe, _log, sink) = make_pipe();

        pipe.left_input().on_completed();
        pipe.right_input().on_completed();
        assert_eq!(sink.completions(), 1);

        pipe.left_input()
            .on_error(Arc::new(RuntimeError::Upstream("late".into())));
        assert_eq!(sink.errors(), 0);
    }

    #[test]
    fn test_flush_runs_operator_then_forwards() {
        let (pipe, log, sink) = make_pipe();

        pipe.left_input().on_flush();
        assert_eq!(log.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(sink.flushes(), 1);
    }

    #[test]
    fn test_dual_checkpoint_coordination_either_order() {
        let (pipe, _log, _sink) = make_pipe();

        // Left initiates, right matches
        let mut image = Vec::new();
        pipe.left_input().checkpoint(&mut image).unwrap();
        assert_eq!(pipe.coordination_state(), CoordinationState::CheckpointingLeft);
        let written = image.len();
        pipe.right_input().checkpoint(&mut image).unwrap();
        assert_eq!(pipe.coordination_state(), CoordinationState::Open);
        assert_eq!(image.len(), written, "matching call must not write again");

        // Right initiates, left matches
        let mut image2 = Vec::new();
        pipe.right_input().checkpoint(&mut image2).unwrap();
        pipe.left_input().checkpoint(&mut image2).unwrap();
        assert_eq!(image2.len(), written);
    }

    #[test]
    fn test_same_side_checkpoint_twice_is_violation() {
        let (pipe, _log, _sink) = make_pipe();

        let mut image = Vec::new();
        pipe.left_input().checkpoint(&mut image).unwrap();
        let err = pipe.left_input().checkpoint(&mut image).unwrap_err();
        assert!(matches!(err, RuntimeError::ProtocolViolation(_)));
    }

    #[test]
    fn test_restore_during_checkpoint_is_violation() {
        let (pipe, _log, _sink) = make_pipe();

        let mut image = Vec::new();
        pipe.left_input().checkpoint(&mut image).unwrap();
        let err = pipe.right_input().restore(&mut image.as_slice()).unwrap_err();
        assert!(matches!(err, RuntimeError::ProtocolViolation(_)));
    }

    #[test]
    fn test_dual_restore_round_trip() {
        let pool = BatchPool::new();
        let (pipe, _log, _sink) = make_pipe();

        // Accumulate some state, checkpoint it from both sides
        pipe.left_input().on_next(batch_at(&pool, "k", &[0]));
        pipe.right_input().on_next(batch_at(&pool, "k", &[1]));
        let mut image = Vec::new();
        pipe.left_input().checkpoint(&mut image).unwrap();
        pipe.right_input().checkpoint(&mut image).unwrap();

        // Restore into a fresh pipe of the same shape
        let (fresh, _log2, _sink2) = make_pipe();
        fresh.left_input().restore(&mut image.as_slice()).unwrap();
        fresh.right_input().restore(&mut image.as_slice()).unwrap();
        assert_eq!(fresh.coordination_state(), CoordinationState::Open);

        let mut reimage = Vec::new();
        fresh.checkpoint(&mut reimage).unwrap();
        assert_eq!(image, reimage);
    }

    #[test]
    fn test_failed_restore_resets_coordination() {
        let (pipe, _log, _sink) = make_pipe();

        // Short stream: restore fails, coordination must reopen
        let err = pipe
            .left_input()
            .restore(&mut [0u8, 1u8].as_slice())
            .unwrap_err();
        assert!(matches!(err, RuntimeError::CorruptCheckpoint(_)));
        assert_eq!(pipe.coordination_state(), CoordinationState::Open);

        // A full round still works afterwards
        let mut image = Vec::new();
        pipe.left_input().checkpoint(&mut image).unwrap();
        pipe.right_input().checkpoint(&mut image).unwrap();
    }

    #[test]
    fn test_reset_reopens_coordination() {
        let (pipe, _log, _sink) = make_pipe();

        let mut image = Vec::new();
        pipe.left_input().checkpoint(&mut image).unwrap();
        assert_ne!(pipe.coordination_state(), CoordinationState::Open);

        pipe.reset();
        assert_eq!(pipe.coordination_state(), CoordinationState::Open);
    }

    #[test]
    fn test_plan_pairing_in_either_order() {
        let (pipe, _log, sink) = make_pipe();

        pipe.produce_plan_from(Side::Right, PlanNode::source("b")).unwrap();
        assert!(sink.plan().is_none(), "plan must wait for both sides");
        pipe.produce_plan_from(Side::Left, PlanNode::source("a")).unwrap();

        let plan = sink.plan().expect("binary plan node produced");
        assert_eq!(plan.operator(), "StallThenMerge");
        assert_eq!(plan.upstream().len(), 2);
        assert_eq!(plan.upstream()[0].operator(), "a");
        assert_eq!(plan.upstream()[1].operator(), "b");
    }

    #[test]
    fn test_plan_same_side_twice_is_violation() {
        let (pipe, _log, _sink) = make_pipe();

        pipe.produce_plan_from(Side::Left, PlanNode::source("a")).unwrap();
        let err = pipe
            .produce_plan_from(Side::Left, PlanNode::source("a2"))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ProtocolViolation(_)));
    }

    #[test]
    fn test_plan_exposes_live_buffer_counts() {
        let pool = BatchPool::new();
        let (pipe, _log, sink) = make_pipe();

        pipe.produce_plan_from(Side::Left, PlanNode::source("a")).unwrap();
        pipe.produce_plan_from(Side::Right, PlanNode::source("b")).unwrap();
        let plan = sink.plan().unwrap();
        assert_eq!(plan.left_buffered_events(), 0);

        // Stalled left batch shows up in the plan without any lock
        pipe.left_input().on_next(batch_at(&pool, "k", &[0, 1, 2]));
        assert_eq!(plan.left_buffered_events(), 3);
        assert!(plan.has_left_state());
        assert!(!plan.has_right_state());
    }
}
