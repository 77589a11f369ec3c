//! Node lifecycle and the single-input pipe
//!
//! Every node in a running query graph consumes one or two input batch
//! streams and pushes results to exactly one downstream observer.
//! [`StreamObserver`] is the input surface upstream nodes push into;
//! [`Node`] is the shared lifecycle contract (identity, checkpoint,
//! restore, reset, dispose); [`UnaryPipe`] is the concrete single-input
//! node that concrete operators plug into via [`UnaryOperator`].

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::batch::Batch;
use crate::checkpoint::{checkpoint_state, restore_state, Checkpointable, NodeCore, NodeId};
use crate::error::RuntimeError;
use crate::plan::PlanNode;

/// Input surface of a node: the entry points an upstream pushes into.
///
/// `on_completed` must be called exactly once per logical input stream;
/// `on_error` may arrive at any time and short-circuits the remaining
/// lifecycle calls.
pub trait StreamObserver: Send + Sync {
    /// Deliver one batch.
    fn on_next(&self, batch: Batch);

    /// Ask the node to emit any retained partial output, then forward the
    /// flush downstream.
    fn on_flush(&self);

    /// Signal that this input stream has ended.
    fn on_completed(&self);

    /// Propagate an upstream failure.
    fn on_error(&self, error: Arc<RuntimeError>);

    /// Report the upstream plan node so this node can describe itself and
    /// pass the growing tree downstream.
    fn produce_plan(&self, upstream: PlanNode);
}

/// Shared lifecycle contract of every pipe, independent of arity.
///
/// Checkpoint and restore take `&self`: pipes are shared behind `Arc`
/// and guard their operator with the processing lock internally.
pub trait Node: Send + Sync {
    fn node_id(&self) -> NodeId;

    /// Lazily computed, cached schema fingerprint.
    fn schema_fingerprint(&self) -> u32;

    fn checkpoint(&self, w: &mut dyn Write) -> Result<(), RuntimeError>;

    fn restore(&self, r: &mut dyn Read) -> Result<(), RuntimeError>;

    /// Clear transient runtime state (including any half-finished
    /// checkpoint negotiation).
    fn reset(&self);

    /// Release operator-owned resources. Idempotent; safe to call from
    /// error paths that race with normal completion.
    fn dispose(&self);
}

/// Batch-processing logic plugged into a [`UnaryPipe`].
pub trait UnaryOperator: Checkpointable + Send {
    /// Process one batch. The operator owns the batch: it forwards it (or
    /// derived output) to `out`, or releases it.
    fn process(&mut self, batch: Batch, out: &dyn StreamObserver);

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

/// Single-input node: applies its operator to each arriving batch and
/// forwards results to the one downstream observer.
pub struct UnaryPipe<O: UnaryOperator> {
    core: NodeCore,
    operator: Mutex<O>,
    downstream: Arc<dyn StreamObserver>,
    completed: AtomicBool,
    disposed: AtomicBool,
}

impl<O: UnaryOperator + 'static> UnaryPipe<O> {
    pub fn new(operator: O, downstream: Arc<dyn StreamObserver>) -> Arc<Self> {
        Arc::new(Self {
            core: NodeCore::new(),
            operator: Mutex::new(operator),
            downstream,
            completed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        })
    }

    fn dispose_once(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            let mut op = self.operator.lock().unwrap_or_else(|e| e.into_inner());
            op.dispose();
            debug!(node_id = self.core.id(), "unary pipe disposed");
        }
    }
}

impl<O: UnaryOperator + 'static> StreamObserver for UnaryPipe<O> {
    fn on_next(&self, mut batch: Batch) {
        batch.reset_cursor();
        batch.refresh_count();
        if batch.is_empty() {
            batch.release();
            return;
        }
        let mut op = self.operator.lock().unwrap_or_else(|e| e.into_inner());
        op.process(batch, &*self.downstream);
    }

    fn on_flush(&self) {
        {
            let mut op = self.operator.lock().unwrap_or_else(|e| e.into_inner());
            op.flush(&*self.downstream);
        }
        self.downstream.on_flush();
    }

    fn on_completed(&self) {
        if self.completed.swap(true, Ordering::AcqRel) {
            warn!(node_id = self.core.id(), "duplicate completion ignored");
            return;
        }
        self.dispose_once();
        self.downstream.on_completed();
    }

    fn on_error(&self, error: Arc<RuntimeError>) {
        self.dispose_once();
        self.downstream.on_error(error);
    }

    fn produce_plan(&self, upstream: PlanNode) {
        let (operator, payload_type, key_type) = {
            let op = self.operator.lock().unwrap_or_else(|e| e.into_inner());
            (op.type_name(), op.payload_type(), op.key_type())
        };
        let node = PlanNode::unary(self.core.id(), operator, payload_type, key_type, upstream);
        self.downstream.produce_plan(node);
    }
}

impl<O: UnaryOperator + 'static> Node for UnaryPipe<O> {
    fn node_id(&self) -> NodeId {
        self.core.id()
    }

    fn schema_fingerprint(&self) -> u32 {
        let op = self.operator.lock().unwrap_or_else(|e| e.into_inner());
        self.core.fingerprint(&*op)
    }

    fn checkpoint(&self, w: &mut dyn Write) -> Result<(), RuntimeError> {
        let op = self.operator.lock().unwrap_or_else(|e| e.into_inner());
        checkpoint_state(self.core.fingerprint(&*op), &*op, w)
    }

    fn restore(&self, r: &mut dyn Read) -> Result<(), RuntimeError> {
        let mut op = self.operator.lock().unwrap_or_else(|e| e.into_inner());
        let fingerprint = self.core.fingerprint(&*op);
        restore_state(fingerprint, &mut *op, r)
    }

    fn reset(&self) {
        let mut op = self.operator.lock().unwrap_or_else(|e| e.into_inner());
        op.reset();
    }

    fn dispose(&self) {
        self.dispose_once();
    }
}
