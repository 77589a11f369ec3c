//! Rill runtime: pipe execution and synchronization engine
//!
//! The runtime moves [`Batch`]es of time-ordered [`Event`]s through a
//! tree of pipes. Single-input pipes ([`UnaryPipe`]) apply their operator
//! inline; dual-input pipes ([`BinaryPipe`]) buffer each side and drain
//! both through the operator under a try-lock so at most one thread runs
//! operator logic at a time. Every operator can checkpoint its state
//! behind a schema fingerprint, and every running graph can report a
//! read-only [`PlanNode`] tree for introspection.

pub mod batch;
pub mod binary;
pub mod checkpoint;
pub mod error;
pub mod event;
pub mod node;
pub mod operators;
pub mod plan;
pub mod sink;

pub use batch::{Batch, BatchPool};
pub use binary::{
    BinaryInput, BinaryOperator, BinaryPipe, CoordinationState, ProcessState, Side, SideOutcome,
};
pub use checkpoint::{schema_fingerprint, Checkpointable, NodeCore, NodeId};
pub use error::RuntimeError;
pub use event::{Event, FxIndexMap};
pub use node::{Node, StreamObserver, UnaryOperator, UnaryPipe};
pub use operators::{FilterOperator, UnionOperator};
pub use plan::{PlanNode, PlanNodeKind};
pub use sink::{CollectingSink, NullSink};

pub use rill_core::Value;
