//! Query plan introspection tree
//!
//! A read-only mirror of the running dataflow graph, built as each node
//! reports its upstream plan node(s) downstream. Structure is fixed once
//! a query is running; the only live data are the per-side buffered-event
//! counters, which are shared atomics read without any lock so that
//! diagnostics can never stall the hot path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::checkpoint::{next_node_id, NodeId};

/// Kind of node a plan entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanNodeKind {
    /// External input feeding the graph.
    Source,
    /// Single-input pipe.
    Unary,
    /// Dual-input pipe.
    Binary,
}

/// Live buffering statistics for a dual-input node, shared with the
/// owning pipe's side buffers.
#[derive(Clone)]
pub struct BinarySideStats {
    left_events: Arc<AtomicUsize>,
    right_events: Arc<AtomicUsize>,
}

impl BinarySideStats {
    pub(crate) fn new(left_events: Arc<AtomicUsize>, right_events: Arc<AtomicUsize>) -> Self {
        Self {
            left_events,
            right_events,
        }
    }

    pub fn left_buffered_events(&self) -> usize {
        self.left_events.load(Ordering::Relaxed)
    }

    pub fn right_buffered_events(&self) -> usize {
        self.right_events.load(Ordering::Relaxed)
    }
}

struct PlanNodeInner {
    node_id: NodeId,
    kind: PlanNodeKind,
    operator: String,
    payload_type: &'static str,
    key_type: &'static str,
    upstream: SmallVec<[PlanNode; 2]>,
    stats: Option<BinarySideStats>,
}

/// One node of the introspection tree. Cheap to clone.
#[derive(Clone)]
pub struct PlanNode {
    inner: Arc<PlanNodeInner>,
}

impl PlanNode {
    /// Plan entry for an external source feeding the graph.
    pub fn source(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(PlanNodeInner {
                node_id: next_node_id(),
                kind: PlanNodeKind::Source,
                operator: name.into(),
                payload_type: "event",
                key_type: "str",
                upstream: SmallVec::new(),
                stats: None,
            }),
        }
    }

    pub(crate) fn unary(
        node_id: NodeId,
        operator: impl Into<String>,
        payload_type: &'static str,
        key_type: &'static str,
        upstream: PlanNode,
    ) -> Self {
        let mut links = SmallVec::new();
        links.push(upstream);
        Self {
            inner: Arc::new(PlanNodeInner {
                node_id,
                kind: PlanNodeKind::Unary,
                operator: operator.into(),
                payload_type,
                key_type,
                upstream: links,
                stats: None,
            }),
        }
    }

    pub(crate) fn binary(
        node_id: NodeId,
        operator: impl Into<String>,
        payload_type: &'static str,
        key_type: &'static str,
        left: PlanNode,
        right: PlanNode,
        stats: BinarySideStats,
    ) -> Self {
        let mut links = SmallVec::new();
        links.push(left);
        links.push(right);
        Self {
            inner: Arc::new(PlanNodeInner {
                node_id,
                kind: PlanNodeKind::Binary,
                operator: operator.into(),
                payload_type,
                key_type,
                upstream: links,
                stats: Some(stats),
            }),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    pub fn kind(&self) -> PlanNodeKind {
        self.inner.kind
    }

    pub fn operator(&self) -> &str {
        &self.inner.operator
    }

    pub fn payload_type(&self) -> &'static str {
        self.inner.payload_type
    }

    pub fn key_type(&self) -> &'static str {
        self.inner.key_type
    }

    /// Upstream plan nodes: empty for sources, one for unary, two
    /// (left, right) for binary.
    pub fn upstream(&self) -> &[PlanNode] {
        &self.inner.upstream
    }

    /// Events currently buffered on the left side. Zero for non-binary
    /// nodes. May be momentarily stale; never blocks.
    pub fn left_buffered_events(&self) -> usize {
        self.inner
            .stats
            .as_ref()
            .map_or(0, |s| s.left_buffered_events())
    }

    /// Events currently buffered on the right side.
    pub fn right_buffered_events(&self) -> usize {
        self.inner
            .stats
            .as_ref()
            .map_or(0, |s| s.right_buffered_events())
    }

    pub fn has_left_state(&self) -> bool {
        self.left_buffered_events() > 0
    }

    pub fn has_right_state(&self) -> bool {
        self.right_buffered_events() > 0
    }

    /// Render the tree as an indented structural summary.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        self.render(&mut out, 0);
        out
    }

    fn render(&self, out: &mut String, depth: usize) {
        for _ in 0..depth {
            out.push_str("  ");
        }
        match self.inner.kind {
            PlanNodeKind::Source => {
                out.push_str(&format!("source {} (#{})\n", self.operator(), self.node_id()));
            }
            PlanNodeKind::Unary => {
                out.push_str(&format!(
                    "unary {} (#{}) [{}/{}]\n",
                    self.operator(),
                    self.node_id(),
                    self.payload_type(),
                    self.key_type()
                ));
            }
            PlanNodeKind::Binary => {
                out.push_str(&format!(
                    "binary {} (#{}) [{}/{}] left={} right={}\n",
                    self.operator(),
                    self.node_id(),
                    self.payload_type(),
                    self.key_type(),
                    self.left_buffered_events(),
                    self.right_buffered_events()
                ));
            }
        }
        for upstream in self.upstream() {
            upstream.render(out, depth + 1);
        }
    }
}

impl std::fmt::Debug for PlanNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanNode")
            .field("node_id", &self.node_id())
            .field("kind", &self.kind())
            .field("operator", &self.operator())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_shape() {
        let node = PlanNode::source("trades");
        assert_eq!(node.kind(), PlanNodeKind::Source);
        assert!(node.upstream().is_empty());
        assert_eq!(node.left_buffered_events(), 0);
        assert!(!node.has_left_state());
    }

    #[test]
    fn test_binary_live_counters() {
        let left_events = Arc::new(AtomicUsize::new(0));
        let right_events = Arc::new(AtomicUsize::new(0));
        let stats = BinarySideStats::new(Arc::clone(&left_events), Arc::clone(&right_events));

        let node = PlanNode::binary(
            7,
            "union",
            "event",
            "str",
            PlanNode::source("a"),
            PlanNode::source("b"),
            stats,
        );

        assert_eq!(node.left_buffered_events(), 0);
        left_events.store(12, Ordering::Relaxed);
        right_events.store(3, Ordering::Relaxed);
        assert_eq!(node.left_buffered_events(), 12);
        assert_eq!(node.right_buffered_events(), 3);
        assert!(node.has_left_state());
        assert!(node.has_right_state());
    }

    #[test]
    fn test_summary_renders_tree() {
        let stats = BinarySideStats::new(
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
        );
        let binary = PlanNode::binary(
            1,
            "union",
            "event",
            "str",
            PlanNode::source("a"),
            PlanNode::source("b"),
            stats,
        );
        let top = PlanNode::unary(2, "filter", "event", "str", binary);

        let summary = top.summary();
        assert!(summary.contains("unary filter"));
        assert!(summary.contains("binary union"));
        assert!(summary.contains("source a"));
        assert!(summary.contains("source b"));
    }
}
