//! Schema-validated checkpoint and restore
//!
//! Every node writes a 4-byte schema fingerprint ahead of its state image
//! so a restore can tell "wrong checkpoint for this query" apart from a
//! corrupt stream. The fingerprint hashes the operator's declared type
//! name and its schema-relevant configuration, declared explicitly via
//! [`Checkpointable::schema_fields`] rather than discovered by runtime
//! reflection. It is computed once per node instance and cached.

use std::hash::Hasher;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use rustc_hash::FxHasher;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::RuntimeError;

/// Process-unique node identifier, assigned at construction.
pub type NodeId = u64;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next node identifier.
pub fn next_node_id() -> NodeId {
    NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed)
}

/// State persistence contract implemented by every operator.
///
/// `schema_fields` describes *shape* (configuration that determines the
/// on-disk layout); `write_state`/`read_state` move *state* (the values
/// persisted on checkpoint and overwritten on restore). The two sets are
/// disjoint in purpose.
pub trait Checkpointable {
    /// Declared operator type name, part of the schema fingerprint.
    fn type_name(&self) -> &'static str;

    /// Schema-relevant configuration rendered to stable strings. Two
    /// operators with the same type name and the same renderings share a
    /// fingerprint.
    fn schema_fields(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    /// Write all serialization fields in a stable order. Must not mutate
    /// operator state.
    fn write_state(&self, w: &mut dyn Write) -> Result<(), RuntimeError>;

    /// Read a full serialization-field image and replace the operator's
    /// current values with it.
    fn read_state(&mut self, r: &mut dyn Read) -> Result<(), RuntimeError>;

    /// Re-establish internal back-references after a restore. Such
    /// references are never persisted; the restored image starts with
    /// them dangling.
    fn update_references(&mut self) {}

    /// Clear transient, non-persisted runtime state.
    fn reset(&mut self) {}
}

/// Identity plus cached fingerprint shared by every pipe.
pub struct NodeCore {
    id: NodeId,
    fingerprint: OnceLock<u32>,
}

impl NodeCore {
    pub fn new() -> Self {
        Self {
            id: next_node_id(),
            fingerprint: OnceLock::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The node's schema fingerprint, computed lazily on first use and
    /// stable for the node's lifetime afterwards.
    pub fn fingerprint(&self, op: &dyn Checkpointable) -> u32 {
        *self.fingerprint.get_or_init(|| schema_fingerprint(op))
    }
}

impl Default for NodeCore {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash an operator's type name and schema fields down to 4 bytes.
pub fn schema_fingerprint(op: &dyn Checkpointable) -> u32 {
    let mut hasher = FxHasher::default();
    hasher.write(op.type_name().as_bytes());
    for (name, rendering) in op.schema_fields() {
        hasher.write(name.as_bytes());
        hasher.write_u8(0);
        hasher.write(rendering.as_bytes());
        hasher.write_u8(0);
    }
    let full = hasher.finish();
    (full ^ (full >> 32)) as u32
}

/// Write the fingerprint followed by the operator's state image.
pub fn checkpoint_state(
    fingerprint: u32,
    op: &dyn Checkpointable,
    w: &mut dyn Write,
) -> Result<(), RuntimeError> {
    w.write_all(&fingerprint.to_le_bytes())?;
    op.write_state(w)?;
    debug!(operator = op.type_name(), fingerprint, "checkpoint written");
    Ok(())
}

/// Validate the fingerprint, then read and apply the state image.
///
/// On fingerprint mismatch no further bytes are read and the operator is
/// left untouched.
pub fn restore_state(
    fingerprint: u32,
    op: &mut dyn Checkpointable,
    r: &mut dyn Read,
) -> Result<(), RuntimeError> {
    let mut raw = [0u8; 4];
    r.read_exact(&mut raw)?;
    let found = u32::from_le_bytes(raw);
    if found != fingerprint {
        return Err(RuntimeError::SchemaMismatch {
            expected: fingerprint,
            found,
        });
    }
    op.read_state(r)?;
    op.update_references();
    debug!(operator = op.type_name(), fingerprint, "state restored");
    Ok(())
}

/// Encode a serde snapshot as a length-prefixed JSON image.
pub fn write_json_state<T: Serialize>(w: &mut dyn Write, state: &T) -> Result<(), RuntimeError> {
    let bytes =
        serde_json::to_vec(state).map_err(|e| RuntimeError::Serialization(e.to_string()))?;
    w.write_all(&(bytes.len() as u32).to_le_bytes())?;
    w.write_all(&bytes)?;
    Ok(())
}

/// Decode a length-prefixed JSON image written by [`write_json_state`].
pub fn read_json_state<T: DeserializeOwned>(r: &mut dyn Read) -> Result<T, RuntimeError> {
    let mut len = [0u8; 4];
    r.read_exact(&mut len)?;
    let mut buf = vec![0u8; u32::from_le_bytes(len) as usize];
    r.read_exact(&mut buf)?;
    serde_json::from_slice(&buf).map_err(|e| RuntimeError::Serialization(e.to_string()))
}
