//! Error types for the pipe execution core

use std::fmt;
use std::io;

/// Error raised by the runtime core.
///
/// All variants are fatal to the node instance that raises them; the
/// runtime never retries internally.
#[derive(Debug)]
pub enum RuntimeError {
    /// A restore stream carried a fingerprint for a different operator
    /// type or configuration. Tooling uses this to tell "wrong checkpoint
    /// for this query" apart from corruption.
    SchemaMismatch { expected: u32, found: u32 },
    /// The checkpoint stream ended early or could not be read.
    CorruptCheckpoint(io::Error),
    /// Checkpoint image could not be encoded or decoded.
    Serialization(String),
    /// An internal state machine reached a case that correct usage can
    /// never produce (e.g. the same side checkpointing twice).
    ProtocolViolation(String),
    /// Failure forwarded from an upstream node.
    Upstream(String),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::SchemaMismatch { expected, found } => write!(
                f,
                "schema mismatch: node fingerprint {:#010x}, stream fingerprint {:#010x}",
                expected, found
            ),
            RuntimeError::CorruptCheckpoint(e) => write!(f, "corrupt checkpoint stream: {}", e),
            RuntimeError::Serialization(s) => write!(f, "serialization error: {}", s),
            RuntimeError::ProtocolViolation(s) => write!(f, "protocol violation: {}", s),
            RuntimeError::Upstream(s) => write!(f, "upstream error: {}", s),
        }
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RuntimeError::CorruptCheckpoint(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RuntimeError {
    fn from(e: io::Error) -> Self {
        RuntimeError::CorruptCheckpoint(e)
    }
}
