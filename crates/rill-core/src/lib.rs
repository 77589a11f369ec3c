//! # Rill Core
//!
//! Foundational types for the Rill temporal stream-processing runtime.
//!
//! This crate holds the runtime value representation shared by event
//! payloads, operator configuration, and checkpoint images. The execution
//! core itself lives in `rill-runtime`.

pub mod value;

pub use value::Value;
