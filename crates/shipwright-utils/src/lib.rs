//! Shared foundation for the shipwright workspace.
//!
//! Contains the error taxonomy, the stage/provider identifier types used
//! across crates, tolerant JSON extraction from model output, and tracing
//! setup. Nothing in this crate spawns processes or performs I/O beyond
//! logging initialization.

pub mod error;
pub mod json;
pub mod logging;
pub mod types;
