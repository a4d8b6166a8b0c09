//! mf-core: shared types, IDs, errors, configuration, and event system.
//!
//! This crate is the foundational dependency for all other mf-* crates,
//! providing type-safe identifiers, the pipeline error taxonomy, application
//! configuration, and a broadcast bus for pipeline events.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, Result};
pub use ids::*;
