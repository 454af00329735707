//! tc-core: shared types, IDs, errors, configuration, and event system.
//!
//! This crate is the foundational dependency for all other tc-* crates,
//! providing type-safe identifiers, a unified error type, media-format
//! enums, job descriptors and states, application configuration, and a
//! broadcast event bus.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod job;
pub mod media;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, RelaySide, Result};
pub use ids::*;
pub use job::{FailureReason, JobSpec, JobState, OutputTarget, SourceLocator};
pub use media::*;
