//! # cadence-core
//!
//! Core types, traits, and the recurrence engine for cadence.
//!
//! This crate provides the foundational data structures and trait definitions
//! that other cadence crates depend on, plus the pure next-occurrence
//! computation used by the dispatcher.

pub mod defaults;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod phone;
pub mod recurrence;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use events::{EventBus, EventEnvelope, StoreEvent};
pub use models::*;
pub use recurrence::{next_occurrence, validate_rule, Occurrence};
pub use traits::*;

/// Generate a new UUIDv7 identifier (time-ordered).
#[inline]
pub fn new_v7() -> uuid::Uuid {
    uuid::Uuid::now_v7()
}
