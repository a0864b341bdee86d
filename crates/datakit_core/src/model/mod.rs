//! Managed object model.
//!
//! # Responsibility
//! - Define schema descriptions (entities, typed attributes).
//! - Define the managed object value shared by contexts and the store.
//! - Hold the process-wide registry of known models.
//!
//! # Invariants
//! - Every managed object is identified by a stable `ObjectId`.
//! - Objects are validated against the schema before they are saved.

pub mod changes;
pub mod object;
pub mod registry;
pub mod schema;
