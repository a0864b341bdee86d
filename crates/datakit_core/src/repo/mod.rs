//! Repository layer over the SQLite store.
//!
//! # Responsibility
//! - Isolate SQL query details from the coordinator and contexts.
//!
//! # Invariants
//! - Repository APIs return `StoreError` for transport and data errors;
//!   semantic decisions (conflicts, validation) belong to callers.

pub mod object_repo;
