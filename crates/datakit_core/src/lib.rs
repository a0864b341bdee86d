//! Object persistence stack over SQLite.
//!
//! A `DataKit` owns one store coordinator, a root context running on its own
//! background queue and a main-thread context. Writes go through `save`: the
//! mutation runs on a fresh work context, its changes cascade into the root
//! context and then into the store, and the completion runs on the main
//! thread.

pub mod config;
pub mod context;
pub mod coordinator;
pub mod db;
pub mod dispatch;
pub mod logging;
pub mod model;
pub mod repo;
pub mod save;
mod shared;
mod stack;

pub use config::{MergePolicy, StackOptions, STORE_DIR_ENV};
pub use context::{ContextError, MainContext, ObjectStore, RootContext, RootState, WorkContext};
pub use coordinator::{SetupError, StoreCoordinator, StoreDescriptor, StoreKind};
pub use db::StoreError;
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::changes::ChangeSet;
pub use model::object::{AttributeValue, ManagedObject, ObjectId};
pub use model::registry::register_model;
pub use model::schema::{
    AttributeDescription, AttributeType, EntityDescription, Schema, SchemaError, ValidationError,
};
pub use save::{in_mutation, SaveError, SavePhase, SaveResult, SaveStage, SaveSummary};
pub use shared::save;
pub use stack::DataKit;

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
