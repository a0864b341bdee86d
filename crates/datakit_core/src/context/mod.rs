//! Context hierarchy: root (background queue), main (main thread) and
//! short-lived work contexts.
//!
//! # Responsibility
//! - Track materialized objects and pending changes per context.
//! - Confine each context to its thread: the root context to its queue,
//!   the main context to the main thread, work contexts to one mutation.
//!
//! # Invariants
//! - A context reads through its parent (`ObjectStore`) for objects it has
//!   not materialized yet.
//! - Pending changes only leave a context through a save into its parent.

mod main;
mod root;
pub(crate) mod state;
mod work;

pub use main::MainContext;
pub use root::{RootContext, RootState};
pub use work::WorkContext;

use crate::db::StoreError;
use crate::model::object::{ManagedObject, ObjectId};
use crate::model::schema::AttributeType;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Parent side of a context: anything objects can be faulted from.
pub trait ObjectStore {
    fn fetch_object(&self, id: ObjectId) -> Result<Option<ManagedObject>, ContextError>;
    /// All objects of one entity, parent-side pending changes included.
    fn fetch_entity(&self, entity: &str) -> Result<Vec<ManagedObject>, ContextError>;
}

#[derive(Debug)]
pub enum ContextError {
    /// The stack has not been set up yet.
    NotSetUp,
    /// A main-thread-confined context was used from another thread.
    WrongThread,
    /// A blocking root call was made from the root queue itself.
    WouldDeadlock,
    /// The root queue no longer accepts work.
    QueueClosed,
    /// The submitted root job panicked before producing a result.
    JobPanicked,
    UnknownEntity(String),
    UnknownAttribute {
        entity: String,
        attribute: String,
    },
    TypeMismatch {
        attribute: String,
        expected: AttributeType,
        found: AttributeType,
    },
    /// NaN or infinite double; it cannot be stored.
    NonFiniteValue {
        attribute: String,
    },
    ObjectNotFound(ObjectId),
    Store(StoreError),
}

impl Display for ContextError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotSetUp => write!(f, "stack is not set up"),
            Self::WrongThread => write!(f, "main context used off the main thread"),
            Self::WouldDeadlock => write!(f, "blocking root call from the root queue"),
            Self::QueueClosed => write!(f, "root queue is closed"),
            Self::JobPanicked => write!(f, "root queue job panicked"),
            Self::UnknownEntity(entity) => write!(f, "unknown entity `{entity}`"),
            Self::UnknownAttribute { entity, attribute } => {
                write!(f, "entity `{entity}` has no attribute `{attribute}`")
            }
            Self::TypeMismatch {
                attribute,
                expected,
                found,
            } => write!(
                f,
                "attribute `{attribute}` expects {} but got {}",
                expected.as_str(),
                found.as_str()
            ),
            Self::NonFiniteValue { attribute } => {
                write!(f, "attribute `{attribute}` must be a finite number")
            }
            Self::ObjectNotFound(id) => write!(f, "object not found: {id}"),
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ContextError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for ContextError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}
