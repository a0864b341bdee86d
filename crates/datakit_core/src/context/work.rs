//! Per-save work context.

use super::root::RootState;
use super::state::ContextState;
use super::ContextError;
use crate::model::object::{AttributeValue, ManagedObject, ObjectId};
use crate::model::schema::Schema;
use std::sync::Arc;

/// Scratch context handed to exactly one save mutation.
///
/// It borrows the root state for the duration of the mutation, so it can
/// neither outlive the mutation nor move to another thread. Objects that
/// came from other contexts must be looked up here by id before editing.
pub struct WorkContext<'root> {
    state: ContextState,
    parent: &'root RootState,
}

impl<'root> WorkContext<'root> {
    pub(crate) fn new(parent: &'root RootState) -> Self {
        Self {
            state: ContextState::new(Arc::clone(parent.context().schema())),
            parent,
        }
    }

    pub fn schema(&self) -> &Schema {
        self.state.schema()
    }

    /// Inserts a new object of `entity` with schema defaults applied.
    pub fn insert(&mut self, entity: &str) -> Result<ObjectId, ContextError> {
        self.state.insert(entity)
    }

    /// Sets one attribute, faulting the object from the root if needed.
    pub fn set(
        &mut self,
        id: ObjectId,
        attribute: &str,
        value: impl Into<AttributeValue>,
    ) -> Result<(), ContextError> {
        self.state.set(self.parent, id, attribute, value.into())
    }

    pub fn unset(&mut self, id: ObjectId, attribute: &str) -> Result<(), ContextError> {
        self.state.unset(self.parent, id, attribute)
    }

    pub fn delete(&mut self, id: ObjectId) -> Result<(), ContextError> {
        self.state.delete(self.parent, id)
    }

    /// Looks an object up by id in this context's view.
    pub fn object(&mut self, id: ObjectId) -> Result<Option<ManagedObject>, ContextError> {
        self.state.object(self.parent, id)
    }

    /// Like `object`, but a missing object is an error.
    pub fn existing_object(&mut self, id: ObjectId) -> Result<ManagedObject, ContextError> {
        self.object(id)?.ok_or(ContextError::ObjectNotFound(id))
    }

    pub fn objects(&mut self, entity: &str) -> Result<Vec<ManagedObject>, ContextError> {
        self.state.objects(self.parent, entity)
    }

    pub fn has_changes(&self) -> bool {
        self.state.has_changes()
    }

    pub(crate) fn into_state(self) -> ContextState {
        self.state
    }
}
