//! Pending change sets passed between contexts and the store.

use super::object::{ManagedObject, ObjectId};

/// Changes one context hands to its parent on save.
///
/// Inserted and updated objects are full snapshots; updated snapshots keep
/// the version they were read at so the store can detect stale writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub(crate) inserted: Vec<ManagedObject>,
    pub(crate) updated: Vec<ManagedObject>,
    pub(crate) deleted: Vec<ObjectId>,
}

impl ChangeSet {
    pub fn inserted(&self) -> &[ManagedObject] {
        &self.inserted
    }

    pub fn updated(&self) -> &[ManagedObject] {
        &self.updated
    }

    pub fn deleted(&self) -> &[ObjectId] {
        &self.deleted
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Total number of touched objects.
    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }

    pub fn inserted_ids(&self) -> Vec<ObjectId> {
        self.inserted.iter().map(ManagedObject::id).collect()
    }

    /// Finds the saved snapshot of one inserted or updated object.
    pub fn object(&self, id: ObjectId) -> Option<&ManagedObject> {
        self.inserted
            .iter()
            .chain(self.updated.iter())
            .find(|object| object.id() == id)
    }
}
