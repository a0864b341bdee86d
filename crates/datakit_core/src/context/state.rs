//! Per-context object graph and change tracking.
//!
//! # Invariants
//! - An id is in at most one of `inserted`, `updated`, `deleted`.
//! - Every id in `inserted` or `updated` is present in `registered`.
//! - Deleted ids are never present in `registered`.

use super::{ContextError, ObjectStore};
use crate::coordinator::CommitOutcome;
use crate::config::MergePolicy;
use crate::model::changes::ChangeSet;
use crate::model::object::{AttributeValue, ManagedObject, ObjectId};
use crate::model::schema::{EntityDescription, Schema, ValidationError};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

pub(crate) struct ContextState {
    schema: Arc<Schema>,
    registered: HashMap<ObjectId, ManagedObject>,
    inserted: InsertedIds,
    updated: BTreeSet<ObjectId>,
    deleted: BTreeSet<ObjectId>,
}

/// Pending inserts in insertion order with constant-time membership.
///
/// Removed ids stay in `order` and are skipped; ids are never re-inserted
/// because every insert generates a fresh `ObjectId`.
#[derive(Default)]
struct InsertedIds {
    order: Vec<ObjectId>,
    members: HashSet<ObjectId>,
}

impl InsertedIds {
    fn push(&mut self, id: ObjectId) {
        if self.members.insert(id) {
            self.order.push(id);
        }
    }

    fn contains(&self, id: &ObjectId) -> bool {
        self.members.contains(id)
    }

    fn remove(&mut self, id: &ObjectId) -> bool {
        self.members.remove(id)
    }

    fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = &ObjectId> + '_ {
        self.order.iter().filter(|id| self.members.contains(*id))
    }

    fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}

/// What a context knows locally about one id.
pub(crate) enum LocalState<'a> {
    Unknown,
    Deleted,
    Present(&'a ManagedObject),
}

impl ContextState {
    pub(crate) fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            registered: HashMap::new(),
            inserted: InsertedIds::default(),
            updated: BTreeSet::new(),
            deleted: BTreeSet::new(),
        }
    }

    pub(crate) fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub(crate) fn has_changes(&self) -> bool {
        !self.inserted.is_empty() || !self.updated.is_empty() || !self.deleted.is_empty()
    }

    pub(crate) fn registered_count(&self) -> usize {
        self.registered.len()
    }

    fn has_pending(&self, id: ObjectId) -> bool {
        self.inserted.contains(&id) || self.updated.contains(&id) || self.deleted.contains(&id)
    }

    pub(crate) fn local(&self, id: ObjectId) -> LocalState<'_> {
        if self.deleted.contains(&id) {
            return LocalState::Deleted;
        }
        match self.registered.get(&id) {
            Some(object) => LocalState::Present(object),
            None => LocalState::Unknown,
        }
    }

    /// Overlays this context's state on a parent listing of one entity.
    pub(crate) fn overlay(&self, base: Vec<ManagedObject>, entity: &str) -> Vec<ManagedObject> {
        let mut objects: Vec<ManagedObject> = base
            .into_iter()
            .filter_map(|object| match self.local(object.id()) {
                LocalState::Deleted => None,
                LocalState::Present(local) => Some(local.clone()),
                LocalState::Unknown => Some(object),
            })
            .collect();
        for id in self.inserted.iter() {
            if let Some(object) = self.registered.get(id) {
                if object.entity() == entity && !objects.iter().any(|known| known.id() == *id) {
                    objects.push(object.clone());
                }
            }
        }
        objects
    }

    /// Makes `id` available in `registered`; `false` when it does not exist.
    fn materialize(&mut self, parent: &dyn ObjectStore, id: ObjectId) -> Result<bool, ContextError> {
        match self.local(id) {
            LocalState::Deleted => return Ok(false),
            LocalState::Present(_) => return Ok(true),
            LocalState::Unknown => {}
        }
        match parent.fetch_object(id)? {
            Some(object) => {
                self.registered.insert(id, object);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub(crate) fn object(
        &mut self,
        parent: &dyn ObjectStore,
        id: ObjectId,
    ) -> Result<Option<ManagedObject>, ContextError> {
        if self.materialize(parent, id)? {
            Ok(self.registered.get(&id).cloned())
        } else {
            Ok(None)
        }
    }

    pub(crate) fn objects(
        &mut self,
        parent: &dyn ObjectStore,
        entity: &str,
    ) -> Result<Vec<ManagedObject>, ContextError> {
        self.require_entity(entity)?;
        let base = parent.fetch_entity(entity)?;
        Ok(self.overlay(base, entity))
    }

    pub(crate) fn insert(&mut self, entity: &str) -> Result<ObjectId, ContextError> {
        let description = self.require_entity(entity)?;
        let mut object = ManagedObject::new(entity);
        for attribute in description.attributes.values() {
            if let Some(default) = &attribute.default {
                object.set(attribute.name.clone(), default.clone());
            }
        }
        let id = object.id();
        self.registered.insert(id, object);
        self.inserted.push(id);
        Ok(id)
    }

    pub(crate) fn set(
        &mut self,
        parent: &dyn ObjectStore,
        id: ObjectId,
        attribute: &str,
        value: AttributeValue,
    ) -> Result<(), ContextError> {
        let object = self.registered_for_edit(parent, id)?;
        let entity = object.entity().to_string();
        let description = self
            .schema
            .entity(&entity)
            .and_then(|entity| entity.attribute(attribute))
            .ok_or_else(|| ContextError::UnknownAttribute {
                entity: entity.clone(),
                attribute: attribute.to_string(),
            })?;
        if description.kind != value.kind() {
            return Err(ContextError::TypeMismatch {
                attribute: attribute.to_string(),
                expected: description.kind,
                found: value.kind(),
            });
        }
        if !value.is_finite() {
            return Err(ContextError::NonFiniteValue {
                attribute: attribute.to_string(),
            });
        }

        if let Some(object) = self.registered.get_mut(&id) {
            object.set(attribute, value);
        }
        self.mark_updated(id);
        Ok(())
    }

    pub(crate) fn unset(
        &mut self,
        parent: &dyn ObjectStore,
        id: ObjectId,
        attribute: &str,
    ) -> Result<(), ContextError> {
        let object = self.registered_for_edit(parent, id)?;
        let entity = object.entity().to_string();
        if self
            .schema
            .entity(&entity)
            .and_then(|entity| entity.attribute(attribute))
            .is_none()
        {
            return Err(ContextError::UnknownAttribute {
                entity,
                attribute: attribute.to_string(),
            });
        }

        if let Some(object) = self.registered.get_mut(&id) {
            object.unset(attribute);
        }
        self.mark_updated(id);
        Ok(())
    }

    pub(crate) fn delete(&mut self, parent: &dyn ObjectStore, id: ObjectId) -> Result<(), ContextError> {
        if !self.materialize(parent, id)? {
            return Err(ContextError::ObjectNotFound(id));
        }
        self.registered.remove(&id);
        if self.inserted.remove(&id) {
            return Ok(());
        }
        self.updated.remove(&id);
        self.deleted.insert(id);
        Ok(())
    }

    fn registered_for_edit(
        &mut self,
        parent: &dyn ObjectStore,
        id: ObjectId,
    ) -> Result<&ManagedObject, ContextError> {
        if !self.materialize(parent, id)? {
            return Err(ContextError::ObjectNotFound(id));
        }
        self.registered
            .get(&id)
            .ok_or(ContextError::ObjectNotFound(id))
    }

    fn mark_updated(&mut self, id: ObjectId) {
        if !self.inserted.contains(&id) {
            self.updated.insert(id);
        }
    }

    fn require_entity(&self, entity: &str) -> Result<EntityDescription, ContextError> {
        self.schema
            .entity(entity)
            .cloned()
            .ok_or_else(|| ContextError::UnknownEntity(entity.to_string()))
    }

    /// Validates every inserted and updated object.
    pub(crate) fn validate(&self) -> Vec<ValidationError> {
        self.inserted
            .iter()
            .chain(self.updated.iter())
            .filter_map(|id| self.registered.get(id))
            .flat_map(|object| self.schema.validate_object(object))
            .collect()
    }

    /// Snapshot of all pending changes.
    pub(crate) fn changes(&self) -> ChangeSet {
        ChangeSet {
            inserted: self.snapshot(self.inserted.iter()),
            updated: self.snapshot(self.updated.iter()),
            deleted: self.deleted.iter().copied().collect(),
        }
    }

    fn snapshot<'a>(&self, ids: impl Iterator<Item = &'a ObjectId>) -> Vec<ManagedObject> {
        ids.filter_map(|id| self.registered.get(id).cloned())
            .collect()
    }

    /// Discards pending changes; edited objects are re-faulted on next access.
    pub(crate) fn rollback(&mut self) {
        for id in self.inserted.iter() {
            self.registered.remove(id);
        }
        self.inserted.clear();
        for id in std::mem::take(&mut self.updated) {
            self.registered.remove(&id);
        }
        self.deleted.clear();
    }

    /// Forgets everything, pending changes included.
    pub(crate) fn reset(&mut self) {
        self.registered.clear();
        self.inserted.clear();
        self.updated.clear();
        self.deleted.clear();
    }

    /// Drops one cached object so the next access re-faults it.
    pub(crate) fn refresh(&mut self, id: ObjectId) {
        if !self.has_pending(id) {
            self.registered.remove(&id);
        }
    }

    /// Takes a child's saved changes as this context's pending changes.
    ///
    /// Returns the colliding ids when `policy` is `Error` and this context
    /// holds uncommitted changes for objects the child touched; nothing is
    /// merged in that case.
    pub(crate) fn merge_child(
        &mut self,
        changes: ChangeSet,
        policy: MergePolicy,
    ) -> Result<Vec<ObjectId>, Vec<ObjectId>> {
        let collisions: Vec<ObjectId> = changes
            .updated
            .iter()
            .map(ManagedObject::id)
            .chain(changes.deleted.iter().copied())
            .filter(|id| self.has_pending(*id))
            .collect();

        let skipped = match policy {
            MergePolicy::Error if !collisions.is_empty() => return Err(collisions),
            MergePolicy::StoreTrumps => collisions,
            _ => Vec::new(),
        };

        for object in changes.inserted {
            let id = object.id();
            self.registered.insert(id, object);
            self.inserted.push(id);
        }
        for object in changes.updated {
            let id = object.id();
            if skipped.contains(&id) {
                continue;
            }
            self.deleted.remove(&id);
            self.registered.insert(id, object);
            self.mark_updated(id);
        }
        for id in changes.deleted {
            if skipped.contains(&id) {
                continue;
            }
            self.registered.remove(&id);
            if self.inserted.remove(&id) {
                continue;
            }
            self.updated.remove(&id);
            self.deleted.insert(id);
        }
        Ok(skipped)
    }

    /// Records a successful store commit of `changes`.
    ///
    /// Committed objects are released; the next access reads them from the
    /// parent again. Returns the change set as persisted: new versions
    /// applied, updates discarded by the store left out.
    pub(crate) fn did_commit(&mut self, changes: ChangeSet, outcome: &CommitOutcome) -> ChangeSet {
        let mut saved = ChangeSet {
            deleted: changes.deleted,
            ..ChangeSet::default()
        };
        for (target, objects) in [
            (&mut saved.inserted, changes.inserted),
            (&mut saved.updated, changes.updated),
        ] {
            for mut object in objects {
                let id = object.id();
                self.registered.remove(&id);
                if let Some(version) = outcome.versions.get(&id) {
                    object.set_version(*version);
                    target.push(object);
                }
            }
        }
        self.inserted.clear();
        self.updated.clear();
        self.deleted.clear();
        saved
    }

    /// Applies another context's persisted changes to cached objects.
    ///
    /// Objects this context never materialized stay unmaterialized; objects
    /// with local pending changes keep them.
    pub(crate) fn merge_saved(&mut self, saved: &ChangeSet) {
        for object in saved.inserted().iter().chain(saved.updated()) {
            let id = object.id();
            if self.registered.contains_key(&id) && !self.has_pending(id) {
                self.registered.insert(id, object.clone());
            }
        }
        for id in saved.deleted() {
            if !self.has_pending(*id) {
                self.registered.remove(id);
            }
        }
    }
}
