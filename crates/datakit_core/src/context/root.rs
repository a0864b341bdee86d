//! Root context and its private background queue.
//!
//! # Responsibility
//! - Own the root context state on one dedicated thread.
//! - Execute submitted jobs strictly in submission order.
//! - Persist root changes to the coordinator.
//!
//! # Invariants
//! - `RootState` is only ever touched by the queue thread.
//! - The queue thread exits once every `RootContext` handle is dropped and
//!   the queued jobs have run.

use super::state::{ContextState, LocalState};
use super::{ContextError, ObjectStore};
use crate::config::MergePolicy;
use crate::coordinator::{CommitError, SetupError, StoreCoordinator};
use crate::model::changes::ChangeSet;
use crate::model::object::{ManagedObject, ObjectId};
use crate::save::{SaveError, SaveStage};
use log::{debug, error};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, ThreadId};

type RootJob = Box<dyn FnOnce(&mut RootState) + Send + 'static>;

/// State confined to the root queue thread.
pub struct RootState {
    context: ContextState,
    coordinator: Arc<StoreCoordinator>,
    merge_policy: MergePolicy,
}

impl RootState {
    fn new(coordinator: Arc<StoreCoordinator>, merge_policy: MergePolicy) -> Self {
        Self {
            context: ContextState::new(Arc::clone(coordinator.schema())),
            coordinator,
            merge_policy,
        }
    }

    pub fn coordinator(&self) -> &Arc<StoreCoordinator> {
        &self.coordinator
    }

    pub fn merge_policy(&self) -> MergePolicy {
        self.merge_policy
    }

    /// Whether the root holds changes that have not reached the store.
    pub fn has_changes(&self) -> bool {
        self.context.has_changes()
    }

    /// Number of objects held in memory; committed objects are not kept.
    pub fn cached_count(&self) -> usize {
        self.context.registered_count()
    }

    pub fn object(&self, id: ObjectId) -> Result<Option<ManagedObject>, ContextError> {
        self.fetch_object(id)
    }

    pub fn objects(&self, entity: &str) -> Result<Vec<ManagedObject>, ContextError> {
        self.fetch_entity(entity)
    }

    /// Discards root changes that were merged from children but never
    /// persisted.
    pub fn rollback(&mut self) {
        self.context.rollback();
    }

    pub(crate) fn context(&self) -> &ContextState {
        &self.context
    }

    /// Merges a child's changes into the root without persisting them.
    pub(crate) fn merge_child(&mut self, changes: ChangeSet) -> Result<(), SaveError> {
        match self.context.merge_child(changes, self.merge_policy) {
            Ok(skipped) => {
                if !skipped.is_empty() {
                    debug!(
                        "event=merge_child module=context status=skipped objects={}",
                        skipped.len()
                    );
                }
                Ok(())
            }
            Err(objects) => Err(SaveError::MergeConflict {
                stage: SaveStage::Root,
                objects,
            }),
        }
    }

    /// Persists every pending root change in one store transaction.
    ///
    /// On failure the pending changes stay in the root context.
    pub fn save(&mut self) -> Result<ChangeSet, SaveError> {
        if !self.context.has_changes() {
            return Ok(ChangeSet::default());
        }
        let errors = self.context.validate();
        if !errors.is_empty() {
            return Err(SaveError::Validation(errors));
        }

        let changes = self.context.changes();
        match self.coordinator.commit(&changes, self.merge_policy) {
            Ok(outcome) => {
                for id in &outcome.discarded {
                    debug!("event=store_commit module=context status=discarded object={id}");
                }
                Ok(self.context.did_commit(changes, &outcome))
            }
            Err(CommitError::Conflict(objects)) => Err(SaveError::MergeConflict {
                stage: SaveStage::Store,
                objects,
            }),
            Err(CommitError::Store(source)) => Err(SaveError::Store {
                stage: SaveStage::Store,
                source,
            }),
        }
    }
}

impl ObjectStore for RootState {
    fn fetch_object(&self, id: ObjectId) -> Result<Option<ManagedObject>, ContextError> {
        match self.context.local(id) {
            LocalState::Deleted => Ok(None),
            LocalState::Present(object) => Ok(Some(object.clone())),
            LocalState::Unknown => self.coordinator.fetch_object(id),
        }
    }

    fn fetch_entity(&self, entity: &str) -> Result<Vec<ManagedObject>, ContextError> {
        let stored = self.coordinator.fetch_entity(entity)?;
        Ok(self.context.overlay(stored, entity))
    }
}

/// Handle to a root context. Cloning shares the same queue.
///
/// The only way to reach `RootState` is submitting a closure.
#[derive(Clone)]
pub struct RootContext {
    sender: Sender<RootJob>,
    thread_id: ThreadId,
    label: Arc<str>,
}

impl std::fmt::Debug for RootContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootContext")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl RootContext {
    pub(crate) fn spawn(
        coordinator: Arc<StoreCoordinator>,
        merge_policy: MergePolicy,
        label: &str,
    ) -> Result<Self, SetupError> {
        let (sender, receiver) = mpsc::channel::<RootJob>();
        let mut state = RootState::new(coordinator, merge_policy);
        let queue_label = label.to_string();

        let handle = thread::Builder::new()
            .name(label.to_string())
            .spawn(move || {
                debug!("event=root_queue module=context status=start queue={queue_label}");
                while let Ok(job) = receiver.recv() {
                    if catch_unwind(AssertUnwindSafe(|| job(&mut state))).is_err() {
                        error!(
                            "event=root_queue module=context status=error queue={queue_label} error_code=job_panicked"
                        );
                    }
                }
                debug!("event=root_queue module=context status=stop queue={queue_label}");
            })
            .map_err(SetupError::QueueSpawn)?;

        Ok(Self {
            sender,
            thread_id: handle.thread().id(),
            label: Arc::from(label),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the caller runs on this root's queue thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Enqueues `job` behind everything already submitted. Never blocks.
    pub fn perform<F>(&self, job: F) -> Result<(), ContextError>
    where
        F: FnOnce(&mut RootState) + Send + 'static,
    {
        self.sender
            .send(Box::new(job))
            .map_err(|_| ContextError::QueueClosed)
    }

    /// Enqueues `job` and blocks until it ran.
    ///
    /// # Errors
    /// - `WouldDeadlock` when called from the root queue itself.
    /// - `JobPanicked` when `job` panicked.
    pub fn perform_and_wait<F, R>(&self, job: F) -> Result<R, ContextError>
    where
        F: FnOnce(&mut RootState) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Err(ContextError::WouldDeadlock);
        }
        let (result_tx, result_rx) = mpsc::sync_channel(1);
        self.perform(move |state| {
            let _ = result_tx.send(job(state));
        })?;
        result_rx.recv().map_err(|_| ContextError::JobPanicked)
    }

    pub fn object(&self, id: ObjectId) -> Result<Option<ManagedObject>, ContextError> {
        self.perform_and_wait(move |state| state.object(id))?
    }

    pub fn objects(&self, entity: &str) -> Result<Vec<ManagedObject>, ContextError> {
        let entity = entity.to_string();
        self.perform_and_wait(move |state| state.objects(&entity))?
    }

    pub fn has_changes(&self) -> Result<bool, ContextError> {
        self.perform_and_wait(|state| state.has_changes())
    }

    pub fn cached_count(&self) -> Result<usize, ContextError> {
        self.perform_and_wait(|state| state.cached_count())
    }

    /// Discards unpersisted root changes; see `RootState::rollback`.
    pub fn rollback(&self) -> Result<(), ContextError> {
        self.perform_and_wait(|state| state.rollback())
    }
}

impl ObjectStore for RootContext {
    fn fetch_object(&self, id: ObjectId) -> Result<Option<ManagedObject>, ContextError> {
        self.object(id)
    }

    fn fetch_entity(&self, entity: &str) -> Result<Vec<ManagedObject>, ContextError> {
        self.objects(entity)
    }
}
