//! Main-thread context.

use super::root::RootContext;
use super::state::ContextState;
use super::ContextError;
use crate::model::changes::ChangeSet;
use crate::model::object::{ManagedObject, ObjectId};
use log::warn;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Read-mostly context for UI-facing code, child of the root context.
///
/// Every call must come from the main thread (the thread that created the
/// owning `DataKit`); other threads get `ContextError::WrongThread`.
/// Objects not cached yet are faulted from the root queue; such a lookup
/// waits for the jobs queued ahead of it.
#[derive(Clone)]
pub struct MainContext {
    state: Arc<Mutex<ContextState>>,
    root: RootContext,
    main_thread: ThreadId,
}

impl std::fmt::Debug for MainContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainContext")
            .field("root", &self.root)
            .field("main_thread", &self.main_thread)
            .finish_non_exhaustive()
    }
}

impl MainContext {
    pub(crate) fn new(state: ContextState, root: RootContext, main_thread: ThreadId) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            root,
            main_thread,
        }
    }

    fn check_thread(&self) -> Result<(), ContextError> {
        if thread::current().id() == self.main_thread {
            Ok(())
        } else {
            Err(ContextError::WrongThread)
        }
    }

    pub fn root(&self) -> &RootContext {
        &self.root
    }

    /// Looks an object up by id, faulting it from the root when not cached.
    pub fn object(&self, id: ObjectId) -> Result<Option<ManagedObject>, ContextError> {
        self.check_thread()?;
        self.state.lock().object(&self.root, id)
    }

    pub fn objects(&self, entity: &str) -> Result<Vec<ManagedObject>, ContextError> {
        self.check_thread()?;
        self.state.lock().objects(&self.root, entity)
    }

    /// Drops the cached copy of one object so the next access re-reads it.
    pub fn refresh(&self, id: ObjectId) -> Result<(), ContextError> {
        self.check_thread()?;
        self.state.lock().refresh(id);
        Ok(())
    }

    /// Drops every cached object.
    pub fn reset(&self) -> Result<(), ContextError> {
        self.check_thread()?;
        self.state.lock().reset();
        Ok(())
    }

    /// Number of objects currently cached.
    pub fn cached_count(&self) -> Result<usize, ContextError> {
        self.check_thread()?;
        Ok(self.state.lock().registered_count())
    }

    /// Applies a persisted change set to cached objects.
    pub(crate) fn merge_saved(&self, saved: &ChangeSet) {
        if self.check_thread().is_err() {
            warn!("event=main_merge module=context status=skipped reason=wrong_thread");
            return;
        }
        self.state.lock().merge_saved(saved);
    }
}
