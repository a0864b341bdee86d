//! Save orchestration.
//!
//! # Responsibility
//! - Run a caller's mutation against a fresh work context on the root queue.
//! - Cascade the resulting changes: work context → root context → store.
//! - Deliver exactly one completion per request on the main thread.
//!
//! # Invariants
//! - `submit` never blocks its caller.
//! - Requests against one root run in submission order.
//! - Every submitted request completes, including on panic or setup misuse.
//! - A failure at any step stops the cascade; nothing reaches the store
//!   unless the whole change set does.
//!
//! Requests move through `SavePhase` in order:
//! `Idle → WorkScheduled → MutationRunning → SavingRootward → Completing → Done`.

use crate::context::{ContextError, MainContext, RootContext, RootState, WorkContext};
use crate::db::StoreError;
use crate::dispatch::MainDispatcher;
use crate::logging::sanitize_message;
use crate::model::changes::ChangeSet;
use crate::model::object::ObjectId;
use crate::model::schema::ValidationError;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::any::Any;
use std::cell::Cell;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

const MAX_PANIC_MESSAGE_CHARS: usize = 160;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static MUTATION_DEPTH: Cell<u32> = const { Cell::new(0) };
}

pub type SaveResult = Result<SaveSummary, SaveError>;
pub(crate) type Mutation =
    Box<dyn FnOnce(&mut WorkContext<'_>) -> Result<(), ContextError> + Send + 'static>;
pub(crate) type Completion = Box<dyn FnOnce(SaveResult) + Send + 'static>;

/// Where in the cascade a save failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStage {
    /// Saving the work context into the root context.
    Root,
    /// Saving the root context into the store.
    Store,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavePhase {
    Idle,
    WorkScheduled,
    MutationRunning,
    SavingRootward,
    Completing,
    Done,
}

impl SavePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::WorkScheduled => "work_scheduled",
            Self::MutationRunning => "mutation_running",
            Self::SavingRootward => "saving_rootward",
            Self::Completing => "completing",
            Self::Done => "done",
        }
    }
}

/// Why a save did not reach the store.
///
/// Failures with `stage == SaveStage::Store` happen after the work context
/// was already merged into the root context. Those changes stay pending in
/// the root (visible through `RootContext::has_changes`) and are retried by
/// the next root save; `RootContext::rollback` discards them. The store
/// itself never holds a partial change set.
#[derive(Debug)]
pub enum SaveError {
    /// `save` was called before any stack was set up.
    NotSetUp,
    /// `save` was called from inside a running mutation.
    NestedSave,
    /// A blocking save was requested off the main thread.
    WrongThread,
    /// The root queue no longer accepts work.
    QueueClosed,
    /// The mutation returned an error; nothing was saved.
    Aborted(ContextError),
    MutationPanicked(String),
    /// Every constraint the pending objects violate.
    Validation(Vec<ValidationError>),
    MergeConflict {
        stage: SaveStage,
        objects: Vec<ObjectId>,
    },
    Store {
        stage: SaveStage,
        source: StoreError,
    },
}

impl Display for SaveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotSetUp => write!(f, "save requested before stack setup"),
            Self::NestedSave => write!(f, "save requested from inside a running mutation"),
            Self::WrongThread => write!(f, "blocking save requested off the main thread"),
            Self::QueueClosed => write!(f, "root queue is closed"),
            Self::Aborted(err) => write!(f, "mutation aborted: {err}"),
            Self::MutationPanicked(message) => write!(f, "mutation panicked: {message}"),
            Self::Validation(errors) => {
                write!(f, "{} validation error(s)", errors.len())?;
                for error in errors {
                    write!(f, "; {error}")?;
                }
                Ok(())
            }
            Self::MergeConflict { stage, objects } => write!(
                f,
                "merge conflict saving into {} for {} object(s)",
                stage_label(*stage),
                objects.len()
            ),
            Self::Store { stage, source } => {
                write!(f, "saving into {} failed: {source}", stage_label(*stage))
            }
        }
    }
}

impl Error for SaveError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Aborted(err) => Some(err),
            Self::Validation(errors) => errors.first().map(|err| err as &(dyn Error + 'static)),
            Self::Store { source, .. } => Some(source),
            _ => None,
        }
    }
}

fn stage_label(stage: SaveStage) -> &'static str {
    match stage {
        SaveStage::Root => "root context",
        SaveStage::Store => "store",
    }
}

/// What a successful save persisted.
#[derive(Debug, Clone, Default)]
pub struct SaveSummary {
    request_id: u64,
    changes: ChangeSet,
}

impl SaveSummary {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Persisted objects with their new versions.
    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    /// `true` for saves whose mutation changed nothing.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn inserted_ids(&self) -> Vec<ObjectId> {
        self.changes.inserted_ids()
    }
}

/// Whether the current thread is running a save mutation.
pub fn in_mutation() -> bool {
    MUTATION_DEPTH.with(|depth| depth.get() > 0)
}

struct MutationScope;

impl MutationScope {
    fn enter() -> Self {
        MUTATION_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self
    }
}

impl Drop for MutationScope {
    fn drop(&mut self) {
        MUTATION_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Completion shared between the queued job and the submit path, so it
/// fires even when the job can no longer be queued.
#[derive(Clone)]
struct CompletionSlot(Arc<Mutex<Option<Completion>>>);

impl CompletionSlot {
    fn new(completion: Completion) -> Self {
        Self(Arc::new(Mutex::new(Some(completion))))
    }

    fn take(&self) -> Option<Completion> {
        self.0.lock().take()
    }
}

/// Contexts a request runs against.
pub(crate) struct SaveTarget {
    pub(crate) root: RootContext,
    pub(crate) main: MainContext,
}

/// Schedules one save request. Never blocks.
pub(crate) fn submit(
    target: Option<SaveTarget>,
    dispatcher: MainDispatcher,
    mutation: Mutation,
    completion: Completion,
) {
    let request_id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
    let started_at = Instant::now();
    log_phase(request_id, SavePhase::Idle);

    if in_mutation() {
        warn!("event=save module=save status=rejected request={request_id} reason=nested_save");
        deliver(
            &dispatcher,
            None,
            request_id,
            started_at,
            Err(SaveError::NestedSave),
            Some(completion),
        );
        return;
    }
    let Some(SaveTarget { root, main }) = target else {
        warn!("event=save module=save status=rejected request={request_id} reason=not_set_up");
        deliver(
            &dispatcher,
            None,
            request_id,
            started_at,
            Err(SaveError::NotSetUp),
            Some(completion),
        );
        return;
    };

    let slot = CompletionSlot::new(completion);
    let job_slot = slot.clone();
    let job_dispatcher = dispatcher.clone();
    log_phase(request_id, SavePhase::WorkScheduled);

    let queued = root.perform(move |state| {
        let outcome = run_cascade(request_id, state, mutation);
        deliver(
            &job_dispatcher,
            Some(main),
            request_id,
            started_at,
            outcome,
            job_slot.take(),
        );
    });
    if queued.is_err() {
        deliver(
            &dispatcher,
            None,
            request_id,
            started_at,
            Err(SaveError::QueueClosed),
            slot.take(),
        );
    }
}

fn run_cascade(request_id: u64, state: &mut RootState, mutation: Mutation) -> SaveResult {
    log_phase(request_id, SavePhase::MutationRunning);
    let mut work = WorkContext::new(state);
    let mutated = {
        let _scope = MutationScope::enter();
        catch_unwind(AssertUnwindSafe(|| mutation(&mut work)))
    };
    match mutated {
        Ok(Ok(())) => {}
        Ok(Err(err)) => return Err(SaveError::Aborted(err)),
        Err(payload) => return Err(SaveError::MutationPanicked(panic_message(payload))),
    }

    let work = work.into_state();
    if !work.has_changes() {
        return Ok(SaveSummary {
            request_id,
            changes: ChangeSet::default(),
        });
    }

    log_phase(request_id, SavePhase::SavingRootward);
    let errors = work.validate();
    if !errors.is_empty() {
        return Err(SaveError::Validation(errors));
    }
    state.merge_child(work.changes())?;
    let changes = state.save()?;

    Ok(SaveSummary {
        request_id,
        changes,
    })
}

fn deliver(
    dispatcher: &MainDispatcher,
    main: Option<MainContext>,
    request_id: u64,
    started_at: Instant,
    outcome: SaveResult,
    completion: Option<Completion>,
) {
    log_phase(request_id, SavePhase::Completing);
    dispatcher.dispatch(Box::new(move || {
        if let (Some(main), Ok(summary)) = (&main, &outcome) {
            main.merge_saved(summary.changes());
        }
        match &outcome {
            Ok(summary) => info!(
                "event=save module=save status=ok request={} objects={} duration_ms={}",
                request_id,
                summary.changes().len(),
                started_at.elapsed().as_millis()
            ),
            Err(err) => warn!(
                "event=save module=save status=error request={} duration_ms={} error={}",
                request_id,
                started_at.elapsed().as_millis(),
                err
            ),
        }
        if let Some(completion) = completion {
            completion(outcome);
        }
        log_phase(request_id, SavePhase::Done);
    }));
}

fn log_phase(request_id: u64, phase: SavePhase) {
    debug!(
        "event=save_phase module=save request={} phase={}",
        request_id,
        phase.as_str()
    );
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let message = if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    };
    sanitize_message(&message, MAX_PANIC_MESSAGE_CHARS)
}
