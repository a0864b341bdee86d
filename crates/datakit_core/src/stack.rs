//! The `DataKit` stack: coordinator, root context and main context.
//!
//! # Responsibility
//! - Build a stack from a store description and swap it in atomically.
//! - Expose the contexts and the save entry points.
//!
//! # Invariants
//! - Contexts are reachable only after a successful setup.
//! - A failed setup leaves no stack behind, not even the previous one.
//! - Saves already submitted keep the stack they were submitted against.

use crate::config::StackOptions;
use crate::context::state::ContextState;
use crate::context::{ContextError, MainContext, RootContext, WorkContext};
use crate::coordinator::{SetupError, StoreCoordinator, StoreDescriptor, StoreKind};
use crate::dispatch::MainQueue;
use crate::model::schema::Schema;
use crate::save::{self, SaveError, SaveResult, SaveTarget};
use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Stack {
    coordinator: Arc<StoreCoordinator>,
    root: RootContext,
    main: MainContext,
}

/// Entry point owning one persistence stack and the main queue.
///
/// The thread that creates a `DataKit` is its main thread: completions run
/// there, and only there, when it pumps the queue.
pub struct DataKit {
    options: StackOptions,
    main_queue: MainQueue,
    stack: RwLock<Option<Arc<Stack>>>,
}

impl std::fmt::Debug for DataKit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKit")
            .field("options", &self.options)
            .field("main_thread", &self.main_queue.main_thread())
            .field("set_up", &self.is_set_up())
            .finish()
    }
}

impl DataKit {
    pub fn new() -> Self {
        Self::with_options(StackOptions::default())
    }

    pub fn with_options(options: StackOptions) -> Self {
        Self {
            options,
            main_queue: MainQueue::new(),
            stack: RwLock::new(None),
        }
    }

    pub fn options(&self) -> &StackOptions {
        &self.options
    }

    pub fn is_main_thread(&self) -> bool {
        self.main_queue.is_main_thread()
    }

    pub fn is_set_up(&self) -> bool {
        self.stack.read().is_some()
    }

    /// File store named after the application, automigrating, with every
    /// registered model.
    pub fn setup_automigrating_stack(&self) -> Result<(), SetupError> {
        let name = self.options.default_store_name().to_string();
        self.setup_stack(&name, true, None)
    }

    /// File store `<name>.sqlite` in the resolved store directory.
    ///
    /// `schema == None` merges every registered model.
    pub fn setup_stack(
        &self,
        name: &str,
        automigrating: bool,
        schema: Option<Schema>,
    ) -> Result<(), SetupError> {
        let Some(directory) = self.options.resolve_store_directory() else {
            self.clear_stack();
            warn!(
                "event=stack_setup module=stack status=error store={name} error_code=no_store_directory"
            );
            return Err(SetupError::NoStoreDirectory);
        };
        self.setup_stack_at(directory, name, automigrating, schema)
    }

    /// File store `<name>.sqlite` inside `directory`.
    pub fn setup_stack_at(
        &self,
        directory: impl Into<PathBuf>,
        name: &str,
        automigrating: bool,
        schema: Option<Schema>,
    ) -> Result<(), SetupError> {
        self.install(StoreDescriptor::file(directory, name, automigrating, schema))
    }

    /// Fresh, empty in-memory store with every registered model.
    pub fn setup_in_memory_stack(&self) -> Result<(), SetupError> {
        self.setup_in_memory_stack_with_schema(None)
    }

    pub fn setup_in_memory_stack_with_schema(
        &self,
        schema: Option<Schema>,
    ) -> Result<(), SetupError> {
        self.install(StoreDescriptor::in_memory(schema))
    }

    fn install(&self, descriptor: StoreDescriptor) -> Result<(), SetupError> {
        let started_at = Instant::now();
        let name = descriptor.name.clone();
        let in_memory = descriptor.kind == StoreKind::InMemory;

        match self.build_stack(descriptor) {
            Ok(stack) => {
                *self.stack.write() = Some(Arc::new(stack));
                info!(
                    "event=stack_setup module=stack status=ok store={} in_memory={} duration_ms={}",
                    name,
                    in_memory,
                    started_at.elapsed().as_millis()
                );
                Ok(())
            }
            Err(err) => {
                self.clear_stack();
                warn!(
                    "event=stack_setup module=stack status=error store={} in_memory={} error={}",
                    name, in_memory, err
                );
                Err(err)
            }
        }
    }

    fn build_stack(&self, descriptor: StoreDescriptor) -> Result<Stack, SetupError> {
        let label = format!("{}-{}", self.options.root_queue_label, descriptor.name);
        let coordinator = Arc::new(StoreCoordinator::open(descriptor)?);
        let root = RootContext::spawn(
            Arc::clone(&coordinator),
            self.options.merge_policy,
            &label,
        )?;
        let main = MainContext::new(
            ContextState::new(Arc::clone(coordinator.schema())),
            root.clone(),
            self.main_queue.main_thread(),
        );
        Ok(Stack {
            coordinator,
            root,
            main,
        })
    }

    fn clear_stack(&self) {
        *self.stack.write() = None;
    }

    fn current(&self) -> Result<Arc<Stack>, ContextError> {
        self.stack.read().clone().ok_or(ContextError::NotSetUp)
    }

    pub fn coordinator(&self) -> Result<Arc<StoreCoordinator>, ContextError> {
        Ok(Arc::clone(&self.current()?.coordinator))
    }

    pub fn root_context(&self) -> Result<RootContext, ContextError> {
        Ok(self.current()?.root.clone())
    }

    pub fn main_context(&self) -> Result<MainContext, ContextError> {
        Ok(self.current()?.main.clone())
    }

    /// Schedules `mutation` on the root queue and returns immediately.
    ///
    /// `completion` runs exactly once, on the main thread, the next time it
    /// pumps the main queue after the cascade finished.
    pub fn save<M, C>(&self, mutation: M, completion: C)
    where
        M: FnOnce(&mut WorkContext<'_>) -> Result<(), ContextError> + Send + 'static,
        C: FnOnce(SaveResult) + Send + 'static,
    {
        let target = self.stack.read().as_ref().map(|stack| SaveTarget {
            root: stack.root.clone(),
            main: stack.main.clone(),
        });
        save::submit(
            target,
            self.main_queue.dispatcher(),
            Box::new(mutation),
            Box::new(completion),
        );
    }

    /// Saves and pumps the main queue until this save's result arrives.
    ///
    /// Other completions that become due meanwhile run too, in order.
    ///
    /// # Errors
    /// - `SaveError::WrongThread` off the main thread.
    /// - Every error `save` delivers to its completion.
    pub fn save_and_wait<M>(&self, mutation: M) -> SaveResult
    where
        M: FnOnce(&mut WorkContext<'_>) -> Result<(), ContextError> + Send + 'static,
    {
        if !self.main_queue.is_main_thread() {
            return Err(SaveError::WrongThread);
        }
        let slot: Arc<Mutex<Option<SaveResult>>> = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&slot);
        self.save(mutation, move |result| {
            *sink.lock() = Some(result);
        });

        self.main_queue
            .run_until(|| slot.lock().is_some())
            .map_err(|_| SaveError::WrongThread)?;
        let result = slot.lock().take();
        result.unwrap_or(Err(SaveError::QueueClosed))
    }

    /// Runs every completion already due. Main thread only.
    pub fn process_main_queue(&self) -> Result<usize, ContextError> {
        self.main_queue.process_pending()
    }

    /// Waits up to `timeout` for completions, then runs every due one.
    pub fn wait_for_main_queue(&self, timeout: Duration) -> Result<usize, ContextError> {
        self.main_queue.wait(timeout)
    }
}

impl Default for DataKit {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::DataKit;
    use crate::context::ContextError;
    use crate::coordinator::SetupError;
    use crate::model::schema::{AttributeDescription, AttributeType, EntityDescription, Schema};
    use crate::save::SaveError;

    fn task_schema() -> Schema {
        Schema::new(1).with_entity(
            EntityDescription::new("Task")
                .with_attribute(AttributeDescription::required("title", AttributeType::Text)),
        )
    }

    #[test]
    fn accessors_fail_before_setup() {
        let kit = DataKit::new();
        assert!(!kit.is_set_up());
        assert!(matches!(kit.coordinator(), Err(ContextError::NotSetUp)));
        assert!(matches!(kit.root_context(), Err(ContextError::NotSetUp)));
        assert!(matches!(kit.main_context(), Err(ContextError::NotSetUp)));
    }

    #[test]
    fn failed_setup_discards_previous_stack() {
        let kit = DataKit::new();
        kit.setup_in_memory_stack_with_schema(Some(task_schema()))
            .unwrap();
        assert!(kit.is_set_up());

        let err = kit
            .setup_in_memory_stack_with_schema(Some(Schema::new(1)))
            .unwrap_err();
        assert!(matches!(err, SetupError::EmptySchema));
        assert!(!kit.is_set_up());
    }

    #[test]
    fn save_and_wait_off_main_thread_is_rejected() {
        let kit = DataKit::new();
        kit.setup_in_memory_stack_with_schema(Some(task_schema()))
            .unwrap();

        std::thread::scope(|scope| {
            let result = scope
                .spawn(|| kit.save_and_wait(|_| Ok(())))
                .join()
                .unwrap();
            assert!(matches!(result, Err(SaveError::WrongThread)));
        });
    }

    #[test]
    fn root_queue_is_labelled_after_store() {
        let kit = DataKit::new();
        kit.setup_in_memory_stack_with_schema(Some(task_schema()))
            .unwrap();
        assert_eq!(kit.root_context().unwrap().label(), "datakit-root-memory");
    }
}
