//! Main-thread executor.
//!
//! # Responsibility
//! - Collect work posted from background queues for the main thread.
//! - Run that work only when the main thread pumps the queue.
//!
//! # Invariants
//! - Tasks run in the order they were posted.
//! - Tasks only ever run on the thread that created the queue.
//! - The receiver lock is released before a task runs, so tasks may pump
//!   the queue again.

use crate::context::ContextError;
use parking_lot::Mutex;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

pub(crate) type MainTask = Box<dyn FnOnce() + Send + 'static>;

/// Queue of closures that must run on the main thread.
pub struct MainQueue {
    sender: Sender<MainTask>,
    receiver: Mutex<Receiver<MainTask>>,
    main_thread: ThreadId,
}

/// Sending half of a `MainQueue`; usable from any thread.
#[derive(Clone)]
pub(crate) struct MainDispatcher {
    sender: Sender<MainTask>,
}

impl MainDispatcher {
    pub(crate) fn dispatch(&self, task: MainTask) {
        // The queue owns a sender itself, so this only fails once the
        // owning `DataKit` is gone and nobody could run the task anyway.
        let _ = self.sender.send(task);
    }
}

impl MainQueue {
    /// Creates a queue bound to the calling thread.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
            main_thread: thread::current().id(),
        }
    }

    pub fn main_thread(&self) -> ThreadId {
        self.main_thread
    }

    pub fn is_main_thread(&self) -> bool {
        thread::current().id() == self.main_thread
    }

    pub(crate) fn dispatcher(&self) -> MainDispatcher {
        MainDispatcher {
            sender: self.sender.clone(),
        }
    }

    fn check_thread(&self) -> Result<(), ContextError> {
        if self.is_main_thread() {
            Ok(())
        } else {
            Err(ContextError::WrongThread)
        }
    }

    /// Runs every task that is already queued. Returns how many ran.
    pub fn process_pending(&self) -> Result<usize, ContextError> {
        self.check_thread()?;
        let mut ran = 0;
        loop {
            let next = self.receiver.lock().try_recv().ok();
            match next {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return Ok(ran),
            }
        }
    }

    /// Waits up to `timeout` for at least one task, then drains the queue.
    pub fn wait(&self, timeout: Duration) -> Result<usize, ContextError> {
        self.check_thread()?;
        let deadline = Instant::now() + timeout;
        let first = self
            .receiver
            .lock()
            .recv_timeout(deadline.saturating_duration_since(Instant::now()));
        match first {
            Ok(task) => {
                task();
                Ok(1 + self.process_pending()?)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Ok(0),
        }
    }

    /// Runs tasks, blocking between them, until `done` returns `true`.
    pub(crate) fn run_until(&self, done: impl Fn() -> bool) -> Result<usize, ContextError> {
        self.check_thread()?;
        let mut ran = 0;
        while !done() {
            let next = self.receiver.lock().recv();
            match next {
                Ok(task) => {
                    task();
                    ran += 1;
                }
                Err(_) => break,
            }
        }
        Ok(ran)
    }
}

impl Default for MainQueue {
    fn default() -> Self {
        Self::new()
    }
}
