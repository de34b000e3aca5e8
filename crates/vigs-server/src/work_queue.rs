//! Single-consumer FIFO execution thread.
//!
//! Producers append jobs and never hold the queue lock while a job runs, so a long GPU call on
//! the worker doesn't block the dispatch thread from enqueueing more work. Jobs run one at a
//! time, in submission order.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use tracing::{debug, error};

pub type WorkItem = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct QueueState {
    items: VecDeque<WorkItem>,
    /// Queued plus currently running.
    num_items: usize,
    destroying: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    add_cond: Condvar,
    wait_cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self) {
        let mut state = self.lock();
        loop {
            while state.items.is_empty() {
                if state.destroying {
                    return;
                }
                self.wait_cond.notify_all();
                state = self
                    .add_cond
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }

            let Some(item) = state.items.pop_front() else {
                continue;
            };
            drop(state);

            if catch_unwind(AssertUnwindSafe(item)).is_err() {
                error!("work item panicked");
            }

            state = self.lock();
            state.num_items -= 1;
            if state.num_items == 0 {
                self.wait_cond.notify_all();
            }
        }
    }
}

pub struct WorkQueue {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl WorkQueue {
    pub fn new(name: &str) -> std::io::Result<Self> {
        let shared = Arc::new(Shared::default());
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || worker.run())?;
        let thread_id = handle.thread().id();

        debug!(name, "work queue started");

        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
            thread_id,
        })
    }

    pub fn add_item<F>(&self, item: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.lock();
        if state.destroying {
            error!("work item dropped, queue is shutting down");
            return;
        }
        state.items.push_back(Box::new(item));
        state.num_items += 1;
        self.shared.add_cond.notify_one();
    }

    /// Blocks until every queued job has finished.
    pub fn wait(&self) {
        if thread::current().id() == self.thread_id {
            error!("work queue waited on from its own worker");
            return;
        }

        let mut state = self.shared.lock();
        while state.num_items > 0 {
            state = self
                .shared
                .wait_cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Queued plus running jobs.
    pub fn pending(&self) -> usize {
        self.shared.lock().num_items
    }

    /// Runs the remaining jobs, then stops and joins the worker. Idempotent.
    pub fn destroy(&self) {
        {
            let mut state = self.shared.lock();
            state.destroying = true;
            self.shared.add_cond.notify_all();
        }

        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("work queue thread panicked");
            }
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.destroy();
    }
}
