//! Transaction-safe deferred tasks.
//!
//! A deferred task runs only once no live transaction could still observe
//! the state that existed when the task was registered. Each task is gated
//! by the newest snapshot root at registration time: it becomes runnable
//! when the oldest live root is strictly greater, or unconditionally when
//! the environment shuts down.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::error;

/// A task to run and the gate it waits behind.
struct DeferredTask {
    run: Box<dyn FnOnce() + Send>,
    txn_root: u64,
}

/// FIFO queue of root-gated tasks.
#[derive(Default)]
pub(crate) struct DeferredTaskQueue {
    tasks: Mutex<VecDeque<DeferredTask>>,
}

impl DeferredTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues `task`, gated on `txn_root`.
    pub fn register(&self, task: Box<dyn FnOnce() + Send>, txn_root: u64) {
        self.tasks.lock().push_back(DeferredTask {
            run: task,
            txn_root,
        });
    }

    /// Runs the front tasks whose gate root is below `oldest_live_root`.
    ///
    /// Tasks are dequeued under the lock but run outside it, in FIFO
    /// order. A task that panics is logged and does not block the rest.
    pub fn sweep(&self, oldest_live_root: u64) {
        let mut runnable = Vec::new();
        {
            let mut tasks = self.tasks.lock();
            while let Some(front) = tasks.front() {
                if front.txn_root < oldest_live_root {
                    if let Some(task) = tasks.pop_front() {
                        runnable.push(task);
                    }
                } else {
                    break;
                }
            }
        }
        run_tasks(runnable);
    }

    /// Runs every queued task regardless of its gate. Shutdown path only.
    pub fn drain_all(&self) {
        let drained: Vec<DeferredTask> = self.tasks.lock().drain(..).collect();
        run_tasks(drained);
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }
}

fn run_tasks(tasks: Vec<DeferredTask>) {
    for task in tasks {
        if catch_unwind(AssertUnwindSafe(task.run)).is_err() {
            error!(txn_root = task.txn_root, "deferred task panicked");
        }
    }
}
