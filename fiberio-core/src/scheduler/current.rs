use crate::scheduler::Scheduler;
use std::cell::RefCell;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

thread_local! {
    static WORKER: RefCell<Option<Worker>> = const { RefCell::new(None) };
}

/// The context of a thread running a worker loop: which scheduler, which worker.
#[derive(Clone)]
pub struct Worker {
    scheduler: Arc<dyn Scheduler>,
    index: usize,
}

impl Debug for Worker {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("scheduler", &self.scheduler.get_name())
            .field("index", &self.index)
            .finish()
    }
}

impl Worker {
    pub(crate) fn enter(scheduler: Arc<dyn Scheduler>, index: usize) -> WorkerGuard {
        let previous = WORKER.with(|worker| worker.replace(Some(Worker { scheduler, index })));
        WorkerGuard { previous }
    }

    /// The worker running on this thread, if any.
    #[must_use]
    pub fn current() -> Option<Worker> {
        WORKER.with(|worker| worker.borrow().clone())
    }

    /// The scheduler this worker belongs to.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// The index of this worker, the thread that created a caller-hosting scheduler is 0.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Restores the previous worker context on drop.
#[derive(Debug)]
pub(crate) struct WorkerGuard {
    previous: Option<Worker>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        _ = WORKER.try_with(|worker| *worker.borrow_mut() = previous);
    }
}
