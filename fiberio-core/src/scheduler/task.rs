use crate::fiber::Fiber;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Something a worker can run.
pub enum Task {
    /// Resume this fiber.
    Fiber(Arc<Fiber>),
    /// Run this callback on the worker's callback fiber.
    Callback(Box<dyn FnOnce() + Send>),
}

impl Task {
    /// Wrap a callback.
    pub fn callback(callback: impl FnOnce() + Send + 'static) -> Self {
        Task::Callback(Box::new(callback))
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(fiber: Arc<Fiber>) -> Self {
        Task::Fiber(fiber)
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Task::Fiber(fiber) => f.debug_tuple("Fiber").field(fiber).finish(),
            Task::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// A queued task, optionally pinned to one worker.
#[derive(Debug)]
pub(crate) struct TaskEntry {
    pub(crate) task: Task,
    pub(crate) affinity: Option<usize>,
}

impl TaskEntry {
    /// Returns `true` if the worker at `index` may take this entry now.
    pub(crate) fn runnable_on(&self, index: usize) -> bool {
        if self.affinity.is_some_and(|affinity| affinity != index) {
            return false;
        }
        match &self.task {
            Task::Fiber(fiber) => fiber.state() != crate::fiber::constants::FiberState::Exec,
            Task::Callback(_) => true,
        }
    }
}
