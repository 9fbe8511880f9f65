use crate::blocker::{Blocker, CondvarBlocker};
use crate::common::Named;
use crate::config::Config;
use crate::fiber::constants::FiberState;
use crate::fiber::Fiber;
use crate::reactor::Reactor;
use crate::scheduler::current::Worker;
use crate::scheduler::task::TaskEntry;
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::io::{Error, ErrorKind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

pub use task::Task;

mod task;

/// The worker context.
pub mod current;

/// A scheduler spreading fibers and callbacks over a fixed set of worker threads.
///
/// Implementors provide the shared state through [`Scheduler::core`] and decide how
/// idle workers wait and how they are woken up.
pub trait Scheduler: Named + Debug + Send + Sync + 'static {
    /// The shared scheduling state.
    fn core(&self) -> &SchedulerCore;

    /// Wake an idle worker.
    fn tickle(&self);

    /// Body of every worker's idle fiber, returning ends the worker.
    fn idle(&self);

    /// Returns `true` once the workers may exit.
    fn stopping(&self) -> bool {
        self.core().is_stopping()
    }

    /// The reactor behind this scheduler, if it is one.
    fn reactor(&self) -> Option<Arc<Reactor>> {
        None
    }

    /// Queue `task`, pinned to worker `affinity` if set.
    fn post(&self, task: Task, affinity: Option<usize>) {
        if self.core().push(task, affinity) {
            self.tickle();
        }
    }

    /// Queue all `tasks` at once, unpinned.
    fn post_batch(&self, tasks: Vec<Task>) {
        if self.core().push_batch(tasks) {
            self.tickle();
        }
    }

    /// Spawn the worker threads, does nothing if already started.
    ///
    /// # Errors
    /// if a thread can not be spawned.
    fn start(&self) -> std::io::Result<()> {
        self.core().start()
    }

    /// Drain the queue and join the workers.
    /// A scheduler hosting the caller thread must be stopped from that thread.
    fn stop(&self) {
        let core = self.core();
        core.auto_stop.store(true, Ordering::Release);
        let caller = core.caller_fiber();
        if core.thread_count == 0
            && caller.as_ref().map_or(true, |fiber| {
                matches!(fiber.state(), FiberState::Init | FiberState::Term)
            })
        {
            core.stopping.store(true, Ordering::Release);
            if self.stopping() {
                crate::info!("{} stopped", self.get_name());
                return;
            }
        }
        if caller.is_some() {
            assert_eq!(
                core.caller_thread,
                Some(std::thread::current().id()),
                "{} must be stopped on the thread that created it",
                self.get_name()
            );
        }
        core.stopping.store(true, Ordering::Release);
        for _ in 0..core.thread_count {
            self.tickle();
        }
        if let Some(fiber) = caller {
            self.tickle();
            if !self.stopping() && !fiber.state().is_terminal() {
                fiber.resume();
            }
        }
        let threads = std::mem::take(&mut *core.threads());
        let me = std::thread::current().id();
        for handle in threads {
            if handle.thread().id() == me {
                crate::warn!("{} stopped from its own worker", self.get_name());
                continue;
            }
            if handle.join().is_err() {
                crate::error!("{} worker exited abnormally", self.get_name());
            }
        }
        crate::info!("{} stopped", self.get_name());
    }
}

/// State shared by every [`Scheduler`] implementation.
pub struct SchedulerCore {
    name: String,
    me: Weak<dyn Scheduler>,
    queue: Mutex<VecDeque<TaskEntry>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// Spawned threads, the caller thread excluded.
    thread_count: usize,
    caller_thread: Option<ThreadId>,
    caller_fiber: Mutex<Option<Arc<Fiber>>>,
    active: AtomicUsize,
    idle: AtomicUsize,
    stopping: AtomicBool,
    auto_stop: AtomicBool,
}

impl Debug for SchedulerCore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerCore")
            .field("name", &self.name)
            .field("queued", &self.queue().len())
            .field("thread_count", &self.thread_count)
            .field("use_caller", &self.caller_thread.is_some())
            .field("active", &self.active_count())
            .field("idle", &self.idle_count())
            .field("stopping", &self.stopping.load(Ordering::Acquire))
            .finish()
    }
}

impl SchedulerCore {
    /// Create the state of a scheduler with `threads` workers, the calling thread counts
    /// as one of them if `use_caller`. `me` points at the scheduler owning this core.
    ///
    /// An empty `name` is replaced by a generated one.
    ///
    /// # Panics
    /// if `threads` is 0.
    #[must_use]
    pub fn new(threads: usize, use_caller: bool, name: &str, me: Weak<dyn Scheduler>) -> Self {
        assert!(threads > 0, "a scheduler needs at least one thread");
        let name = if name.is_empty() {
            format!("fiberio-scheduler-{}", uuid::Uuid::new_v4())
        } else {
            String::from(name)
        };
        let (thread_count, caller_thread) = if use_caller {
            (threads - 1, Some(std::thread::current().id()))
        } else {
            (threads, None)
        };
        SchedulerCore {
            name,
            me,
            queue: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            thread_count,
            caller_thread,
            caller_fiber: Mutex::new(None),
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            stopping: AtomicBool::new(true),
            auto_stop: AtomicBool::new(false),
        }
    }

    /// Create the scheduling fiber of the caller thread, call once the owner is in its `Arc`.
    ///
    /// # Errors
    /// if the fiber can not be created.
    pub fn init_caller(&self) -> std::io::Result<()> {
        if self.caller_thread.is_none() {
            return Ok(());
        }
        let me = self.me.clone();
        let fiber = Fiber::new(
            move || {
                if let Some(scheduler) = me.upgrade() {
                    run(scheduler, 0);
                }
            },
            0,
        )?;
        *self
            .caller_fiber
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(fiber);
        Ok(())
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<TaskEntry>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn threads(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn caller_fiber(&self) -> Option<Arc<Fiber>> {
        self.caller_fiber
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total number of workers, the caller thread included.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.thread_count + usize::from(self.caller_thread.is_some())
    }

    /// Tasks being executed right now.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Workers inside their idle fiber.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.load(Ordering::Acquire)
    }

    /// Returns `true` if any worker is idle.
    #[must_use]
    pub fn has_idle_threads(&self) -> bool {
        self.idle_count() > 0
    }

    /// The base stop condition: stop requested, nothing queued, nothing running.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.auto_stop.load(Ordering::Acquire)
            && self.stopping.load(Ordering::Acquire)
            && self.queue().is_empty()
            && self.active_count() == 0
    }

    /// Returns `true` if the queue was empty.
    fn push(&self, task: Task, affinity: Option<usize>) -> bool {
        let mut queue = self.queue();
        let need_tickle = queue.is_empty();
        queue.push_back(TaskEntry { task, affinity });
        need_tickle
    }

    fn push_batch(&self, tasks: Vec<Task>) -> bool {
        let mut queue = self.queue();
        let need_tickle = queue.is_empty();
        queue.extend(tasks.into_iter().map(|task| TaskEntry {
            task,
            affinity: None,
        }));
        need_tickle
    }

    /// Returns `true` if worker `index` has something to take right now.
    pub(crate) fn has_runnable(&self, index: usize) -> bool {
        self.queue().iter().any(|entry| entry.runnable_on(index))
    }

    /// Take the first entry worker `index` may run. The flag asks for waking peers.
    fn take(&self, index: usize) -> (Option<TaskEntry>, bool) {
        let mut queue = self.queue();
        let mut skipped_pinned = false;
        let mut found = None;
        for (i, entry) in queue.iter().enumerate() {
            if entry.runnable_on(index) {
                found = Some(i);
                break;
            }
            skipped_pinned |= entry.affinity.is_some_and(|affinity| affinity != index);
        }
        let entry = found.and_then(|i| queue.remove(i));
        if entry.is_some() {
            _ = self.active.fetch_add(1, Ordering::AcqRel);
        }
        let tickle = (skipped_pinned && Config::get_instance().is_tickle_on_affinity_skip())
            || found.is_some_and(|i| i < queue.len());
        (entry, tickle)
    }

    fn start(&self) -> std::io::Result<()> {
        let mut threads = self.threads();
        if !self.stopping.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let scheduler = self
            .me
            .upgrade()
            .ok_or_else(|| Error::new(ErrorKind::Other, "scheduler already dropped"))?;
        let offset = usize::from(self.caller_thread.is_some());
        let bind_cpu = Config::get_instance().is_bind_cpu();
        for i in 0..self.thread_count {
            let index = i + offset;
            let scheduler = scheduler.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("{}-{index}", self.name))
                    .spawn(move || {
                        if bind_cpu {
                            bind_to_core(index);
                        }
                        run(scheduler, index);
                    })?,
            );
        }
        crate::info!("{} started with {} workers", self.name, self.thread_count());
        Ok(())
    }
}

fn bind_to_core(index: usize) {
    if let Some(cores) = core_affinity::get_core_ids() {
        if let Some(core) = cores.get(index % cores.len().max(1)) {
            if !core_affinity::set_for_current(*core) {
                crate::warn!("worker {index} can not be bound to core {}", core.id);
            }
        }
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        _ = self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The worker loop.
fn run(scheduler: Arc<dyn Scheduler>, index: usize) {
    let _worker = Worker::enter(scheduler.clone(), index);
    let hooked = crate::syscall::is_hook_enable();
    crate::syscall::set_hook_enable(true);
    let idle = {
        let idler = scheduler.clone();
        match Fiber::new(move || idler.idle(), 0) {
            Ok(fiber) => fiber,
            Err(e) => {
                crate::error!("{} worker {index} has no idle fiber: {e}", scheduler.get_name());
                crate::syscall::set_hook_enable(hooked);
                return;
            }
        }
    };
    let core = scheduler.core();
    let mut callback_fiber: Option<Arc<Fiber>> = None;
    loop {
        let (entry, tickle) = core.take(index);
        if tickle {
            scheduler.tickle();
        }
        let Some(entry) = entry else {
            if idle.state() == FiberState::Term {
                break;
            }
            _ = core.idle.fetch_add(1, Ordering::AcqRel);
            idle.resume();
            _ = core.idle.fetch_sub(1, Ordering::AcqRel);
            continue;
        };
        let _active = ActiveGuard(&core.active);
        match entry.task {
            Task::Fiber(fiber) => {
                if fiber.state().is_terminal() {
                    continue;
                }
                fiber.resume();
                if fiber.state() == FiberState::Ready {
                    scheduler.post(Task::Fiber(fiber), None);
                }
            }
            Task::Callback(callback) => {
                let fiber = if let Some(fiber) = callback_fiber.take() {
                    fiber.reset(callback);
                    fiber
                } else {
                    match Fiber::new(callback, 0) {
                        Ok(fiber) => fiber,
                        Err(e) => {
                            crate::error!("{} can not run a callback: {e}", scheduler.get_name());
                            continue;
                        }
                    }
                };
                fiber.resume();
                match fiber.state() {
                    FiberState::Ready => scheduler.post(Task::Fiber(fiber), None),
                    state if state.is_terminal() => callback_fiber = Some(fiber),
                    // parked, whoever wakes it owns it now
                    _ => {}
                }
            }
        }
    }
    crate::syscall::set_hook_enable(hooked);
    crate::info!("{} worker {index} exited", scheduler.get_name());
}

/// How long an idle worker of [`SchedulerImpl`] waits before polling the queue again.
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// A plain scheduler, idle workers block on a condvar until tickled.
#[derive(Debug)]
pub struct SchedulerImpl {
    core: SchedulerCore,
    blocker: CondvarBlocker,
}

impl SchedulerImpl {
    /// Create a scheduler, call [`Scheduler::start`] to spawn its threads.
    ///
    /// # Errors
    /// if the scheduling fiber of the caller thread can not be created.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> std::io::Result<Arc<Self>> {
        let scheduler = Arc::new_cyclic(|me: &Weak<SchedulerImpl>| {
            let me: Weak<dyn Scheduler> = me.clone();
            SchedulerImpl {
                core: SchedulerCore::new(threads, use_caller, name, me),
                blocker: CondvarBlocker::default(),
            }
        });
        scheduler.core.init_caller()?;
        Ok(scheduler)
    }
}

impl Named for SchedulerImpl {
    fn get_name(&self) -> &str {
        self.core.name()
    }
}

impl Scheduler for SchedulerImpl {
    fn core(&self) -> &SchedulerCore {
        &self.core
    }

    fn tickle(&self) {
        self.blocker.wake();
    }

    fn idle(&self) {
        while !self.stopping() {
            self.blocker.block(IDLE_WAIT);
            Fiber::yield_to_hold();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        (count.clone(), count)
    }

    #[test]
    fn test_post_callbacks() -> std::io::Result<()> {
        let scheduler = SchedulerImpl::new(2, false, "test_post_callbacks")?;
        scheduler.start()?;
        let (count, c) = counter();
        for _ in 0..100 {
            let c = c.clone();
            scheduler.post(
                Task::callback(move || {
                    _ = c.fetch_add(1, Ordering::SeqCst);
                }),
                None,
            );
        }
        scheduler.stop();
        assert_eq!(100, count.load(Ordering::SeqCst));
        assert_eq!(0, scheduler.core().active_count());
        Ok(())
    }

    #[test]
    fn test_post_batch() -> std::io::Result<()> {
        let scheduler = SchedulerImpl::new(2, false, "")?;
        assert!(scheduler.get_name().starts_with("fiberio-scheduler-"));
        scheduler.start()?;
        let (count, c) = counter();
        let tasks = (0..10)
            .map(|_| {
                let c = c.clone();
                Task::callback(move || {
                    _ = c.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        scheduler.post_batch(tasks);
        scheduler.stop();
        assert_eq!(10, count.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn test_affinity() -> std::io::Result<()> {
        let scheduler = SchedulerImpl::new(3, false, "test_affinity")?;
        scheduler.start()?;
        let misplaced = Arc::new(AtomicUsize::new(0));
        let (count, c) = counter();
        for i in 0..60 {
            let affinity = i % 3;
            let misplaced = misplaced.clone();
            let c = c.clone();
            scheduler.post(
                Task::callback(move || {
                    let index = Worker::current().map(|worker| worker.index());
                    if index != Some(affinity) {
                        _ = misplaced.fetch_add(1, Ordering::SeqCst);
                    }
                    _ = c.fetch_add(1, Ordering::SeqCst);
                }),
                Some(affinity),
            );
        }
        scheduler.stop();
        assert_eq!(60, count.load(Ordering::SeqCst));
        assert_eq!(0, misplaced.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn test_affinity_across_yields() -> std::io::Result<()> {
        let scheduler = SchedulerImpl::new(2, false, "test_affinity_across_yields")?;
        scheduler.start()?;
        let threads = Arc::new(Mutex::new(HashSet::new()));
        let t = threads.clone();
        let fiber = Fiber::new(
            move || {
                for _ in 0..5 {
                    _ = t.lock().unwrap().insert(std::thread::current().id());
                    Fiber::yield_to_hold();
                }
            },
            0,
        )?;
        for _ in 0..6 {
            scheduler.post(Task::from(fiber.clone()), Some(1));
            while fiber.state() == FiberState::Exec {
                std::thread::yield_now();
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        scheduler.stop();
        assert_eq!(FiberState::Term, fiber.state());
        assert_eq!(1, threads.lock().unwrap().len());
        Ok(())
    }

    #[test]
    fn test_use_caller() -> std::io::Result<()> {
        let scheduler = SchedulerImpl::new(2, true, "test_use_caller")?;
        assert_eq!(2, scheduler.core().thread_count());
        scheduler.start()?;
        let caller = std::thread::current().id();
        let (count, c) = counter();
        for _ in 0..10 {
            let c = c.clone();
            scheduler.post(
                Task::callback(move || {
                    assert_eq!(caller, std::thread::current().id());
                    assert_eq!(Some(0), Worker::current().map(|worker| worker.index()));
                    _ = c.fetch_add(1, Ordering::SeqCst);
                }),
                Some(0),
            );
        }
        // pinned to the caller, nothing runs until stop hands the thread over
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(0, count.load(Ordering::SeqCst));
        scheduler.stop();
        assert_eq!(10, count.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn test_yield_ready() -> std::io::Result<()> {
        let scheduler = SchedulerImpl::new(1, true, "test_yield_ready")?;
        let (count, c) = counter();
        let fiber = Fiber::new(
            move || {
                for _ in 0..3 {
                    _ = c.fetch_add(1, Ordering::SeqCst);
                    Fiber::yield_to_ready();
                }
            },
            0,
        )?;
        scheduler.post(Task::from(fiber.clone()), None);
        scheduler.start()?;
        scheduler.stop();
        assert_eq!(3, count.load(Ordering::SeqCst));
        assert_eq!(FiberState::Term, fiber.state());
        Ok(())
    }

    #[test]
    fn test_callback_parks() -> std::io::Result<()> {
        let scheduler = SchedulerImpl::new(1, false, "test_callback_parks")?;
        scheduler.start()?;
        let parked: Arc<Mutex<Option<Arc<Fiber>>>> = Arc::new(Mutex::new(None));
        let (count, c) = counter();
        let p = parked.clone();
        scheduler.post(
            Task::callback(move || {
                *p.lock().unwrap() = Some(Fiber::current());
                Fiber::yield_to_hold();
                _ = c.fetch_add(1, Ordering::SeqCst);
            }),
            None,
        );
        let fiber = loop {
            if let Some(fiber) = parked.lock().unwrap().take() {
                break fiber;
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        while fiber.state() != FiberState::Hold {
            std::thread::yield_now();
        }
        assert_eq!(0, count.load(Ordering::SeqCst));
        scheduler.post(Task::from(fiber), None);
        scheduler.stop();
        assert_eq!(1, count.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn test_panic_in_callback() -> std::io::Result<()> {
        let scheduler = SchedulerImpl::new(1, false, "test_panic_in_callback")?;
        scheduler.start()?;
        scheduler.post(
            Task::callback(|| panic!("test panic, just ignore it")),
            None,
        );
        let (count, c) = counter();
        scheduler.post(
            Task::callback(move || {
                _ = c.fetch_add(1, Ordering::SeqCst);
            }),
            None,
        );
        scheduler.stop();
        assert_eq!(1, count.load(Ordering::SeqCst));
        Ok(())
    }
}
