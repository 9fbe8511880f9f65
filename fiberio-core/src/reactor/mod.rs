use crate::common::Named;
use crate::config::Config;
use crate::fiber::Fiber;
use crate::reactor::selector::{Selector, MAX_EVENTS};
use crate::scheduler::current::Worker;
use crate::scheduler::{Scheduler, SchedulerCore, Task};
use fiberio_timer::{Timer, TimerManager};
use libc::epoll_event;
use std::fmt::{Debug, Formatter};
use std::io::{Error, ErrorKind};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::time::Duration;

mod selector;

/// A readiness direction.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Event {
    #[allow(missing_docs)]
    Read = libc::EPOLLIN as u32,
    #[allow(missing_docs)]
    Write = libc::EPOLLOUT as u32,
}

impl Event {
    const ALL: [Event; 2] = [Event::Read, Event::Write];

    fn bits(self) -> u32 {
        self as u32
    }
}

const READ_WRITE: u32 = libc::EPOLLIN as u32 | libc::EPOLLOUT as u32;

type Waiter = (Arc<dyn Scheduler>, Task);

#[derive(Default)]
struct FdEvents {
    armed: u32,
    read: Option<Waiter>,
    write: Option<Waiter>,
}

impl FdEvents {
    fn waiter(&mut self, event: Event) -> &mut Option<Waiter> {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }

    /// Disarm `event` and hand its waiter back to the scheduler it came from.
    fn trigger(&mut self, event: Event) {
        assert_ne!(0, self.armed & event.bits(), "{event:?} is not armed");
        self.armed &= !event.bits();
        if let Some((scheduler, task)) = self.waiter(event).take() {
            scheduler.post(task, None);
        }
    }
}

struct FdContext(Mutex<FdEvents>);

impl FdContext {
    fn lock(&self) -> MutexGuard<'_, FdEvents> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A [`Scheduler`] whose idle workers wait for fd readiness and timers.
pub struct Reactor {
    core: SchedulerCore,
    me: Weak<Reactor>,
    timers: TimerManager,
    selector: Selector,
    tickle_fds: [RawFd; 2],
    pending_event_count: AtomicUsize,
    contexts: RwLock<Vec<Arc<FdContext>>>,
}

impl Debug for Reactor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("core", &self.core)
            .field("timers", &self.timers)
            .field("selector", &self.selector)
            .field("pending_event_count", &self.pending_event_count())
            .finish()
    }
}

impl Reactor {
    /// Create and start a reactor with `threads` workers, the calling thread counts as
    /// one of them if `use_caller`.
    ///
    /// # Errors
    /// if epoll, the wake pipe or a worker thread can not be created.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> std::io::Result<Arc<Self>> {
        let selector = Selector::new()?;
        let mut tickle_fds = [0; 2];
        if unsafe {
            libc::pipe2(
                tickle_fds.as_mut_ptr(),
                libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        } == -1
        {
            return Err(Error::last_os_error());
        }
        if let Err(e) = selector.register(tickle_fds[0], Event::Read.bits()) {
            for fd in tickle_fds {
                _ = crate::syscall::raw::close(fd);
            }
            return Err(e);
        }
        let reactor = Arc::new_cyclic(|me: &Weak<Reactor>| {
            let scheduler: Weak<dyn Scheduler> = me.clone();
            let tickler = me.clone();
            Reactor {
                core: SchedulerCore::new(threads, use_caller, name, scheduler),
                me: me.clone(),
                timers: TimerManager::new(move || {
                    if let Some(reactor) = tickler.upgrade() {
                        reactor.tickle();
                    }
                }),
                selector,
                tickle_fds,
                pending_event_count: AtomicUsize::new(0),
                contexts: RwLock::new(Vec::new()),
            }
        });
        Reactor::grow(
            &mut reactor.write_contexts(),
            Config::get_instance().get_fd_table_size(),
        );
        reactor.core.init_caller()?;
        reactor.start()?;
        Ok(reactor)
    }

    /// The reactor driving the current worker thread, if any.
    #[must_use]
    pub fn current() -> Option<Arc<Reactor>> {
        Worker::current().and_then(|worker| worker.scheduler().reactor())
    }

    /// Number of armed, not yet fired directions.
    #[must_use]
    pub fn pending_event_count(&self) -> usize {
        self.pending_event_count.load(Ordering::Acquire)
    }

    /// The timers driving this reactor's wait timeout.
    #[must_use]
    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    /// See [`TimerManager::add_timer`].
    pub fn add_timer(
        &self,
        ms: u64,
        callback: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Arc<Timer> {
        self.timers.add_timer(ms, callback, recurring)
    }

    /// See [`TimerManager::add_condition_timer`].
    pub fn add_condition_timer<T>(
        &self,
        ms: u64,
        callback: impl Fn() + Send + Sync + 'static,
        cond: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.timers.add_condition_timer(ms, callback, cond, recurring)
    }

    fn read_contexts(&self) -> RwLockReadGuard<'_, Vec<Arc<FdContext>>> {
        self.contexts.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_contexts(&self) -> RwLockWriteGuard<'_, Vec<Arc<FdContext>>> {
        self.contexts.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn grow(contexts: &mut Vec<Arc<FdContext>>, len: usize) {
        while contexts.len() < len {
            contexts.push(Arc::new(FdContext(Mutex::new(FdEvents::default()))));
        }
    }

    fn context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        let index = usize::try_from(fd).ok()?;
        self.read_contexts().get(index).cloned()
    }

    fn context_or_grow(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if let Some(context) = self.context(fd) {
            return Some(context);
        }
        let index = usize::try_from(fd).ok()?;
        let mut contexts = self.write_contexts();
        Reactor::grow(&mut contexts, (index * 3 / 2).max(index + 1));
        contexts.get(index).cloned()
    }

    /// Point epoll at `armed`, dropping the fd altogether once nothing is left.
    fn update(&self, fd: RawFd, armed: u32) -> std::io::Result<()> {
        if armed == 0 {
            self.selector.deregister(fd)
        } else {
            self.selector.reregister(fd, armed)
        }
    }

    /// Wait for `event` on `fd`. Once ready, `callback` is posted, or without one
    /// the calling fiber is posted again.
    ///
    /// # Errors
    /// if epoll refuses the registration.
    ///
    /// # Panics
    /// if `event` is already armed for `fd`, or no callback is given outside of a fiber.
    pub fn add_event(
        &self,
        fd: RawFd,
        event: Event,
        callback: Option<Box<dyn FnOnce() + Send>>,
    ) -> std::io::Result<()> {
        let context = self
            .context_or_grow(fd)
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, format!("invalid fd {fd}")))?;
        let scheduler: Arc<dyn Scheduler> = match Worker::current() {
            Some(worker) => worker.scheduler().clone(),
            None => self
                .me
                .upgrade()
                .ok_or_else(|| Error::new(ErrorKind::Other, "reactor already dropped"))?,
        };
        let mut events = context.lock();
        assert_eq!(
            0,
            events.armed & event.bits(),
            "fd {fd} already armed for {event:?}"
        );
        assert!(
            callback.is_some() || Fiber::in_fiber(),
            "add_event without a callback outside of a fiber"
        );
        let armed = events.armed | event.bits();
        let result = if events.armed == 0 {
            self.selector.register(fd, armed)
        } else {
            self.selector.reregister(fd, armed)
        };
        if let Err(e) = result {
            crate::error!("{} add_event({fd}, {event:?}) failed: {e}", self.get_name());
            return Err(e);
        }
        _ = self.pending_event_count.fetch_add(1, Ordering::AcqRel);
        events.armed = armed;
        let task = match callback {
            Some(callback) => Task::Callback(callback),
            None => Task::Fiber(Fiber::current()),
        };
        *events.waiter(event) = Some((scheduler, task));
        Ok(())
    }

    /// Disarm `event` on `fd` without waking its waiter.
    pub fn remove_event(&self, fd: RawFd, event: Event) -> bool {
        self.disarm(fd, event, false)
    }

    /// Disarm `event` on `fd` and wake its waiter right away.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        self.disarm(fd, event, true)
    }

    fn disarm(&self, fd: RawFd, event: Event, wake: bool) -> bool {
        let Some(context) = self.context(fd) else {
            return false;
        };
        let mut events = context.lock();
        if events.armed & event.bits() == 0 {
            return false;
        }
        let armed = events.armed & !event.bits();
        if let Err(e) = self.update(fd, armed) {
            crate::error!("{} disarm({fd}, {event:?}) failed: {e}", self.get_name());
            return false;
        }
        _ = self.pending_event_count.fetch_sub(1, Ordering::AcqRel);
        if wake {
            events.trigger(event);
        } else {
            events.armed = armed;
            *events.waiter(event) = None;
        }
        true
    }

    /// Disarm both directions of `fd`, waking every waiter.
    pub fn cancel_all_event(&self, fd: RawFd) -> bool {
        let Some(context) = self.context(fd) else {
            return false;
        };
        let mut events = context.lock();
        if events.armed == 0 {
            return false;
        }
        if let Err(e) = self.selector.deregister(fd) {
            crate::error!("{} cancel_all_event({fd}) failed: {e}", self.get_name());
            return false;
        }
        for event in Event::ALL {
            if events.armed & event.bits() != 0 {
                events.trigger(event);
                _ = self.pending_event_count.fetch_sub(1, Ordering::AcqRel);
            }
        }
        true
    }

    fn drain_tickle(&self) {
        let mut buf = [0u8; 256];
        while crate::syscall::raw::read(self.tickle_fds[0], buf.as_mut_ptr().cast(), buf.len()) > 0
        {}
    }

    fn dispatch(&self, event: epoll_event) {
        let (flags, data) = (event.events, event.u64);
        let Ok(fd) = RawFd::try_from(data) else {
            return;
        };
        if fd == self.tickle_fds[0] {
            self.drain_tickle();
            return;
        }
        let Some(context) = self.context(fd) else {
            return;
        };
        let mut events = context.lock();
        let mut fired = flags;
        if fired & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
            fired |= READ_WRITE & events.armed;
        }
        let fired = fired & events.armed & READ_WRITE;
        if fired == 0 {
            return;
        }
        let left = events.armed & !fired;
        if let Err(e) = self.update(fd, left) {
            crate::error!("{} can not rearm fd {fd}: {e}", self.get_name());
            return;
        }
        for event in Event::ALL {
            if fired & event.bits() != 0 {
                events.trigger(event);
                _ = self.pending_event_count.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        for fd in self.tickle_fds {
            _ = crate::syscall::raw::close(fd);
        }
    }
}

impl Named for Reactor {
    fn get_name(&self) -> &str {
        self.core.name()
    }
}

impl Scheduler for Reactor {
    fn core(&self) -> &SchedulerCore {
        &self.core
    }

    fn tickle(&self) {
        if !self.core.has_idle_threads() {
            return;
        }
        if crate::syscall::raw::write(self.tickle_fds[1], b"T".as_ptr().cast(), 1) != 1 {
            crate::debug!("{} tickle pipe is full", self.get_name());
        }
    }

    fn idle(&self) {
        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let mut expired = Vec::new();
        let index = Worker::current().map_or(0, |worker| worker.index());
        loop {
            if self.stopping() {
                // let the next idle worker notice too
                self.tickle();
                crate::info!("{} idle exits", self.get_name());
                break;
            }
            // posted before this worker counted as idle, so nobody tickled
            if self.core.has_runnable(index) {
                Fiber::yield_to_hold();
                continue;
            }
            let max_wait = Config::get_instance().get_max_wait_ms();
            let timeout = self
                .timers
                .get_next_timer()
                .map_or(max_wait, |next| next.min(max_wait));
            let n = loop {
                match self
                    .selector
                    .select(&mut events, Some(Duration::from_millis(timeout)))
                {
                    Ok(n) => break n,
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) => {
                        crate::error!("{} epoll_wait failed: {e}", self.get_name());
                        break 0;
                    }
                }
            };
            self.timers.list_expired_timer(&mut expired);
            if !expired.is_empty() {
                self.post_batch(
                    expired
                        .drain(..)
                        .map(|callback| Task::callback(move || callback()))
                        .collect(),
                );
            }
            for event in &events[..n] {
                self.dispatch(*event);
            }
            Fiber::yield_to_hold();
        }
    }

    fn stopping(&self) -> bool {
        !self.timers.has_timer() && self.pending_event_count() == 0 && self.core.is_stopping()
    }

    fn reactor(&self) -> Option<Arc<Reactor>> {
        self.me.upgrade()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socketpair() -> [RawFd; 2] {
        let mut fds = [0; 2];
        assert_eq!(0, unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
                0,
                fds.as_mut_ptr(),
            )
        });
        fds
    }

    fn close(fds: [RawFd; 2]) {
        for fd in fds {
            _ = unsafe { libc::close(fd) };
        }
    }

    fn wait_for(count: &AtomicUsize, expected: usize) {
        let start = fiberio_timer::now_ms();
        while count.load(Ordering::SeqCst) < expected && fiberio_timer::now_ms() - start < 5000 {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_readable_callback() -> std::io::Result<()> {
        let reactor = Reactor::new(2, false, "test_readable_callback")?;
        let fds = socketpair();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        reactor.add_event(
            fds[0],
            Event::Read,
            Some(Box::new(move || {
                _ = c.fetch_add(1, Ordering::SeqCst);
            })),
        )?;
        assert_eq!(1, reactor.pending_event_count());
        assert_eq!(1, unsafe { libc::write(fds[1], b"x".as_ptr().cast(), 1) });
        wait_for(&count, 1);
        assert_eq!(1, count.load(Ordering::SeqCst));
        assert_eq!(0, reactor.pending_event_count());
        reactor.stop();
        close(fds);
        Ok(())
    }

    #[test]
    fn test_cancel_event_fires_once() -> std::io::Result<()> {
        let reactor = Reactor::new(1, false, "test_cancel_event_fires_once")?;
        let fds = socketpair();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        reactor.add_event(
            fds[0],
            Event::Read,
            Some(Box::new(move || {
                _ = c.fetch_add(1, Ordering::SeqCst);
            })),
        )?;
        assert!(reactor.cancel_event(fds[0], Event::Read));
        assert!(!reactor.cancel_event(fds[0], Event::Read));
        assert_eq!(0, reactor.pending_event_count());
        wait_for(&count, 1);
        // readiness after the cancel must not deliver again
        assert_eq!(1, unsafe { libc::write(fds[1], b"x".as_ptr().cast(), 1) });
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(1, count.load(Ordering::SeqCst));
        reactor.stop();
        close(fds);
        Ok(())
    }

    #[test]
    fn test_remove_event() -> std::io::Result<()> {
        let reactor = Reactor::new(1, false, "test_remove_event")?;
        let fds = socketpair();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        reactor.add_event(
            fds[0],
            Event::Write,
            Some(Box::new(move || {
                _ = c.fetch_add(1, Ordering::SeqCst);
            })),
        )?;
        // writable at once, the read side never fires on its own
        let r = count.clone();
        reactor.add_event(
            fds[0],
            Event::Read,
            Some(Box::new(move || {
                _ = r.fetch_add(100, Ordering::SeqCst);
            })),
        )?;
        assert!(reactor.remove_event(fds[0], Event::Read));
        assert!(!reactor.remove_event(fds[0], Event::Read));
        wait_for(&count, 1);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(1, count.load(Ordering::SeqCst));
        assert_eq!(0, reactor.pending_event_count());
        assert!(!reactor.cancel_all_event(fds[0]));
        reactor.stop();
        close(fds);
        Ok(())
    }

    #[test]
    fn test_cancel_all_event() -> std::io::Result<()> {
        let reactor = Reactor::new(1, false, "test_cancel_all_event")?;
        let fds = socketpair();
        let count = Arc::new(AtomicUsize::new(0));
        for event in [Event::Read, Event::Write] {
            let c = count.clone();
            // fill the write side first so neither direction fires on its own
            if event == Event::Write {
                let buf = [0u8; 4096];
                while unsafe { libc::write(fds[0], buf.as_ptr().cast(), buf.len()) } > 0 {}
            }
            reactor.add_event(
                fds[0],
                event,
                Some(Box::new(move || {
                    _ = c.fetch_add(1, Ordering::SeqCst);
                })),
            )?;
        }
        assert_eq!(2, reactor.pending_event_count());
        assert!(reactor.cancel_all_event(fds[0]));
        wait_for(&count, 2);
        assert_eq!(2, count.load(Ordering::SeqCst));
        assert_eq!(0, reactor.pending_event_count());
        reactor.stop();
        close(fds);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "already armed")]
    fn test_double_add_event() {
        let reactor = Reactor::new(1, false, "test_double_add_event").unwrap();
        let fds = socketpair();
        reactor
            .add_event(fds[0], Event::Read, Some(Box::new(|| {})))
            .unwrap();
        _ = reactor.add_event(fds[0], Event::Read, Some(Box::new(|| {})));
    }

    #[test]
    fn test_add_event_bad_fd() -> std::io::Result<()> {
        let reactor = Reactor::new(1, false, "test_add_event_bad_fd")?;
        assert!(reactor
            .add_event(-1, Event::Read, Some(Box::new(|| {})))
            .is_err());
        // a closed descriptor is refused by epoll
        let fds = socketpair();
        close(fds);
        assert!(reactor
            .add_event(fds[0], Event::Read, Some(Box::new(|| {})))
            .is_err());
        assert_eq!(0, reactor.pending_event_count());
        reactor.stop();
        Ok(())
    }

    #[test]
    fn test_fiber_waits_readable() -> std::io::Result<()> {
        let reactor = Reactor::new(1, false, "test_fiber_waits_readable")?;
        let fds = socketpair();
        let (tx, rx) = std::sync::mpsc::channel();
        let r = reactor.clone();
        let fd = fds[0];
        reactor.post(
            Task::callback(move || {
                r.add_event(fd, Event::Read, None).unwrap();
                tx.send("armed").unwrap();
                Fiber::yield_to_hold();
                let mut buf = [0u8; 8];
                let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
                tx.send(if n == 2 { "read" } else { "failed" }).unwrap();
            }),
            None,
        );
        assert_eq!("armed", rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert_eq!(2, unsafe { libc::write(fds[1], b"hi".as_ptr().cast(), 2) });
        assert_eq!("read", rx.recv_timeout(Duration::from_secs(5)).unwrap());
        reactor.stop();
        close(fds);
        Ok(())
    }

    #[test]
    fn test_timers_drive_idle() -> std::io::Result<()> {
        let reactor = Reactor::new(2, false, "test_timers_drive_idle")?;
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let start = fiberio_timer::now_ms();
        let timer = reactor.add_timer(
            20,
            move || {
                _ = c.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );
        wait_for(&count, 3);
        assert!(timer.cancel());
        assert!(fiberio_timer::now_ms() - start >= 60);
        let c = count.clone();
        _ = reactor.add_timer(
            50,
            move || {
                _ = c.fetch_add(100, Ordering::SeqCst);
            },
            false,
        );
        // stop waits for the pending timer
        reactor.stop();
        assert!(count.load(Ordering::SeqCst) >= 103);
        Ok(())
    }

    #[test]
    fn test_use_caller() -> std::io::Result<()> {
        let reactor = Reactor::new(1, true, "test_use_caller")?;
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        _ = reactor.add_timer(
            30,
            move || {
                _ = c.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        assert!(Reactor::current().is_none());
        let r = reactor.clone();
        reactor.post(
            Task::callback(move || {
                assert!(Arc::ptr_eq(&r, &Reactor::current().unwrap()));
            }),
            None,
        );
        reactor.stop();
        assert_eq!(1, count.load(Ordering::SeqCst));
        Ok(())
    }
}
