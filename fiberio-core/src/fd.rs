use crate::config::DEFAULT_FD_TABLE_SIZE;
use crate::reactor::Reactor;
use nix::sys::stat::{fstat, SFlag};
use once_cell::sync::Lazy;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

/// Which socket timeout applies to an operation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TimeoutKind {
    /// `SO_RCVTIMEO`
    Recv,
    /// `SO_SNDTIMEO`
    Send,
}

impl TimeoutKind {
    /// Map a `SOL_SOCKET` option name, `None` if it is not a timeout.
    #[must_use]
    pub fn from_optname(optname: libc::c_int) -> Option<Self> {
        match optname {
            libc::SO_RCVTIMEO => Some(TimeoutKind::Recv),
            libc::SO_SNDTIMEO => Some(TimeoutKind::Send),
            _ => None,
        }
    }
}

const NO_TIMEOUT: u64 = u64::MAX;

/// What the hooks know about one descriptor.
#[derive(Debug)]
pub struct FdCtx {
    fd: RawFd,
    init: bool,
    socket: bool,
    sys_nonblock: bool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout: AtomicU64,
    send_timeout: AtomicU64,
    waiters: Mutex<Vec<Weak<Reactor>>>,
}

impl FdCtx {
    /// Inspect `fd`, a socket is switched to non-blocking mode behind the user's back.
    #[must_use]
    pub fn new(fd: RawFd) -> Self {
        let (init, socket) = match fstat(fd) {
            Ok(stat) => (
                true,
                SFlag::from_bits_truncate(stat.st_mode & SFlag::S_IFMT.bits()) == SFlag::S_IFSOCK,
            ),
            Err(_) => (false, false),
        };
        let sys_nonblock = socket && crate::syscall::common::set_non_blocking(fd);
        FdCtx {
            fd,
            init,
            socket,
            sys_nonblock,
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout: AtomicU64::new(NO_TIMEOUT),
            send_timeout: AtomicU64::new(NO_TIMEOUT),
            waiters: Mutex::new(Vec::new()),
        }
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Returns `false` if `fd` was not open when inspected.
    #[must_use]
    pub fn is_init(&self) -> bool {
        self.init
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn is_socket(&self) -> bool {
        self.socket
    }

    /// The socket really is in non-blocking mode.
    #[must_use]
    pub fn is_sys_nonblock(&self) -> bool {
        self.sys_nonblock
    }

    /// The user asked for non-blocking mode.
    #[must_use]
    pub fn is_user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    #[allow(missing_docs)]
    pub fn set_user_nonblock(&self, nonblock: bool) {
        self.user_nonblock.store(nonblock, Ordering::Release);
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[allow(missing_docs)]
    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Remember that `reactor` waits on this fd, so closing it can wake the waiters.
    pub fn add_waiter(&self, reactor: &Arc<Reactor>) {
        let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        waiters.retain(|w| w.strong_count() > 0);
        let weak = Arc::downgrade(reactor);
        if !waiters.iter().any(|w| w.ptr_eq(&weak)) {
            waiters.push(weak);
        }
    }

    /// Every live reactor that ever waited on this fd.
    #[must_use]
    pub fn waiters(&self) -> Vec<Arc<Reactor>> {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn slot(&self, kind: TimeoutKind) -> &AtomicU64 {
        match kind {
            TimeoutKind::Recv => &self.recv_timeout,
            TimeoutKind::Send => &self.send_timeout,
        }
    }

    /// The timeout set through `setsockopt`, `None` for wait forever.
    #[must_use]
    pub fn timeout(&self, kind: TimeoutKind) -> Option<Duration> {
        match self.slot(kind).load(Ordering::Acquire) {
            NO_TIMEOUT => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// A zero duration clears the timeout, as the kernel does.
    pub fn set_timeout(&self, kind: TimeoutKind, timeout: Option<Duration>) {
        let ms = timeout
            .filter(|dur| !dur.is_zero())
            .map_or(NO_TIMEOUT, |dur| {
                u64::try_from(dur.as_millis()).unwrap_or(NO_TIMEOUT - 1).max(1)
            });
        self.slot(kind).store(ms, Ordering::Release);
    }
}

/// Process wide table of [`FdCtx`], indexed by fd.
#[derive(Debug)]
pub struct FdManager {
    table: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

// hooked `close` may run while this is built, so nothing here may call a hooked syscall
static INSTANCE: Lazy<FdManager> = Lazy::new(|| FdManager {
    table: RwLock::new(vec![None; DEFAULT_FD_TABLE_SIZE]),
});

impl FdManager {
    /// Get the process wide instance.
    #[must_use]
    pub fn get_instance() -> &'static FdManager {
        &INSTANCE
    }

    /// The process wide instance, `None` if nothing used it yet.
    #[must_use]
    pub fn try_get_instance() -> Option<&'static FdManager> {
        Lazy::get(&INSTANCE)
    }

    /// The context of `fd`, created on first use if `auto_create`.
    #[must_use]
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        let index = usize::try_from(fd).ok()?;
        {
            let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
            match table.get(index) {
                Some(Some(ctx)) => return Some(ctx.clone()),
                _ if !auto_create => return None,
                _ => {}
            }
        }
        // inspecting may call fcntl, keep it out of the lock
        let created = Arc::new(FdCtx::new(fd));
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if table.len() <= index {
            table.resize((index * 3 / 2).max(index + 1), None);
        }
        Some(table[index].get_or_insert(created).clone())
    }

    /// Replace whatever was known about `fd` with a fresh context, for descriptors
    /// that were just opened.
    #[must_use]
    pub fn register(&self, fd: RawFd) -> Option<Arc<FdCtx>> {
        let index = usize::try_from(fd).ok()?;
        let created = Arc::new(FdCtx::new(fd));
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if table.len() <= index {
            table.resize((index * 3 / 2).max(index + 1), None);
        }
        table[index] = Some(created.clone());
        Some(created)
    }

    /// Forget `fd`.
    pub fn del(&self, fd: RawFd) {
        let Ok(index) = usize::try_from(fd) else {
            return;
        };
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = table.get_mut(index) {
            *slot = None;
        }
    }
}
