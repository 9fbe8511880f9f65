use crate::config::Config;
use crate::fd::{FdCtx, FdManager, TimeoutKind};
use crate::fiber::Fiber;
use crate::reactor::{Event, Reactor};
use crate::scheduler::current::Worker;
use crate::scheduler::Task;
use crate::syscall::common::{errno, reset_errno, set_errno};
use libc::{
    c_int, c_uint, c_ulong, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t, timespec,
    timeval,
};
use std::cell::Cell;
use std::mem::size_of;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub mod common;

pub mod raw;

thread_local! {
    static HOOK_ENABLE: Cell<bool> = const { Cell::new(false) };
}

/// Returns `true` if syscalls made on this thread are intercepted.
#[must_use]
pub fn is_hook_enable() -> bool {
    HOOK_ENABLE.with(Cell::get)
}

/// Turn interception on or off for this thread, workers turn it on for themselves.
pub fn set_hook_enable(enable: bool) {
    HOOK_ENABLE.with(|flag| flag.set(enable));
}

fn hooked_reactor() -> Option<Arc<Reactor>> {
    if is_hook_enable() && Fiber::in_fiber() {
        Reactor::current()
    } else {
        None
    }
}

fn to_ms(dur: Duration) -> u64 {
    u64::try_from(dur.as_millis()).unwrap_or(u64::MAX)
}

/// Park the current fiber for `dur`, `false` if it has to block the thread instead.
fn sleep_for(dur: Duration) -> bool {
    let Some(reactor) = hooked_reactor() else {
        return false;
    };
    let Some(worker) = Worker::current() else {
        return false;
    };
    let scheduler = worker.scheduler().clone();
    let fiber = Fiber::current();
    _ = reactor.add_timer(
        to_ms(dur),
        move || scheduler.post(Task::Fiber(fiber.clone()), None),
        false,
    );
    Fiber::yield_to_hold();
    true
}

/// sleep

#[must_use]
pub fn sleep(secs: c_uint) -> c_uint {
    if !sleep_for(Duration::from_secs(u64::from(secs))) {
        return (*raw::SLEEP)(secs);
    }
    reset_errno();
    0
}

#[must_use]
pub fn usleep(microseconds: c_uint) -> c_int {
    if !sleep_for(Duration::from_micros(u64::from(microseconds))) {
        return (*raw::USLEEP)(microseconds);
    }
    reset_errno();
    0
}

#[allow(clippy::not_unsafe_ptr_arg_deref)]
#[must_use]
pub fn nanosleep(rqtp: *const timespec, rmtp: *mut timespec) -> c_int {
    if rqtp.is_null() {
        set_errno(libc::EINVAL);
        return -1;
    }
    let t = unsafe { *rqtp };
    let (Ok(secs), Ok(nanos)) = (u64::try_from(t.tv_sec), u32::try_from(t.tv_nsec)) else {
        set_errno(libc::EINVAL);
        return -1;
    };
    if nanos > 999_999_999 {
        set_errno(libc::EINVAL);
        return -1;
    }
    if !sleep_for(Duration::new(secs, nanos)) {
        return (*raw::NANOSLEEP)(rqtp, rmtp);
    }
    reset_errno();
    if !rmtp.is_null() {
        unsafe {
            (*rmtp).tv_sec = 0;
            (*rmtp).tv_nsec = 0;
        }
    }
    0
}

/// Wait for `event` on `ctx`, `Err` carries the errno to fail with.
fn wait_event(
    reactor: &Arc<Reactor>,
    ctx: &FdCtx,
    event: Event,
    timeout: Option<Duration>,
) -> Result<(), c_int> {
    let fd = ctx.fd();
    let marker = Arc::new(AtomicI32::new(0));
    let timer = timeout.map(|dur| {
        let weak_marker = Arc::downgrade(&marker);
        let weak_reactor = Arc::downgrade(reactor);
        // skipped once the wait is over and the marker is gone
        reactor.add_condition_timer(
            to_ms(dur),
            move || {
                let Some(marker) = weak_marker.upgrade() else {
                    return;
                };
                if marker
                    .compare_exchange(0, libc::ETIMEDOUT, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    if let Some(reactor) = weak_reactor.upgrade() {
                        _ = reactor.cancel_event(fd, event);
                    }
                }
            },
            Arc::downgrade(&marker),
            false,
        )
    });
    let cancel_timer = || {
        if let Some(timer) = &timer {
            _ = timer.cancel();
        }
    };
    // a close on any thread has to find this reactor
    ctx.add_waiter(reactor);
    if let Err(e) = reactor.add_event(fd, event, None) {
        cancel_timer();
        return Err(e.raw_os_error().unwrap_or(libc::EINVAL));
    }
    let fired = marker.load(Ordering::Acquire);
    // the timer or a close beat the registration
    if (fired != 0 || ctx.is_closed()) && reactor.remove_event(fd, event) {
        cancel_timer();
        return Err(if ctx.is_closed() { libc::EBADF } else { fired });
    }
    Fiber::yield_to_hold();
    cancel_timer();
    if ctx.is_closed() {
        return Err(libc::EBADF);
    }
    match marker.load(Ordering::Acquire) {
        0 => Ok(()),
        code => Err(code),
    }
}

/// Run `op` until it stops would-blocking, parking the current fiber in between.
#[cfg_attr(not(feature = "logs"), allow(unused_variables))]
fn do_io(
    fd: c_int,
    name: &str,
    event: Event,
    kind: TimeoutKind,
    op: impl Fn() -> ssize_t,
) -> ssize_t {
    let Some(reactor) = hooked_reactor() else {
        return op();
    };
    let Some(ctx) = FdManager::get_instance().get(fd, false) else {
        return op();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.is_user_nonblock() {
        return op();
    }
    let timeout = ctx.timeout(kind);
    loop {
        let n = op();
        if n != -1 {
            return n;
        }
        match errno() {
            libc::EINTR => continue,
            libc::EAGAIN => {}
            _ => return n,
        }
        crate::debug!("{name}({fd}) would block");
        if let Err(code) = wait_event(&reactor, &ctx, event, timeout) {
            set_errno(code);
            return -1;
        }
    }
}

fn from_ssize(n: ssize_t) -> c_int {
    c_int::try_from(n).unwrap_or(-1)
}

/// socket

#[must_use]
pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = (*raw::SOCKET)(domain, ty, protocol);
    if fd != -1 && is_hook_enable() {
        _ = FdManager::get_instance().register(fd);
    }
    fd
}

/// Like [`connect`], with an explicit timeout, `None` waits forever.
#[must_use]
pub fn connect_with_timeout(
    fd: c_int,
    address: *const sockaddr,
    len: socklen_t,
    timeout: Option<Duration>,
) -> c_int {
    let Some(reactor) = hooked_reactor() else {
        return (*raw::CONNECT)(fd, address, len);
    };
    let Some(ctx) = FdManager::get_instance().get(fd, false) else {
        return (*raw::CONNECT)(fd, address, len);
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.is_user_nonblock() {
        return (*raw::CONNECT)(fd, address, len);
    }
    let n = (*raw::CONNECT)(fd, address, len);
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }
    if let Err(code) = wait_event(&reactor, &ctx, Event::Write, timeout) {
        set_errno(code);
        return -1;
    }
    let mut error: c_int = 0;
    let mut error_len = socklen_t::try_from(size_of::<c_int>()).unwrap_or(4);
    if unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            std::ptr::addr_of_mut!(error).cast(),
            &mut error_len,
        )
    } == -1
    {
        return -1;
    }
    if error == 0 {
        reset_errno();
        0
    } else {
        set_errno(error);
        -1
    }
}

/// Hooked `connect`, waiting at most [`Config::get_connect_timeout_ms`], 0 means forever.
#[must_use]
pub fn connect(fd: c_int, address: *const sockaddr, len: socklen_t) -> c_int {
    let timeout = match Config::get_instance().get_connect_timeout_ms() {
        0 => None,
        ms => Some(Duration::from_millis(ms)),
    };
    connect_with_timeout(fd, address, len, timeout)
}

#[must_use]
pub fn accept(fd: c_int, address: *mut sockaddr, address_len: *mut socklen_t) -> c_int {
    let accepted = from_ssize(do_io(fd, "accept", Event::Read, TimeoutKind::Recv, || {
        ssize_t::try_from((*raw::ACCEPT)(fd, address, address_len)).unwrap_or(-1)
    }));
    if accepted >= 0 && is_hook_enable() {
        _ = FdManager::get_instance().register(accepted);
    }
    accepted
}

/// Forget `fd` and wake everything waiting on it before really closing it.
///
/// Works from any thread, the fibers parked on `fd` are woken on their own reactors.
#[must_use]
pub fn close(fd: c_int) -> c_int {
    // nothing can be tracked before the table exists
    let Some(manager) = FdManager::try_get_instance() else {
        return raw::close(fd);
    };
    if let Some(ctx) = manager.get(fd, false) {
        ctx.set_closed();
        for reactor in ctx.waiters() {
            _ = reactor.cancel_all_event(fd);
        }
        manager.del(fd);
    }
    raw::close(fd)
}

fn socket_ctx(fd: c_int) -> Option<Arc<FdCtx>> {
    FdManager::try_get_instance()?
        .get(fd, false)
        .filter(|ctx| ctx.is_init() && ctx.is_socket() && !ctx.is_closed())
}

/// Tracks the non-blocking flag the user asked for, a socket stays non-blocking underneath.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]
#[must_use]
pub fn fcntl(fd: c_int, cmd: c_int, arg: c_ulong) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let Some(ctx) = socket_ctx(fd) else {
                return raw::fcntl(fd, cmd, arg);
            };
            let flags = arg as c_int;
            ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
            let flags = if ctx.is_sys_nonblock() {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            };
            raw::fcntl(fd, cmd, flags as c_ulong)
        }
        libc::F_GETFL => {
            let flags = raw::fcntl(fd, cmd, arg);
            if flags == -1 {
                return flags;
            }
            match socket_ctx(fd) {
                Some(ctx) if ctx.is_user_nonblock() => flags | libc::O_NONBLOCK,
                Some(_) => flags & !libc::O_NONBLOCK,
                None => flags,
            }
        }
        _ => raw::fcntl(fd, cmd, arg),
    }
}

#[allow(clippy::not_unsafe_ptr_arg_deref)]
#[must_use]
pub fn ioctl(fd: c_int, request: raw::IoctlRequest, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO && !arg.is_null() {
        if let Some(ctx) = socket_ctx(fd) {
            let nonblock = unsafe { *arg.cast::<c_int>() } != 0;
            ctx.set_user_nonblock(nonblock);
            if ctx.is_sys_nonblock() {
                let mut on: c_int = 1;
                return (*raw::IOCTL)(fd, request, std::ptr::addr_of_mut!(on).cast());
            }
        }
    }
    (*raw::IOCTL)(fd, request, arg)
}

#[allow(clippy::not_unsafe_ptr_arg_deref)]
#[must_use]
pub fn setsockopt(
    socket: c_int,
    level: c_int,
    name: c_int,
    value: *const c_void,
    option_len: socklen_t,
) -> c_int {
    let r = (*raw::SETSOCKOPT)(socket, level, name, value, option_len);
    if r != 0 || !is_hook_enable() || level != libc::SOL_SOCKET || value.is_null() {
        return r;
    }
    let Some(kind) = TimeoutKind::from_optname(name) else {
        return r;
    };
    if usize::try_from(option_len).unwrap_or(0) < size_of::<timeval>() {
        return r;
    }
    if let Some(ctx) = FdManager::get_instance().get(socket, true) {
        let tv = unsafe { *value.cast::<timeval>() };
        let timeout = u64::try_from(tv.tv_sec)
            .ok()
            .zip(u32::try_from(tv.tv_usec).ok())
            .map(|(secs, micros)| Duration::new(secs, micros.saturating_mul(1000)));
        ctx.set_timeout(kind, timeout);
    }
    r
}

/// read

#[must_use]
pub fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, "read", Event::Read, TimeoutKind::Recv, || {
        (*raw::READ)(fd, buf, count)
    })
}

#[must_use]
pub fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "readv", Event::Read, TimeoutKind::Recv, || {
        (*raw::READV)(fd, iov, iovcnt)
    })
}

#[must_use]
pub fn recv(socket: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(socket, "recv", Event::Read, TimeoutKind::Recv, || {
        (*raw::RECV)(socket, buf, len, flags)
    })
}

#[must_use]
pub fn recvfrom(
    socket: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    address: *mut sockaddr,
    address_len: *mut socklen_t,
) -> ssize_t {
    do_io(socket, "recvfrom", Event::Read, TimeoutKind::Recv, || {
        (*raw::RECVFROM)(socket, buf, len, flags, address, address_len)
    })
}

#[must_use]
pub fn recvmsg(socket: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t {
    do_io(socket, "recvmsg", Event::Read, TimeoutKind::Recv, || {
        (*raw::RECVMSG)(socket, msg, flags)
    })
}

/// write

#[must_use]
pub fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, "write", Event::Write, TimeoutKind::Send, || {
        (*raw::WRITE)(fd, buf, count)
    })
}

#[must_use]
pub fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "writev", Event::Write, TimeoutKind::Send, || {
        (*raw::WRITEV)(fd, iov, iovcnt)
    })
}

#[must_use]
pub fn send(socket: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(socket, "send", Event::Write, TimeoutKind::Send, || {
        (*raw::SEND)(socket, buf, len, flags)
    })
}

#[must_use]
pub fn sendto(
    socket: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    address: *const sockaddr,
    address_len: socklen_t,
) -> ssize_t {
    do_io(socket, "sendto", Event::Write, TimeoutKind::Send, || {
        (*raw::SENDTO)(socket, buf, len, flags, address, address_len)
    })
}

#[must_use]
pub fn sendmsg(socket: c_int, msg: *const msghdr, flags: c_int) -> ssize_t {
    do_io(socket, "sendmsg", Event::Write, TimeoutKind::Send, || {
        (*raw::SENDMSG)(socket, msg, flags)
    })
}
