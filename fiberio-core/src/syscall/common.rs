use libc::c_int;

#[must_use]
pub fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

pub fn set_errno(errno: c_int) {
    unsafe { libc::__errno_location().write(errno) }
}

pub fn reset_errno() {
    set_errno(0);
}

/// Switch `fd` to non-blocking mode through the real `fcntl`.
pub fn set_non_blocking(fd: c_int) -> bool {
    let flags = crate::syscall::raw::fcntl(fd, libc::F_GETFL, 0);
    if flags == -1 {
        return false;
    }
    if flags & libc::O_NONBLOCK != 0 {
        return true;
    }
    crate::syscall::raw::fcntl(
        fd,
        libc::F_SETFL,
        libc::c_ulong::try_from(flags | libc::O_NONBLOCK).unwrap_or(0),
    ) != -1
}
