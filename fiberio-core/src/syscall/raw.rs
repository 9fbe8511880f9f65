use libc::{
    c_int, c_uint, c_ulong, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t, timespec,
};
use once_cell::sync::Lazy;

// the next definition after ours, so a preloaded hook never resolves to itself
macro_rules! init_hook {
    ( $symbol:literal ) => {
        Lazy::new(|| unsafe {
            let ptr = libc::dlsym(libc::RTLD_NEXT, concat!($symbol, "\0").as_ptr().cast());
            assert!(!ptr.is_null(), "system call \"{}\" not found !", $symbol);
            std::mem::transmute(ptr)
        })
    };
}

#[cfg(target_env = "gnu")]
pub type IoctlRequest = c_ulong;
#[cfg(not(target_env = "gnu"))]
pub type IoctlRequest = c_int;

pub static SLEEP: Lazy<extern "C" fn(c_uint) -> c_uint> = init_hook!("sleep");

pub static USLEEP: Lazy<extern "C" fn(c_uint) -> c_int> = init_hook!("usleep");

pub static NANOSLEEP: Lazy<extern "C" fn(*const timespec, *mut timespec) -> c_int> =
    init_hook!("nanosleep");

pub static SOCKET: Lazy<extern "C" fn(c_int, c_int, c_int) -> c_int> = init_hook!("socket");

pub static CONNECT: Lazy<extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int> =
    init_hook!("connect");

pub static ACCEPT: Lazy<extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int> =
    init_hook!("accept");

pub static READ: Lazy<extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t> = init_hook!("read");

pub static READV: Lazy<extern "C" fn(c_int, *const iovec, c_int) -> ssize_t> =
    init_hook!("readv");

pub static RECV: Lazy<extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t> =
    init_hook!("recv");

#[allow(clippy::type_complexity)]
pub static RECVFROM: Lazy<
    extern "C" fn(c_int, *mut c_void, size_t, c_int, *mut sockaddr, *mut socklen_t) -> ssize_t,
> = init_hook!("recvfrom");

pub static RECVMSG: Lazy<extern "C" fn(c_int, *mut msghdr, c_int) -> ssize_t> =
    init_hook!("recvmsg");

pub static WRITE: Lazy<extern "C" fn(c_int, *const c_void, size_t) -> ssize_t> =
    init_hook!("write");

pub static WRITEV: Lazy<extern "C" fn(c_int, *const iovec, c_int) -> ssize_t> =
    init_hook!("writev");

pub static SEND: Lazy<extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t> =
    init_hook!("send");

#[allow(clippy::type_complexity)]
pub static SENDTO: Lazy<
    extern "C" fn(c_int, *const c_void, size_t, c_int, *const sockaddr, socklen_t) -> ssize_t,
> = init_hook!("sendto");

pub static SENDMSG: Lazy<extern "C" fn(c_int, *const msghdr, c_int) -> ssize_t> =
    init_hook!("sendmsg");

pub static CLOSE: Lazy<extern "C" fn(c_int) -> c_int> = init_hook!("close");

pub static FCNTL: Lazy<extern "C" fn(c_int, c_int, c_ulong) -> c_int> = init_hook!("fcntl");

pub static IOCTL: Lazy<extern "C" fn(c_int, IoctlRequest, *mut c_void) -> c_int> =
    init_hook!("ioctl");

pub static SETSOCKOPT: Lazy<
    extern "C" fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int,
> = init_hook!("setsockopt");

pub fn close(fd: c_int) -> c_int {
    (*CLOSE)(fd)
}

pub fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    (*READ)(fd, buf, count)
}

pub fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    (*WRITE)(fd, buf, count)
}

pub fn fcntl(fd: c_int, cmd: c_int, arg: c_ulong) -> c_int {
    (*FCNTL)(fd, cmd, arg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        let mut fds = [0; 2];
        assert_eq!(0, unsafe { libc::pipe(fds.as_mut_ptr()) });
        assert_eq!(3, write(fds[1], b"abc".as_ptr().cast(), 3));
        let mut buf = [0u8; 8];
        assert_eq!(3, read(fds[0], buf.as_mut_ptr().cast(), buf.len()));
        assert_eq!(b"abc", &buf[..3]);
        assert_ne!(-1, fcntl(fds[0], libc::F_GETFL, 0));
        assert_eq!(0, close(fds[0]));
        assert_eq!(0, close(fds[1]));
        assert_eq!(-1, close(fds[1]));
    }
}
