use libc::{c_int, epoll_event};
use std::os::fd::RawFd;
use std::time::Duration;

/// Max events taken by one [`Selector::select`].
pub(crate) const MAX_EVENTS: usize = 256;

fn cvt(ret: c_int) -> std::io::Result<c_int> {
    if ret == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// An edge triggered epoll instance, the fd is the user data of every registration.
#[derive(Debug)]
pub(crate) struct Selector(RawFd);

impl Selector {
    /// # Errors
    /// if create failed.
    pub(crate) fn new() -> std::io::Result<Selector> {
        Ok(Selector(cvt(unsafe {
            libc::epoll_create1(libc::EPOLL_CLOEXEC)
        })?))
    }

    /// # Errors
    /// if poll failed.
    pub(crate) fn select(
        &self,
        events: &mut [epoll_event],
        timeout: Option<Duration>,
    ) -> std::io::Result<usize> {
        let timeout = timeout.map_or(-1, |dur| {
            c_int::try_from(dur.as_millis()).unwrap_or(c_int::MAX)
        });
        let max = c_int::try_from(events.len()).unwrap_or(c_int::MAX);
        let n = cvt(unsafe { libc::epoll_wait(self.0, events.as_mut_ptr(), max, timeout) })?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    /// # Errors
    /// if add failed.
    pub(crate) fn register(&self, fd: RawFd, interests: u32) -> std::io::Result<()> {
        self.control(libc::EPOLL_CTL_ADD, fd, interests)
    }

    /// # Errors
    /// if modify failed.
    pub(crate) fn reregister(&self, fd: RawFd, interests: u32) -> std::io::Result<()> {
        self.control(libc::EPOLL_CTL_MOD, fd, interests)
    }

    /// # Errors
    /// if delete failed.
    pub(crate) fn deregister(&self, fd: RawFd) -> std::io::Result<()> {
        self.control(libc::EPOLL_CTL_DEL, fd, 0)
    }

    #[allow(clippy::cast_sign_loss)]
    fn control(&self, op: c_int, fd: RawFd, interests: u32) -> std::io::Result<()> {
        let mut event = epoll_event {
            events: interests | libc::EPOLLET as u32,
            u64: fd as u64,
        };
        _ = cvt(unsafe { libc::epoll_ctl(self.0, op, fd, &mut event) })?;
        Ok(())
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        _ = crate::syscall::raw::close(self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_pipe() -> std::io::Result<()> {
        let selector = Selector::new()?;
        let mut fds = [0; 2];
        _ = cvt(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) })?;
        selector.register(fds[0], libc::EPOLLIN as u32)?;
        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        assert_eq!(
            0,
            selector.select(&mut events, Some(Duration::from_millis(10)))?
        );
        assert_eq!(1, unsafe { libc::write(fds[1], b"x".as_ptr().cast(), 1) });
        assert_eq!(1, selector.select(&mut events, Some(Duration::from_millis(10)))?);
        let event = events[0];
        let data = event.u64;
        assert_eq!(fds[0], RawFd::try_from(data).unwrap());
        // edge triggered, nothing new without another write
        assert_eq!(
            0,
            selector.select(&mut events, Some(Duration::from_millis(10)))?
        );
        selector.deregister(fds[0])?;
        assert!(selector.deregister(fds[0]).is_err());
        unsafe {
            _ = libc::close(fds[0]);
            _ = libc::close(fds[1]);
        }
        Ok(())
    }
}
