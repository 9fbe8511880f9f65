use fiberio_core::config::Config;
use fiberio_core::reactor::Reactor;
use fiberio_core::scheduler::{Scheduler, Task};
use std::ffi::{c_int, c_void};
use std::sync::{Arc, Mutex, PoisonError};

static REACTOR: Mutex<Option<Arc<Reactor>>> = Mutex::new(None);

fn reactor() -> Option<Arc<Reactor>> {
    let mut reactor = REACTOR.lock().unwrap_or_else(PoisonError::into_inner);
    if reactor.is_none() {
        match Reactor::new(Config::get_instance().get_worker_threads(), false, "fiberio") {
            Ok(created) => *reactor = Some(created),
            Err(e) => {
                fiberio_core::error!("can not start the reactor: {e}");
            }
        }
    }
    reactor.clone()
}

struct Param(*mut c_void);

unsafe impl Send for Param {}

/// Run `f(param)` on a fiber of the shared reactor, which starts on first use with
/// `FIBERIO_WORKER_THREADS` workers. Returns -1 if the reactor can not start.
#[no_mangle]
pub extern "C" fn fiberio_spawn(f: extern "C" fn(*mut c_void), param: *mut c_void) -> c_int {
    let Some(reactor) = reactor() else {
        return -1;
    };
    let param = Param(param);
    reactor.post(
        Task::callback(move || {
            let param = param;
            f(param.0);
        }),
        None,
    );
    0
}

/// Wait for every spawned fiber, then shut the shared reactor down.
#[no_mangle]
pub extern "C" fn fiberio_stop() {
    let reactor = REACTOR
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(reactor) = reactor {
        reactor.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static RAN: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn bump(param: *mut c_void) {
        _ = RAN.fetch_add(param as usize, Ordering::SeqCst);
    }

    #[test]
    fn spawn_then_stop() {
        for _ in 0..4 {
            assert_eq!(0, fiberio_spawn(bump, 2usize as *mut c_void));
        }
        fiberio_stop();
        assert_eq!(8, RAN.load(Ordering::SeqCst));
        // a new reactor starts on demand
        assert_eq!(0, fiberio_spawn(bump, 1usize as *mut c_void));
        fiberio_stop();
        assert_eq!(9, RAN.load(Ordering::SeqCst));
    }
}
