use crate::common::Named;
use std::fmt::Debug;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// A trait for blocking current thread.
pub trait Blocker: Debug + Named {
    /// Block current thread for a while, or until woken.
    fn block(&self, dur: Duration);

    /// Wake a thread blocked in [`Blocker::block`], if any.
    fn wake(&self);
}

/// Blocks on a condvar, [`Blocker::wake`] cuts the wait short.
#[derive(Debug, Default)]
pub struct CondvarBlocker {
    woken: Mutex<bool>,
    condvar: Condvar,
}

/// const `CONDVAR_BLOCKER_NAME`.
pub const CONDVAR_BLOCKER_NAME: &str = "CondvarBlocker";

impl Named for CondvarBlocker {
    fn get_name(&self) -> &str {
        CONDVAR_BLOCKER_NAME
    }
}

impl Blocker for CondvarBlocker {
    fn block(&self, dur: Duration) {
        let woken = self.woken.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut woken, _) = self
            .condvar
            .wait_timeout_while(woken, dur, |woken| !*woken)
            .unwrap_or_else(PoisonError::into_inner);
        *woken = false;
    }

    fn wake(&self) {
        *self.woken.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.condvar.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn condvar_blocker_timeout() {
        let blocker = CondvarBlocker::default();
        let time = fiberio_timer::now();
        blocker.block(Duration::from_millis(100));
        let cost = Duration::from_nanos(fiberio_timer::now().saturating_sub(time));
        assert!(cost >= Duration::from_millis(100), "cost {cost:?}");
    }

    #[test]
    fn condvar_blocker_wake() {
        let blocker = Arc::new(CondvarBlocker::default());
        let waker = blocker.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            waker.wake();
        });
        let time = fiberio_timer::now();
        blocker.block(Duration::from_secs(10));
        let cost = Duration::from_nanos(fiberio_timer::now().saturating_sub(time));
        assert!(cost < Duration::from_secs(5), "cost {cost:?}");
        handle.join().unwrap();
    }

    #[test]
    fn wake_before_block() {
        let blocker = CondvarBlocker::default();
        blocker.wake();
        let time = fiberio_timer::now();
        blocker.block(Duration::from_secs(10));
        let cost = Duration::from_nanos(fiberio_timer::now().saturating_sub(time));
        assert!(cost < Duration::from_secs(1), "cost {cost:?}");
    }
}
