#![warn(
    // The following are allowed by default lints according to
    // https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
    anonymous_parameters,
    bare_trait_objects,
    elided_lifetimes_in_paths,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    single_use_lifetimes,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unsafe_code,
    unstable_features,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results,
    variant_size_differences,

    clippy::all,
    clippy::pedantic,
    clippy::cargo,
)]
#![allow(
    // Some explicitly allowed Clippy lints, must have clear reason to allow
    clippy::implicit_return, // actually omitting the return keyword is idiomatic Rust code
    clippy::module_name_repetitions, // repeation of module name in a struct name is not big deal
    clippy::multiple_crate_versions, // multi-version dependency crates is not able to fix
    clippy::exhaustive_enums,
    clippy::exhaustive_structs,
    clippy::separated_literal_suffix, // conflicts with clippy::unseparated_literal_suffix
)]

//! Deadline ordered timers, ordered by `(deadline, id)` and driven by whoever polls
//! [`TimerManager::get_next_timer`] and [`TimerManager::list_expired_timer`].

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// get the current wall clock in ns
///
/// # Panics
/// if the time is before `UNIX_EPOCH`
#[must_use]
pub fn now() -> u64 {
    u64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("1970-01-01 00:00:00 UTC was {} seconds ago!")
            .as_nanos(),
    )
    .unwrap_or(u64::MAX)
}

/// get the current wall clock in ms
#[must_use]
pub fn now_ms() -> u64 {
    now() / 1_000_000
}

/// current ns time add `dur`.
#[must_use]
pub fn get_timeout_time(dur: Duration) -> u64 {
    u64::try_from(dur.as_nanos())
        .map(|d| d.saturating_add(now()))
        .unwrap_or(u64::MAX)
}

/// The callback a timer runs when it expires.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// A backward clock jump larger than this expires every timer.
const ROLLOVER_SLACK_MS: u64 = 60 * 60 * 1000;

static TIMER_ID: AtomicU64 = AtomicU64::new(1);

struct TimerState {
    ms: u64,
    next: u64,
    recurring: bool,
    callback: Option<TimerCallback>,
}

/// A scheduled callback owned by a [`TimerManager`].
pub struct Timer {
    id: u64,
    state: Mutex<TimerState>,
    manager: Weak<Shared>,
}

impl Debug for Timer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("ms", &state.ms)
            .field("next", &state.next)
            .field("recurring", &state.recurring)
            .field("live", &state.callback.is_some())
            .finish()
    }
}

impl Timer {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The unique id of this timer.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The period in ms.
    #[must_use]
    pub fn period(&self) -> u64 {
        self.lock().ms
    }

    /// The absolute deadline in ms.
    #[must_use]
    pub fn deadline(&self) -> u64 {
        self.lock().next
    }

    /// Returns `true` if this timer re-arms after firing.
    #[must_use]
    pub fn is_recurring(&self) -> bool {
        self.lock().recurring
    }

    /// Remove the timer and drop its callback.
    /// Returns `false` if it was already cancelled or has fired for the last time.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };
        let mut timers = shared.write();
        let mut state = self.lock();
        if state.callback.take().is_none() {
            return false;
        }
        _ = timers.remove(&(state.next, self.id));
        true
    }

    /// Move the deadline to now + period.
    pub fn refresh(&self) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };
        let mut timers = shared.write();
        let mut state = self.lock();
        if state.callback.is_none() {
            return false;
        }
        let Some(timer) = timers.remove(&(state.next, self.id)) else {
            return false;
        };
        state.next = now_ms().saturating_add(state.ms);
        _ = timers.insert((state.next, self.id), timer);
        true
    }

    /// Change the period to `ms`. The new deadline counts from now if `from_now`,
    /// otherwise from the point the current period started.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        {
            let state = self.lock();
            if ms == state.ms && !from_now {
                return true;
            }
        }
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };
        let mut timers = shared.write();
        let mut state = self.lock();
        if state.callback.is_none() {
            return false;
        }
        let Some(timer) = timers.remove(&(state.next, self.id)) else {
            return false;
        };
        let start = if from_now {
            now_ms()
        } else {
            state.next.saturating_sub(state.ms)
        };
        state.ms = ms;
        state.next = start.saturating_add(ms);
        let key = (state.next, self.id);
        drop(state);
        shared.insert(timers, key, timer);
        true
    }
}

struct Shared {
    timers: RwLock<BTreeMap<(u64, u64), Arc<Timer>>>,
    tickled: AtomicBool,
    previous_time: AtomicU64,
    on_front: Box<dyn Fn() + Send + Sync>,
}

impl Shared {
    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<(u64, u64), Arc<Timer>>> {
        self.timers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<(u64, u64), Arc<Timer>>> {
        self.timers.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(
        &self,
        mut timers: RwLockWriteGuard<'_, BTreeMap<(u64, u64), Arc<Timer>>>,
        key: (u64, u64),
        timer: Arc<Timer>,
    ) {
        _ = timers.insert(key, timer);
        let at_front =
            timers.keys().next() == Some(&key) && !self.tickled.swap(true, Ordering::AcqRel);
        drop(timers);
        if at_front {
            (self.on_front)();
        }
    }

    fn detect_clock_rollover(&self, now: u64) -> bool {
        let previous = self.previous_time.swap(now, Ordering::AcqRel);
        now < previous.saturating_sub(ROLLOVER_SLACK_MS)
    }
}

/// A set of timers ordered by deadline.
///
/// The manager never runs callbacks itself; the owner polls it.
pub struct TimerManager {
    shared: Arc<Shared>,
}

impl Debug for TimerManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerManager")
            .field("timers", &self.shared.read().len())
            .field("tickled", &self.shared.tickled.load(Ordering::Acquire))
            .finish()
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        TimerManager::new(|| {})
    }
}

impl TimerManager {
    /// Create a manager, `on_front` runs whenever a newly inserted timer becomes the earliest.
    /// It fires at most once until the next [`TimerManager::get_next_timer`].
    pub fn new(on_front: impl Fn() + Send + Sync + 'static) -> Self {
        TimerManager {
            shared: Arc::new(Shared {
                timers: RwLock::new(BTreeMap::new()),
                tickled: AtomicBool::new(false),
                previous_time: AtomicU64::new(now_ms()),
                on_front: Box::new(on_front),
            }),
        }
    }

    /// Run `callback` after `ms`, and every `ms` after that if `recurring`.
    pub fn add_timer(
        &self,
        ms: u64,
        callback: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Arc<Timer> {
        let next = now_ms().saturating_add(ms);
        let timer = Arc::new(Timer {
            id: TIMER_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(TimerState {
                ms,
                next,
                recurring,
                callback: Some(Arc::new(callback)),
            }),
            manager: Arc::downgrade(&self.shared),
        });
        let key = (next, timer.id);
        self.shared.insert(self.shared.write(), key, timer.clone());
        timer
    }

    /// Like [`TimerManager::add_timer`], but `callback` does nothing once `cond` is gone.
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
        self.add_timer(
            ms,
            move || {
                if cond.upgrade().is_some() {
                    callback();
                }
            },
            recurring,
        )
    }

    /// Ms until the earliest deadline, `Some(0)` if one is already due,
    /// `None` if there is no timer at all.
    pub fn get_next_timer(&self) -> Option<u64> {
        self.shared.tickled.store(false, Ordering::Release);
        let timers = self.shared.read();
        let (next, _) = timers.keys().next()?;
        Some(next.saturating_sub(now_ms()))
    }

    /// Pop the callbacks of all due timers into `callbacks`, re-arming recurring ones.
    pub fn list_expired_timer(&self, callbacks: &mut Vec<TimerCallback>) {
        if self.shared.read().is_empty() {
            return;
        }
        let now = now_ms();
        let mut timers = self.shared.write();
        if timers.is_empty() {
            return;
        }
        let rollover = self.shared.detect_clock_rollover(now);
        if !rollover && timers.keys().next().is_some_and(|(next, _)| *next > now) {
            return;
        }
        let expired = if rollover {
            std::mem::take(&mut *timers)
        } else {
            let later = timers.split_off(&(now.saturating_add(1), 0));
            std::mem::replace(&mut *timers, later)
        };
        callbacks.reserve(expired.len());
        for (_, timer) in expired {
            let mut state = timer.lock();
            let Some(callback) = state.callback.clone() else {
                continue;
            };
            callbacks.push(callback);
            if state.recurring {
                state.next = now.saturating_add(state.ms);
                let key = (state.next, timer.id);
                drop(state);
                _ = timers.insert(key, timer);
            } else {
                state.callback = None;
            }
        }
    }

    /// Returns `true` if any timer is pending.
    #[must_use]
    pub fn has_timer(&self) -> bool {
        !self.shared.read().is_empty()
    }

    /// The number of pending timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.read().len()
    }

    /// Returns `true` if no timer is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.has_timer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fire(manager: &TimerManager) -> usize {
        let mut callbacks = Vec::new();
        manager.list_expired_timer(&mut callbacks);
        for callback in &callbacks {
            callback();
        }
        callbacks.len()
    }

    #[test]
    fn test() {
        assert!(now() > 0);
        assert!(get_timeout_time(Duration::from_millis(1)) > now());
    }

    #[test]
    fn next_timer() {
        let manager = TimerManager::default();
        assert_eq!(None, manager.get_next_timer());
        _ = manager.add_timer(100, || {}, false);
        let next = manager.get_next_timer().unwrap();
        assert!(next <= 100);
        _ = manager.add_timer(0, || {}, false);
        assert_eq!(Some(0), manager.get_next_timer());
    }

    #[test]
    fn one_shot_fires_once() {
        let manager = TimerManager::default();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let timer = manager.add_timer(
            30,
            move || {
                _ = c.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        assert_eq!(0, fire(&manager));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(1, fire(&manager));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(0, fire(&manager));
        assert_eq!(1, count.load(Ordering::SeqCst));
        assert!(!manager.has_timer());
        assert!(!timer.cancel());
    }

    #[test]
    fn recurring_until_cancelled() {
        let manager = TimerManager::default();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let timer = manager.add_timer(
            20,
            move || {
                _ = c.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(25));
            assert_eq!(1, fire(&manager));
        }
        assert_eq!(3, count.load(Ordering::SeqCst));
        assert!(timer.cancel());
        assert!(!timer.cancel());
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(0, fire(&manager));
        assert_eq!(3, count.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_before_deadline() {
        let manager = TimerManager::default();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let timer = manager.add_timer(
            10,
            move || {
                _ = c.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        assert!(timer.cancel());
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(0, fire(&manager));
        assert_eq!(0, count.load(Ordering::SeqCst));
    }

    #[test]
    fn condition_timer() {
        let manager = TimerManager::default();
        let count = Arc::new(AtomicUsize::new(0));
        let guard = Arc::new(());
        let c = count.clone();
        _ = manager.add_condition_timer(
            0,
            move || {
                _ = c.fetch_add(1, Ordering::SeqCst);
            },
            Arc::downgrade(&guard),
            false,
        );
        let c = count.clone();
        let dropped = Arc::new(());
        _ = manager.add_condition_timer(
            0,
            move || {
                _ = c.fetch_add(10, Ordering::SeqCst);
            },
            Arc::downgrade(&dropped),
            false,
        );
        drop(dropped);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(2, fire(&manager));
        assert_eq!(1, count.load(Ordering::SeqCst));
    }

    #[test]
    fn reset_and_refresh() {
        let manager = TimerManager::default();
        let timer = manager.add_timer(500, || {}, false);
        let deadline = timer.deadline();
        assert!(timer.reset(500, false));
        assert_eq!(deadline, timer.deadline());
        assert!(timer.reset(2000, false));
        assert_eq!(deadline + 1500, timer.deadline());
        assert_eq!(2000, timer.period());
        assert!(timer.reset(100, true));
        assert!(timer.deadline() <= now_ms() + 100);
        let before = timer.deadline();
        std::thread::sleep(Duration::from_millis(20));
        let start = now_ms();
        assert!(timer.refresh());
        assert!(timer.deadline() > before);
        assert!(timer.deadline() >= start + 100);
        assert!(timer.deadline() <= now_ms() + 100);
        assert!(manager.get_next_timer().unwrap() > 50);
        assert_eq!(1, manager.len());
        assert!(timer.cancel());
        assert!(!timer.refresh());
        assert!(!timer.reset(10, true));
        assert!(manager.is_empty());
    }

    #[test]
    fn clock_rollover_expires_everything() {
        let manager = TimerManager::default();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let far = manager.add_timer(
            10 * 60 * 1000,
            move || {
                _ = c.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        let recurring = manager.add_timer(60 * 60 * 1000, || {}, true);
        assert_eq!(0, fire(&manager));
        // the clock went back two hours since the last poll
        manager
            .shared
            .previous_time
            .store(now_ms() + 2 * 60 * 60 * 1000, Ordering::Release);
        assert!(far.deadline() > now_ms() + 60 * 1000);
        assert_eq!(2, fire(&manager));
        assert_eq!(1, count.load(Ordering::SeqCst));
        assert!(!far.cancel());
        // recurring timers are rescheduled from now
        assert_eq!(1, manager.len());
        assert!(recurring.deadline() <= now_ms() + 60 * 60 * 1000);
        // back to normal, nothing else is due
        assert_eq!(0, fire(&manager));
        assert!(recurring.cancel());
    }

    #[test]
    fn front_debounce() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let manager = TimerManager::new(move || {
            _ = c.fetch_add(1, Ordering::SeqCst);
        });
        _ = manager.add_timer(1000, || {}, false);
        assert_eq!(1, count.load(Ordering::SeqCst));
        // still tickled, no second notification
        _ = manager.add_timer(500, || {}, false);
        assert_eq!(1, count.load(Ordering::SeqCst));
        _ = manager.get_next_timer();
        _ = manager.add_timer(2000, || {}, false);
        assert_eq!(1, count.load(Ordering::SeqCst));
        _ = manager.add_timer(100, || {}, false);
        assert_eq!(2, count.load(Ordering::SeqCst));
    }
}
