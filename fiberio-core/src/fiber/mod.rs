use crate::config::Config;
use crate::fiber::constants::FiberState;
use crate::fiber::context::{Context, Suspender};
use std::any::Any;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::fmt::{Debug, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Fiber states.
pub mod constants;

mod context;

static FIBER_ID: AtomicU64 = AtomicU64::new(0);

static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static CURRENT: Cell<*const Fiber> = const { Cell::new(std::ptr::null()) };
    static ROOT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// A stackful coroutine.
///
/// Fibers always live in an [`Arc`]; they can be resumed on any thread,
/// but only by one thread at a time.
pub struct Fiber {
    id: u64,
    state: AtomicU8,
    /// The state to enter once the fiber has switched out.
    yield_state: Cell<FiberState>,
    stack_size: usize,
    /// `None` for the root fiber of a thread.
    context: UnsafeCell<Option<Context>>,
    suspender: Cell<*const Suspender>,
}

// A fiber is only touched by the thread running or resuming it, `Exec` excludes the rest.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Debug for Fiber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("stack_size", &self.stack_size)
            .finish()
    }
}

fn panic_message(cause: &(dyn Any + Send)) -> &str {
    if let Some(message) = cause.downcast_ref::<&str>() {
        message
    } else if let Some(message) = cause.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

impl Fiber {
    /// Create a fiber running `body`, a `stack_size` of 0 uses [`Config::get_stack_size`].
    ///
    /// # Errors
    /// if the stack can not be allocated.
    pub fn new(
        body: impl FnOnce() + Send + 'static,
        stack_size: usize,
    ) -> std::io::Result<Arc<Fiber>> {
        let stack_size = if stack_size == 0 {
            Config::get_instance().get_stack_size()
        } else {
            stack_size
        };
        let stack = Context::allocate(stack_size)?;
        let fiber = Arc::new(Fiber {
            id: FIBER_ID.fetch_add(1, Ordering::Relaxed) + 1,
            state: AtomicU8::new(FiberState::Init as u8),
            yield_state: Cell::new(FiberState::Hold),
            stack_size,
            context: UnsafeCell::new(Some(Context::new(
                stack,
                Fiber::trampoline(Box::new(body)),
            ))),
            suspender: Cell::new(std::ptr::null()),
        });
        _ = FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        crate::debug!("fiber {} created", fiber.id);
        Ok(fiber)
    }

    fn trampoline(body: Box<dyn FnOnce() + Send>) -> impl FnOnce(&Suspender) + 'static {
        move |suspender| {
            let fiber = unsafe { &*CURRENT.with(Cell::get) };
            fiber.suspender.set(suspender);
            let state = match catch_unwind(AssertUnwindSafe(body)) {
                Ok(()) => FiberState::Term,
                Err(cause) => {
                    crate::error!(
                        "fiber {} panicked: {}",
                        fiber.id,
                        panic_message(cause.as_ref())
                    );
                    FiberState::Except
                }
            };
            fiber.suspender.set(std::ptr::null());
            fiber.yield_state.set(state);
        }
    }

    fn root() -> Arc<Fiber> {
        let root = ROOT.with(|root| {
            root.borrow_mut()
                .get_or_insert_with(|| {
                    _ = FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
                    Arc::new(Fiber {
                        id: 0,
                        state: AtomicU8::new(FiberState::Exec as u8),
                        yield_state: Cell::new(FiberState::Exec),
                        stack_size: 0,
                        context: UnsafeCell::new(None),
                        suspender: Cell::new(std::ptr::null()),
                    })
                })
                .clone()
        });
        CURRENT.with(|current| current.set(Arc::as_ptr(&root)));
        root
    }

    /// The fiber running on this thread, the root fiber if no other is.
    #[must_use]
    pub fn current() -> Arc<Fiber> {
        let ptr = CURRENT.with(Cell::get);
        if ptr.is_null() {
            return Fiber::root();
        }
        unsafe {
            Arc::increment_strong_count(ptr);
            Arc::from_raw(ptr)
        }
    }

    /// Id of the running fiber, 0 outside of any fiber.
    #[must_use]
    pub fn current_id() -> u64 {
        let ptr = CURRENT.with(Cell::get);
        unsafe { ptr.as_ref() }.map_or(0, |fiber| fiber.id)
    }

    /// Returns `true` if called from a fiber that can yield.
    #[must_use]
    pub fn in_fiber() -> bool {
        let ptr = CURRENT.with(Cell::get);
        unsafe { ptr.as_ref() }.is_some_and(|fiber| !fiber.suspender.get().is_null())
    }

    /// The number of fibers alive in this process, root fibers included.
    #[must_use]
    pub fn total() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Switch into this fiber until it yields or its body ends.
    ///
    /// # Panics
    /// if the fiber is executing, finished, or is a root fiber.
    pub fn resume(&self) {
        let state = self.state();
        assert!(
            matches!(
                state,
                FiberState::Init | FiberState::Ready | FiberState::Hold
            ),
            "fiber {} can not be resumed in state {state}",
            self.id
        );
        let context = unsafe { &mut *self.context.get() }
            .as_mut()
            .unwrap_or_else(|| panic!("root fiber {} can not be resumed", self.id));
        let previous = CURRENT.with(|current| current.replace(self));
        self.yield_state.set(FiberState::Hold);
        self.set_state(FiberState::Exec);
        _ = context.switch_in();
        CURRENT.with(|current| current.set(previous));
        self.set_state(self.yield_state.get());
    }

    /// Switch out of the running fiber, it becomes `Ready`.
    pub fn yield_to_ready() {
        Fiber::yield_with(FiberState::Ready);
    }

    /// Switch out of the running fiber, it becomes `Hold`.
    pub fn yield_to_hold() {
        Fiber::yield_with(FiberState::Hold);
    }

    fn yield_with(state: FiberState) {
        let ptr = CURRENT.with(Cell::get);
        let Some(fiber) = (unsafe { ptr.as_ref() }) else {
            crate::warn!("yield outside of any fiber is ignored");
            return;
        };
        let suspender = fiber.suspender.get();
        if suspender.is_null() {
            crate::warn!("root fiber can not yield");
            return;
        }
        fiber.yield_state.set(state);
        unsafe { (*suspender).suspend(()) };
    }

    /// Rebind a finished or never started fiber to `body`, reusing its stack.
    ///
    /// # Panics
    /// if the fiber is in any other state or is a root fiber.
    pub fn reset(&self, body: impl FnOnce() + Send + 'static) {
        let state = self.state();
        assert!(
            matches!(
                state,
                FiberState::Init | FiberState::Term | FiberState::Except
            ),
            "fiber {} can not be reset in state {state}",
            self.id
        );
        let slot = unsafe { &mut *self.context.get() };
        let context = slot
            .take()
            .unwrap_or_else(|| panic!("root fiber {} can not be reset", self.id));
        *slot = Some(Context::new(
            context.into_stack(),
            Fiber::trampoline(Box::new(body)),
        ));
        self.set_state(FiberState::Init);
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        _ = FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        let state = self.state();
        let this: *const Fiber = self;
        if let Some(context) = self.context.get_mut() {
            if !std::thread::panicking() {
                assert_ne!(
                    FiberState::Exec,
                    state,
                    "fiber {} dropped while executing",
                    self.id
                );
            }
            if context.is_suspended() {
                unsafe { context.abandon() };
            }
        } else {
            _ = CURRENT.try_with(|current| {
                if current.get() == this {
                    current.set(std::ptr::null());
                }
            });
        }
    }
}
