use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

/// The handle a running context uses to switch back out.
pub(crate) type Suspender = Yielder<(), ()>;

/// A saved execution context on its own stack.
pub(crate) struct Context(Coroutine<(), (), (), DefaultStack>);

impl Context {
    pub(crate) fn allocate(stack_size: usize) -> std::io::Result<DefaultStack> {
        DefaultStack::new(stack_size.max(crate::common::page_size()))
    }

    /// `entry` runs on `stack` the first time the context is switched in.
    pub(crate) fn new(stack: DefaultStack, entry: impl FnOnce(&Suspender) + 'static) -> Self {
        Context(Coroutine::with_stack(stack, move |suspender: &Suspender, ()| {
            entry(suspender);
        }))
    }

    /// Run until the entry suspends or returns, `true` means it returned.
    pub(crate) fn switch_in(&mut self) -> bool {
        matches!(self.0.resume(()), CoroutineResult::Return(()))
    }

    /// Started and not finished.
    pub(crate) fn is_suspended(&self) -> bool {
        self.0.started() && !self.0.done()
    }

    /// Take the stack back, the context must not be suspended.
    pub(crate) fn into_stack(self) -> DefaultStack {
        self.0.into_stack()
    }

    /// Mark a suspended context finished without unwinding its stack.
    ///
    /// # Safety
    /// Values living on the stack are leaked.
    pub(crate) unsafe fn abandon(&mut self) {
        self.0.force_reset();
    }
}
