//! Context switching for coroutines, built on corosensei.
//!
//! Saving and restoring the callee-saved register bank is delegated to the
//! corosensei fiber library (per-architecture assembly for x86-64 and
//! aarch64); this module owns everything around that primitive: the stack
//! handoff, the trampoline that runs the entry closure, the panic boundary,
//! and the thread-local yielder used to suspend the running coroutine from
//! anywhere inside its call tree.
//!
//! ## Thread-local state
//!
//! `CURRENT_YIELDER` holds a raw pointer to the active coroutine's Yielder.
//! It is installed by the trampoline on first entry, re-installed by
//! `suspend_current` after every resume, and save/restored around each
//! switch so nested resumes (a coroutine resuming another coroutine) see
//! the right yielder.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};

use corosensei::{Coroutine, CoroutineResult, Yielder};

use crate::error::RtError;

use super::stack::{check_stack_size, StackSource};

thread_local! {
    /// Raw pointer to the current coroutine's Yielder.
    ///
    /// Stored as `*const ()` to erase the lifetime; the Yielder is borrowed
    /// from within the coroutine body and remains valid for the duration of
    /// the resume that installed it.
    static CURRENT_YIELDER: Cell<Option<*const ()>> = const { Cell::new(None) };
}

/// What a switch into a coroutine produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SwitchOutcome {
    /// The coroutine suspended; it can be switched into again.
    Yielded,
    /// The entry function returned (`clean`) or panicked (`!clean`).
    /// The context must not be switched into again.
    Completed { clean: bool },
}

/// Suspend the currently running coroutine, returning control to whoever
/// called `switch_in`.
///
/// After the suspension ends (the coroutine is resumed), the yielder is
/// re-installed into the thread-local because another coroutine may have
/// run on this thread in between and overwritten it.
///
/// Callers must have verified a coroutine is running on this thread; the
/// runtime keeps that check in the public `yield`/`await` entry points.
pub(crate) fn suspend_current() {
    CURRENT_YIELDER.with(|c| {
        let ptr = c
            .get()
            .expect("suspend_current called outside of coroutine context");
        // Safety: the pointer was installed by the trampoline of the
        // coroutine currently executing on this thread, and the Yielder it
        // points at is live for the duration of that execution.
        let yielder: &Yielder<(), ()> = unsafe { &*(ptr as *const Yielder<(), ()>) };
        yielder.suspend(());
        c.set(Some(ptr));
    });
}

// ---------------------------------------------------------------------------
// ContextHandle
// ---------------------------------------------------------------------------

/// An initialized execution context: a corosensei coroutine bound to an
/// owned-or-pooled stack, ready to run `entry` on first switch-in.
///
/// `ContextHandle` is `!Send`: the saved stack pointer is only meaningful
/// on the thread that created it.
pub(crate) struct ContextHandle {
    coro: Coroutine<(), (), bool, StackSource>,
}

impl ContextHandle {
    /// Build a context that will run `entry` on `stack`.
    ///
    /// The trampoline installs the yielder thread-local and catches panics
    /// so an unwinding entry never crosses back into runtime frames; the
    /// panic surfaces as `SwitchOutcome::Completed { clean: false }`.
    pub(crate) fn new<F>(stack: StackSource, entry: F) -> Result<Self, RtError>
    where
        F: FnOnce() + 'static,
    {
        check_stack_size(stack.stack_size())
            .map_err(|_| RtError::ContextMakeFailed("stack region below minimum size"))?;

        let coro = Coroutine::with_stack(stack, move |yielder: &Yielder<(), ()>, _input: ()| {
            CURRENT_YIELDER.with(|c| {
                c.set(Some(yielder as *const Yielder<(), ()> as *const ()));
            });
            catch_unwind(AssertUnwindSafe(entry)).is_ok()
        });

        Ok(ContextHandle { coro })
    }

    /// Switch into the context. Returns when it yields or completes.
    ///
    /// The caller's yielder (if any) is saved around the switch so that
    /// resuming a coroutine from inside another coroutine restores the
    /// outer one afterwards.
    pub(crate) fn switch_in(&mut self) -> SwitchOutcome {
        let saved = CURRENT_YIELDER.with(|c| c.take());
        let outcome = match self.coro.resume(()) {
            CoroutineResult::Yield(()) => SwitchOutcome::Yielded,
            CoroutineResult::Return(clean) => SwitchOutcome::Completed { clean },
        };
        CURRENT_YIELDER.with(|c| c.set(saved));
        outcome
    }

    /// Whether the entry function has returned.
    pub(crate) fn done(&self) -> bool {
        self.coro.done()
    }
}

impl std::fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHandle")
            .field("done", &self.done())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coro::stack::OwnedStack;
    use std::rc::Rc;

    fn fresh_stack() -> StackSource {
        StackSource::Owned(OwnedStack::new(64 * 1024).unwrap())
    }

    #[test]
    fn test_runs_to_completion() {
        let hits = Rc::new(Cell::new(0u32));
        let seen = Rc::clone(&hits);
        let mut ctx = ContextHandle::new(fresh_stack(), move || {
            seen.set(seen.get() + 1);
        })
        .unwrap();

        assert_eq!(ctx.switch_in(), SwitchOutcome::Completed { clean: true });
        assert!(ctx.done());
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_yield_and_resume() {
        let hits = Rc::new(Cell::new(0u32));
        let seen = Rc::clone(&hits);
        let mut ctx = ContextHandle::new(fresh_stack(), move || {
            seen.set(seen.get() + 1);
            suspend_current();
            seen.set(seen.get() + 1);
        })
        .unwrap();

        assert_eq!(ctx.switch_in(), SwitchOutcome::Yielded);
        assert!(!ctx.done());
        assert_eq!(hits.get(), 1);

        assert_eq!(ctx.switch_in(), SwitchOutcome::Completed { clean: true });
        assert!(ctx.done());
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn test_panic_is_contained() {
        let mut ctx = ContextHandle::new(fresh_stack(), || {
            panic!("entry blew up");
        })
        .unwrap();

        assert_eq!(ctx.switch_in(), SwitchOutcome::Completed { clean: false });
        assert!(ctx.done());
    }

    #[test]
    fn test_locals_survive_suspension() {
        let out = Rc::new(Cell::new(0u64));
        let sink = Rc::clone(&out);
        let mut ctx = ContextHandle::new(fresh_stack(), move || {
            let mut acc: u64 = 1;
            for _ in 0..3 {
                acc = acc * 10 + 1;
                suspend_current();
            }
            sink.set(acc);
        })
        .unwrap();

        while ctx.switch_in() == SwitchOutcome::Yielded {}
        assert_eq!(out.get(), 1111);
    }

    #[test]
    fn test_nested_contexts_restore_outer_yielder() {
        let order = Rc::new(std::cell::RefCell::new(Vec::new()));

        let inner_order = Rc::clone(&order);
        let mut inner = ContextHandle::new(fresh_stack(), move || {
            inner_order.borrow_mut().push("inner");
        })
        .unwrap();

        let outer_order = Rc::clone(&order);
        let mut outer = ContextHandle::new(fresh_stack(), move || {
            outer_order.borrow_mut().push("outer-before");
            inner.switch_in();
            // The outer coroutine's own yielder must still work.
            suspend_current();
            outer_order.borrow_mut().push("outer-after");
        })
        .unwrap();

        assert_eq!(outer.switch_in(), SwitchOutcome::Yielded);
        assert_eq!(outer.switch_in(), SwitchOutcome::Completed { clean: true });
        assert_eq!(
            *order.borrow(),
            vec!["outer-before", "inner", "outer-after"]
        );
    }
}
