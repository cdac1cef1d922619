//! The coroutine object: lifecycle state machine binding an entry closure,
//! a stack, an execution context, and the owning reactor.
//!
//! A coroutine is bound to the thread (and reactor) that created it for its
//! entire lifetime; its saved stack pointer is only meaningful there. The
//! handle is therefore `!Send`, and cross-thread wakeups travel as
//! [`CoroId`]s through the scheduler instead of as handles.
//!
//! ## Lifecycle
//!
//! ```text
//! Ready -> (Running <-> Suspended)* -> Completed
//!                                   \-> Failed     (entry panicked)
//! ```
//!
//! `Completed` and `Failed` are terminal; `resume` on either fails with
//! `IllegalState` and leaves the coroutine untouched.
//!
//! ## Current coroutine
//!
//! The sole process-wide mutable state is the thread-local stack of
//! currently running coroutines (a stack, not a single slot, because a
//! coroutine may resume another coroutine). [`current`] exposes the top;
//! `yield_now` and the promise await path use it to verify they were
//! called from inside a running coroutine.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::RtError;
use crate::reactor::Reactor;

use super::config::CoroutineConfig;
use super::context::{suspend_current, ContextHandle, SwitchOutcome};
use super::promise::PromiseCore;
use super::stack::{OwnedStack, StackSource};

// ---------------------------------------------------------------------------
// CoroId
// ---------------------------------------------------------------------------

/// Unique identifier for a coroutine.
///
/// Ids are assigned from a global atomic counter, so they are unique within
/// the process and safe to ship across threads as scheduler tokens.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoroId(u64);

impl CoroId {
    /// Generate a fresh, globally unique id.
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        CoroId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Debug for CoroId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CoroId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// CoroState
// ---------------------------------------------------------------------------

/// The execution state of a coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroState {
    /// Created, never resumed (or explicitly staged as runnable).
    Ready,
    /// Currently executing on the reactor thread.
    Running,
    /// Suspended at a yield or await point.
    Suspended,
    /// Entry returned. Terminal.
    Completed,
    /// Entry panicked; the panic was contained at the context boundary.
    /// Terminal.
    Failed,
}

impl CoroState {
    /// Terminal states admit no further resume.
    pub fn is_terminal(self) -> bool {
        matches!(self, CoroState::Completed | CoroState::Failed)
    }
}

// ---------------------------------------------------------------------------
// Thread-local current coroutine
// ---------------------------------------------------------------------------

thread_local! {
    static CURRENT: RefCell<Vec<Coroutine>> = const { RefCell::new(Vec::new()) };
}

/// The coroutine currently running on this thread, if any.
pub fn current() -> Option<Coroutine> {
    CURRENT.with(|c| c.borrow().last().cloned())
}

fn push_current(co: Coroutine) {
    CURRENT.with(|c| c.borrow_mut().push(co));
}

fn pop_current() {
    CURRENT.with(|c| {
        c.borrow_mut().pop();
    });
}

/// Suspend the currently running coroutine, returning control to whoever
/// resumed it. The coroutine stays resumable and is typically re-staged
/// via the scheduler.
///
/// Fails with `IllegalState` when no coroutine is running on this thread.
pub fn yield_now() -> Result<(), RtError> {
    let co = current().ok_or(RtError::IllegalState("yield outside a coroutine"))?;
    co.inner.state.set(CoroState::Suspended);
    suspend_current();
    Ok(())
}

// ---------------------------------------------------------------------------
// Coroutine
// ---------------------------------------------------------------------------

struct CoroInner {
    id: CoroId,
    reactor: Reactor,
    state: Cell<CoroState>,
    stack_size: usize,
    pooled: bool,
    /// The execution context. `None` after completion or destroy; dropping
    /// it releases the stack (frees an owned one, returns a pooled slot).
    context: RefCell<Option<ContextHandle>>,
    /// The promise this coroutine is awaiting, while suspended in `wait`.
    waiting: RefCell<Option<Arc<PromiseCore>>>,
}

/// A cloneable handle to one coroutine. All clones refer to the same
/// underlying object; the coroutine's memory is released when the last
/// clone drops (after the reactor unregisters it on completion/destroy).
#[derive(Clone)]
pub struct Coroutine {
    inner: Rc<CoroInner>,
}

impl Coroutine {
    /// Create a coroutine bound to `reactor`, in state `Ready`.
    ///
    /// The stack comes from `config.pool` when set (borrowed slot,
    /// returned on destroy) or is freshly mapped with a guard page
    /// otherwise. The context is initialized so the first resume enters
    /// `entry` on the new stack.
    pub fn new<F>(reactor: &Reactor, config: &CoroutineConfig, entry: F) -> Result<Self, RtError>
    where
        F: FnOnce() + 'static,
    {
        let stack = match &config.pool {
            Some(pool) => StackSource::Pooled(pool.acquire()?),
            None => StackSource::Owned(OwnedStack::new(config.stack_size)?),
        };
        let stack_size = stack.stack_size();
        let pooled = stack.is_pooled();

        let context = ContextHandle::new(stack, entry)?;

        let co = Coroutine {
            inner: Rc::new(CoroInner {
                id: CoroId::next(),
                reactor: reactor.clone(),
                state: Cell::new(CoroState::Ready),
                stack_size,
                pooled,
                context: RefCell::new(Some(context)),
                waiting: RefCell::new(None),
            }),
        };
        reactor.register_coroutine(&co);
        log::trace!(
            "created coroutine {:?} (stack_size={}, pooled={})",
            co.id(),
            stack_size,
            pooled
        );
        Ok(co)
    }

    /// This coroutine's id.
    pub fn id(&self) -> CoroId {
        self.inner.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CoroState {
        self.inner.state.get()
    }

    /// Usable stack size in bytes.
    pub fn stack_size(&self) -> usize {
        self.inner.stack_size
    }

    /// Whether the stack is borrowed from a pool.
    pub fn is_pooled(&self) -> bool {
        self.inner.pooled
    }

    /// The reactor this coroutine is bound to.
    pub fn reactor(&self) -> &Reactor {
        &self.inner.reactor
    }

    /// Whether this coroutine is suspended awaiting a promise.
    pub fn is_awaiting(&self) -> bool {
        self.inner.waiting.borrow().is_some()
    }

    /// Transfer control into the coroutine. Returns when it next yields,
    /// awaits, or completes.
    ///
    /// Legal only from `Ready` or `Suspended`, on the coroutine's home
    /// thread. A failed resume leaves the coroutine in its prior state.
    pub fn resume(&self) -> Result<(), RtError> {
        match self.state() {
            CoroState::Ready | CoroState::Suspended => {}
            CoroState::Running => {
                return Err(RtError::IllegalState("resume of a running coroutine"));
            }
            CoroState::Completed | CoroState::Failed => {
                return Err(RtError::IllegalState("resume of a completed coroutine"));
            }
        }

        // A coroutine parked on a promise is only runnable once the promise
        // completed; the scheduler upholds this, direct callers must too.
        if let Some(promise) = self.inner.waiting.borrow().as_ref() {
            if !promise.is_completed() {
                return Err(RtError::IllegalState(
                    "resume of a coroutine awaiting a pending promise",
                ));
            }
        }

        let mut slot = self
            .inner
            .context
            .try_borrow_mut()
            .map_err(|_| RtError::IllegalState("re-entrant resume"))?;
        let Some(context) = slot.as_mut() else {
            return Err(RtError::IllegalState("resume of a destroyed coroutine"));
        };

        self.inner.state.set(CoroState::Running);
        push_current(self.clone());
        let outcome = context.switch_in();
        pop_current();

        match outcome {
            SwitchOutcome::Yielded => {
                // yield_now / the await path set Suspended before switching
                // out; cover direct context-level suspends too.
                if self.state() == CoroState::Running {
                    self.inner.state.set(CoroState::Suspended);
                }
            }
            SwitchOutcome::Completed { clean } => {
                self.inner.state.set(if clean {
                    CoroState::Completed
                } else {
                    CoroState::Failed
                });
                // Tear down the context now: this releases the stack
                // (returns a pooled slot) without waiting for the last
                // handle clone to drop.
                *slot = None;
                drop(slot);
                self.inner.reactor.unregister_coroutine(self.id());
                log::trace!("coroutine {:?} finished: {:?}", self.id(), self.state());
            }
        }
        Ok(())
    }

    /// Stage this coroutine on its reactor's scheduler for the next tick.
    pub fn schedule(&self) -> Result<(), RtError> {
        self.inner.reactor.scheduler().schedule(self)
    }

    /// Tear down the coroutine: drop its context and release the stack.
    ///
    /// Legal from any state except `Running`. Destroying a suspended
    /// coroutine unwinds its stack so live locals run their destructors.
    pub fn destroy(&self) -> Result<(), RtError> {
        if self.state() == CoroState::Running {
            return Err(RtError::IllegalState("destroy of a running coroutine"));
        }
        let mut slot = self
            .inner
            .context
            .try_borrow_mut()
            .map_err(|_| RtError::IllegalState("destroy of a running coroutine"))?;
        *slot = None;
        drop(slot);
        *self.inner.waiting.borrow_mut() = None;
        self.inner.reactor.unregister_coroutine(self.id());
        Ok(())
    }

    /// Record that this coroutine is about to suspend awaiting `promise`.
    ///
    /// Pins the reactor across the suspension so a producer callback
    /// in-flight on another thread never finds its wake target's reactor
    /// torn down.
    pub(crate) fn begin_wait(&self, promise: Arc<PromiseCore>) {
        *self.inner.waiting.borrow_mut() = Some(promise);
        self.inner.state.set(CoroState::Suspended);
        self.inner.reactor.retain();
    }

    /// Clear the await linkage after the coroutine resumes.
    pub(crate) fn end_wait(&self) {
        *self.inner.waiting.borrow_mut() = None;
        self.inner.reactor.release();
    }
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("stack_size", &self.stack_size())
            .field("pooled", &self.is_pooled())
            .field("awaiting", &self.is_awaiting())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coro::config::PoolConfig;
    use crate::coro::pool::StackPool;

    fn reactor() -> Reactor {
        Reactor::new()
    }

    #[test]
    fn test_run_to_completion_writes_result() {
        let reactor = reactor();
        let out = Rc::new(Cell::new(0i64));
        let sink = Rc::clone(&out);
        let co = Coroutine::new(&reactor, &CoroutineConfig::default(), move || {
            sink.set(42);
        })
        .unwrap();

        assert_eq!(co.state(), CoroState::Ready);
        co.resume().unwrap();

        assert_eq!(out.get(), 42);
        assert_eq!(co.state(), CoroState::Completed);
        assert!(current().is_none());
    }

    #[test]
    fn test_yield_ladder() {
        let reactor = reactor();
        let counter = Rc::new(Cell::new(0u32));
        let seen = Rc::clone(&counter);
        let co = Coroutine::new(&reactor, &CoroutineConfig::default(), move || {
            seen.set(seen.get() + 1);
            yield_now().unwrap();
            seen.set(seen.get() + 1);
            yield_now().unwrap();
            seen.set(seen.get() + 1);
        })
        .unwrap();

        co.resume().unwrap();
        assert_eq!(counter.get(), 1);
        assert_eq!(co.state(), CoroState::Suspended);

        co.resume().unwrap();
        assert_eq!(counter.get(), 2);
        assert_eq!(co.state(), CoroState::Suspended);

        co.resume().unwrap();
        assert_eq!(counter.get(), 3);
        assert_eq!(co.state(), CoroState::Completed);
    }

    #[test]
    fn test_resume_after_completion_fails() {
        let reactor = reactor();
        let co = Coroutine::new(&reactor, &CoroutineConfig::default(), || {}).unwrap();
        co.resume().unwrap();
        assert_eq!(co.state(), CoroState::Completed);
        assert_eq!(
            co.resume(),
            Err(RtError::IllegalState("resume of a completed coroutine"))
        );
        // The failed resume left the state alone.
        assert_eq!(co.state(), CoroState::Completed);
    }

    #[test]
    fn test_yield_outside_coroutine_fails() {
        assert_eq!(
            yield_now(),
            Err(RtError::IllegalState("yield outside a coroutine"))
        );
    }

    #[test]
    fn test_panic_becomes_failed_state() {
        let reactor = reactor();
        let co = Coroutine::new(&reactor, &CoroutineConfig::default(), || {
            panic!("entry exploded");
        })
        .unwrap();
        co.resume().unwrap();
        assert_eq!(co.state(), CoroState::Failed);
        assert!(co.state().is_terminal());
        assert_eq!(
            co.resume(),
            Err(RtError::IllegalState("resume of a completed coroutine"))
        );
    }

    #[test]
    fn test_invalid_stack_size_rejected() {
        let reactor = reactor();
        let err = Coroutine::new(
            &reactor,
            &CoroutineConfig {
                stack_size: 16,
                pool: None,
            },
            || {},
        )
        .err();
        assert_eq!(err, Some(RtError::InvalidArgument("stack size out of range")));
    }

    #[test]
    fn test_destroy_suspended_coroutine_runs_destructors() {
        struct DropFlag(Rc<Cell<bool>>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let reactor = reactor();
        let dropped = Rc::new(Cell::new(false));
        let flag = DropFlag(Rc::clone(&dropped));
        let co = Coroutine::new(&reactor, &CoroutineConfig::default(), move || {
            let _guard = flag;
            yield_now().unwrap();
            // Never reached: the coroutine is destroyed while suspended.
            unreachable!();
        })
        .unwrap();

        co.resume().unwrap();
        assert_eq!(co.state(), CoroState::Suspended);
        assert!(!dropped.get());

        co.destroy().unwrap();
        assert!(dropped.get());
        assert_eq!(
            co.resume(),
            Err(RtError::IllegalState("resume of a destroyed coroutine"))
        );
    }

    #[test]
    fn test_pooled_coroutine_returns_slot_on_completion() {
        let reactor = reactor();
        let pool = StackPool::new(PoolConfig {
            initial_count: 1,
            use_guard_pages: false,
            ..Default::default()
        })
        .unwrap();
        let config = CoroutineConfig {
            pool: Some(Arc::clone(&pool)),
            ..Default::default()
        };

        let co = Coroutine::new(&reactor, &config, || {}).unwrap();
        assert!(co.is_pooled());
        assert_eq!(pool.stats().in_use_now, 1);

        co.resume().unwrap();
        // Completion tears down the context, which returns the slot.
        assert_eq!(pool.stats().in_use_now, 0);
        assert_eq!(pool.stats().free_now, 1);
    }

    #[test]
    fn test_pool_reuse_across_many_coroutines() {
        let reactor = reactor();
        let pool = StackPool::new(PoolConfig {
            initial_count: 16,
            use_guard_pages: false,
            ..Default::default()
        })
        .unwrap();
        let config = CoroutineConfig {
            pool: Some(Arc::clone(&pool)),
            ..Default::default()
        };

        for _ in 0..100 {
            let co = Coroutine::new(&reactor, &config, || {}).unwrap();
            co.resume().unwrap();
            assert_eq!(co.state(), CoroState::Completed);
        }

        let stats = pool.stats();
        // Sequential creates never exceed the warmed-up set.
        assert_eq!(stats.created, 16);
        assert_eq!(stats.acquired, 100);
        assert_eq!(stats.released, 100);
        assert!(stats.peak_in_use <= 100);
        assert_eq!(stats.free_now as u64, stats.created);
        assert_eq!(stats.in_use_now, 0);
    }

    #[test]
    fn test_single_runner_observed_from_inside() {
        let reactor = reactor();
        let ok = Rc::new(Cell::new(false));
        let seen = Rc::clone(&ok);
        let co = Coroutine::new(&reactor, &CoroutineConfig::default(), move || {
            let me = current().expect("running coroutine is current");
            seen.set(me.state() == CoroState::Running);
        })
        .unwrap();
        co.resume().unwrap();
        assert!(ok.get());
    }

    #[test]
    fn test_lifecycle_monotonic_over_yields() {
        let reactor = reactor();
        let co = Coroutine::new(&reactor, &CoroutineConfig::default(), || {
            for _ in 0..3 {
                yield_now().unwrap();
            }
        })
        .unwrap();

        let mut states = vec![co.state()];
        while !co.state().is_terminal() {
            co.resume().unwrap();
            states.push(co.state());
        }
        assert_eq!(
            states,
            vec![
                CoroState::Ready,
                CoroState::Suspended,
                CoroState::Suspended,
                CoroState::Suspended,
                CoroState::Completed,
            ]
        );
    }
}
