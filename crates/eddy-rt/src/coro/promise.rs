//! One-shot completion promises linking callback-based operations to
//! awaiting coroutines.
//!
//! A promise transitions `pending -> completed` exactly once, carrying an
//! `i32` status and an optional typed result. At most one coroutine waits
//! on it. Completion with a waiter attached never resumes the waiter
//! synchronously: the waiter is staged on the owning reactor's scheduler,
//! so the completing callback always returns to its caller before the
//! awaiter runs, and callback chains cannot grow the stack without bound.
//!
//! `Promise` is `Clone + Send + Sync`; producers on other threads hold a
//! clone and call [`Promise::complete`] from their callbacks. Producers
//! must hand over owned (deep-copied) data: their source buffers are
//! typically invalidated as soon as the callback returns.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::RtError;
use crate::reactor::Reactor;

use super::context::suspend_current;
use super::coroutine::{current, CoroId};
use super::scheduler::SchedulerShared;

// ---------------------------------------------------------------------------
// PromiseCore
// ---------------------------------------------------------------------------

struct CoreState {
    completed: bool,
    status: i32,
    waiter: Option<CoroId>,
}

/// The untyped half of a promise: completion flag, status, waiter linkage,
/// and the scheduler handle used to wake the waiter. Shared between the
/// promise and the awaiting coroutine (neither owns the other; both links
/// are cleared as the waiter resumes).
pub(crate) struct PromiseCore {
    sched: Arc<SchedulerShared>,
    state: Mutex<CoreState>,
}

impl PromiseCore {
    pub(crate) fn is_completed(&self) -> bool {
        self.state.lock().completed
    }
}

// ---------------------------------------------------------------------------
// Promise
// ---------------------------------------------------------------------------

/// A one-shot completion cell with at most one waiting coroutine.
pub struct Promise<T> {
    core: Arc<PromiseCore>,
    result: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            core: Arc::clone(&self.core),
            result: Arc::clone(&self.result),
        }
    }
}

impl<T: Send + 'static> Promise<T> {
    /// Create a pending promise owned by `reactor`.
    pub fn new(reactor: &Reactor) -> Self {
        Promise {
            core: Arc::new(PromiseCore {
                sched: reactor.scheduler().shared(),
                state: Mutex::new(CoreState {
                    completed: false,
                    status: 0,
                    waiter: None,
                }),
            }),
            result: Arc::new(Mutex::new(None)),
        }
    }

    /// Complete the promise with `status` and an optional result.
    ///
    /// Idempotence-guarded: the first call wins, later calls fail with
    /// `IllegalState` and change nothing. If a coroutine is waiting it is
    /// staged on the owner reactor's scheduler (never resumed inline) and
    /// the waiter link is cleared.
    pub fn complete(&self, status: i32, result: Option<T>) -> Result<(), RtError> {
        let waiter = {
            let mut state = self.core.state.lock();
            if state.completed {
                return Err(RtError::IllegalState("promise already completed"));
            }
            // Publish the result before the completed flag so any observer
            // that sees `completed` also sees the payload.
            *self.result.lock() = result;
            state.completed = true;
            state.status = status;
            state.waiter.take()
        };

        if let Some(id) = waiter {
            log::trace!("promise completed (status={}), waking {:?}", status, id);
            self.core.sched.schedule_id(id)?;
        }
        Ok(())
    }

    /// Whether the promise has completed.
    pub fn is_completed(&self) -> bool {
        self.core.is_completed()
    }

    /// The completion status, or `None` while pending.
    pub fn status(&self) -> Option<i32> {
        let state = self.core.state.lock();
        state.completed.then_some(state.status)
    }

    /// The completion result, or `None` while pending or when the producer
    /// completed without one.
    ///
    /// Non-consuming: after completion the result is frozen alongside the
    /// status, so repeated reads observe the same value.
    pub fn result(&self) -> Option<T>
    where
        T: Clone,
    {
        if !self.is_completed() {
            return None;
        }
        self.result.lock().clone()
    }

    /// Suspend the current coroutine until this promise completes, then
    /// return its status.
    ///
    /// If the promise already completed, returns the status immediately
    /// without yielding (observable as zero scheduler wakeups). Otherwise
    /// the coroutine is attached as the waiter, the reactor is pinned for
    /// the duration of the suspension, and control returns to whoever
    /// resumed the coroutine until a completion wakes it through the
    /// scheduler.
    ///
    /// Fails with `IllegalState` when called outside a running coroutine
    /// or when another coroutine is already waiting on this promise. The
    /// promise is unaffected by a failed call.
    pub fn wait(&self) -> Result<i32, RtError> {
        let co = current().ok_or(RtError::IllegalState("await outside a coroutine"))?;

        {
            let mut state = self.core.state.lock();
            if state.completed {
                return Ok(state.status);
            }
            if state.waiter.is_some() {
                return Err(RtError::IllegalState("promise already has a waiter"));
            }
            state.waiter = Some(co.id());
        }

        co.begin_wait(Arc::clone(&self.core));
        suspend_current();
        co.end_wait();

        let state = self.core.state.lock();
        debug_assert!(state.completed, "awaiter woken before completion");
        Ok(state.status)
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.core.state.lock();
        f.debug_struct("Promise")
            .field("completed", &state.completed)
            .field("status", &state.status)
            .field("has_waiter", &state.waiter.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coro::config::CoroutineConfig;
    use crate::coro::coroutine::{CoroState, Coroutine};
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_complete_once_then_frozen() {
        let reactor = Reactor::new();
        let p: Promise<String> = Promise::new(&reactor);
        assert!(!p.is_completed());
        assert_eq!(p.status(), None);

        p.complete(0, Some("answer".to_string())).unwrap();
        assert!(p.is_completed());
        assert_eq!(p.status(), Some(0));

        // Second completion fails and does not overwrite anything.
        assert_eq!(
            p.complete(-1, Some("other".to_string())),
            Err(RtError::IllegalState("promise already completed"))
        );
        assert_eq!(p.status(), Some(0));
        assert_eq!(p.result().as_deref(), Some("answer"));
        // Reads do not consume: the result stays frozen in the promise.
        assert_eq!(p.result().as_deref(), Some("answer"));
    }

    #[test]
    fn test_result_pending_is_none() {
        let reactor = Reactor::new();
        let p: Promise<u32> = Promise::new(&reactor);
        assert_eq!(p.result(), None);
    }

    #[test]
    fn test_wait_outside_coroutine_fails() {
        let reactor = Reactor::new();
        let p: Promise<()> = Promise::new(&reactor);
        assert_eq!(
            p.wait(),
            Err(RtError::IllegalState("await outside a coroutine"))
        );
        // The failed await did not attach a waiter or complete anything.
        assert!(!p.is_completed());
    }

    #[test]
    fn test_await_round_trip_through_scheduler() {
        let reactor = Reactor::new();
        let p: Promise<&'static str> = Promise::new(&reactor);

        let observed = Rc::new(Cell::new(0i32));
        let seen = Rc::clone(&observed);
        let inner = p.clone();
        let co = Coroutine::new(&reactor, &CoroutineConfig::default(), move || {
            seen.set(inner.wait().unwrap());
        })
        .unwrap();

        co.resume().unwrap();
        assert_eq!(co.state(), CoroState::Suspended);
        assert!(co.is_awaiting());

        p.complete(7, Some("payload")).unwrap();
        // The completion staged the waiter; nothing ran inline.
        assert_eq!(observed.get(), 0);
        assert_eq!(reactor.scheduler().ready_count(), 1);

        let resumed = reactor.scheduler_tick();
        assert_eq!(resumed, 1);
        assert_eq!(observed.get(), 7);
        assert_eq!(co.state(), CoroState::Completed);
        assert!(!co.is_awaiting());
        assert_eq!(p.result(), Some("payload"));
    }

    #[test]
    fn test_precompleted_fast_path_skips_scheduler() {
        let reactor = Reactor::new();
        let p: Promise<u64> = Promise::new(&reactor);
        p.complete(3, Some(99)).unwrap();

        let observed = Rc::new(Cell::new(0i32));
        let seen = Rc::clone(&observed);
        let inner = p.clone();
        let co = Coroutine::new(&reactor, &CoroutineConfig::default(), move || {
            seen.set(inner.wait().unwrap());
        })
        .unwrap();

        // One resume runs straight through: the await never yields.
        co.resume().unwrap();
        assert_eq!(co.state(), CoroState::Completed);
        assert_eq!(observed.get(), 3);
        assert_eq!(reactor.scheduler().stats().total_scheduled, 0);
    }

    #[test]
    fn test_manual_resume_of_parked_awaiter_fails() {
        let reactor = Reactor::new();
        let p: Promise<()> = Promise::new(&reactor);
        let inner = p.clone();
        let co = Coroutine::new(&reactor, &CoroutineConfig::default(), move || {
            let _ = inner.wait();
        })
        .unwrap();

        co.resume().unwrap();
        assert_eq!(
            co.resume(),
            Err(RtError::IllegalState(
                "resume of a coroutine awaiting a pending promise"
            ))
        );
        // Complete and drain properly.
        p.complete(0, None).unwrap();
        reactor.scheduler_tick();
        assert_eq!(co.state(), CoroState::Completed);
    }

    #[test]
    fn test_reactor_pinned_across_await() {
        let reactor = Reactor::new();
        let p: Promise<()> = Promise::new(&reactor);
        let inner = p.clone();
        let co = Coroutine::new(&reactor, &CoroutineConfig::default(), move || {
            let _ = inner.wait();
        })
        .unwrap();

        let before = reactor.refcount();
        co.resume().unwrap();
        assert_eq!(reactor.refcount(), before + 1);

        p.complete(0, None).unwrap();
        reactor.scheduler_tick();
        assert_eq!(reactor.refcount(), before);
        assert_eq!(co.state(), CoroState::Completed);
    }

    #[test]
    fn test_second_waiter_rejected() {
        let reactor = Reactor::new();
        let p: Promise<()> = Promise::new(&reactor);

        let first = p.clone();
        let a = Coroutine::new(&reactor, &CoroutineConfig::default(), move || {
            let _ = first.wait();
        })
        .unwrap();
        a.resume().unwrap();

        let second = p.clone();
        let got = Rc::new(Cell::new(None));
        let sink = Rc::clone(&got);
        let b = Coroutine::new(&reactor, &CoroutineConfig::default(), move || {
            sink.set(Some(second.wait()));
        })
        .unwrap();
        b.resume().unwrap();
        assert_eq!(
            got.get(),
            Some(Err(RtError::IllegalState("promise already has a waiter")))
        );

        p.complete(0, None).unwrap();
        reactor.scheduler_tick();
        assert_eq!(a.state(), CoroState::Completed);
    }

    #[test]
    fn test_error_status_returned_verbatim() {
        let reactor = Reactor::new();
        let p: Promise<()> = Promise::new(&reactor);
        let observed = Rc::new(Cell::new(0i32));
        let seen = Rc::clone(&observed);
        let inner = p.clone();
        let co = Coroutine::new(&reactor, &CoroutineConfig::default(), move || {
            seen.set(inner.wait().unwrap());
        })
        .unwrap();
        co.resume().unwrap();

        // A nonzero status is an operation-level failure: it travels back
        // through await unchanged, not as a runtime error.
        p.complete(-104, None).unwrap();
        reactor.scheduler_tick();
        assert_eq!(observed.get(), -104);
        assert_eq!(co.state(), CoroState::Completed);
    }
}
