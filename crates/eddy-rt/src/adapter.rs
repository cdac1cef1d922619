//! Adapter contract: how callback-based asynchronous operations become
//! awaitable.
//!
//! Any primitive that wants to be awaited follows the same sequence:
//!
//! 1. Create a [`Promise`] on the owning reactor.
//! 2. Package a completion record: a clone of the promise plus whatever
//!    the callback needs to fill in on success.
//! 3. Submit the underlying callback-driven operation.
//! 4. Call [`Promise::wait`] from the coroutine.
//! 5. Drop the promise after `wait` returns.
//!
//! The completion callback deep-copies its results into owned storage (or
//! the reactor [`Arena`](crate::arena::Arena) for raw buffers) and calls
//! [`Promise::complete`], which stages the coroutine on the scheduler.
//! Source buffers are typically invalidated the moment the callback
//! returns, so handing the promise borrowed data is never correct.
//!
//! ## Deferred start
//!
//! A submission call may complete the promise synchronously (a resolver
//! with a cached answer, a connection that opens immediately). If that
//! happens before the coroutine reached its yield point, the wake has no
//! one to wake. [`await_deferred`] is the canonical fix: the submission is
//! posted through the reactor's work queue, so the order is strictly
//!
//! ```text
//! create promise -> await (yield) -> next tick -> submit -> callback
//!   -> complete -> scheduler -> resume
//! ```
//!
//! which makes the pre-completed fast path in `wait` an optimization
//! rather than a correctness requirement.

use crate::coro::promise::Promise;
use crate::error::RtError;
use crate::reactor::{HandleKind, Reactor};

/// Submit `submit` on the next reactor iteration and await its completion.
///
/// `submit` receives a clone of the promise: it starts the underlying
/// operation and arranges for some callback to eventually call
/// [`Promise::complete`] on it (possibly synchronously, inside `submit`
/// itself). Returns the completion status and the result, if the producer
/// attached one.
///
/// Must be called from inside a running coroutine.
pub fn await_deferred<T, F>(reactor: &Reactor, submit: F) -> Result<(i32, Option<T>), RtError>
where
    T: Clone + Send + 'static,
    F: FnOnce(Promise<T>) + 'static,
{
    let promise: Promise<T> = Promise::new(reactor);
    let handle = reactor.register_handle(HandleKind::Adapter);

    let producer = promise.clone();
    reactor.queue_work(move || submit(producer));

    let status = promise.wait();
    reactor.close_handle(handle);
    let status = status?;
    let result = promise.result();
    Ok((status, result))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
