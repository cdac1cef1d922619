//! Error type for the runtime API.
//!
//! `RtError` covers misuse and resource failures of the runtime itself.
//! Operation-level failures (a lookup that returned no records, a request
//! that timed out) travel through the promise `status` channel as an `i32`
//! and never surface as an `RtError`.

use thiserror::Error;

/// Errors returned across the runtime API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RtError {
    /// A required argument was missing or out of range (e.g. a stack size
    /// outside the supported bounds).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Arena, stack, or context memory could not be allocated.
    #[error("allocation failed: {0}")]
    AllocationFailed(&'static str),

    /// The stack pool is at `max_count` and its free list is empty.
    #[error("stack pool exhausted")]
    PoolExhausted,

    /// An operation was called in a state that forbids it (resume of a
    /// completed coroutine, await outside a coroutine, double complete).
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// The scheduler ready queue is at capacity.
    #[error("scheduler ready queue full")]
    SchedulerFull,

    /// The execution context could not be initialized for the given stack.
    #[error("context initialization failed: {0}")]
    ContextMakeFailed(&'static str),
}
