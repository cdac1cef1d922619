//! Stackful coroutine runtime for event-driven reactors.
//!
//! eddy-rt layers an await-style programming model on top of a
//! callback-based event loop: a coroutine suspends itself to wait for the
//! completion of an asynchronous operation and resumes transparently once
//! that operation finishes, without the caller decomposing its code into
//! callbacks.
//!
//! ## Core pieces
//!
//! - [`coro::Coroutine`]: a user-space execution unit with its own stack,
//!   bound to the reactor (and thread) that created it.
//! - [`coro::Promise`]: a one-shot completion cell with at most one
//!   waiting coroutine; [`Promise::wait`](coro::Promise::wait) is the
//!   await operation.
//! - [`coro::Scheduler`]: a bounded FIFO of ready coroutines, drained up
//!   to a per-tick budget from the reactor loop.
//! - [`coro::StackPool`]: recycled, optionally guard-page-protected stacks
//!   (stack allocation dominates coroutine creation cost at scale).
//! - [`Reactor`]: the minimal event-loop collaborator surface the core
//!   consumes (arena, work queue, lifetime pins, handle accounting).
//! - [`adapter`]: the contract callback-based operations follow to become
//!   awaitable, with [`adapter::await_deferred`] as the canonical shim.
//!
//! ## Example
//!
//! ```
//! use eddy_rt::{adapter, Reactor};
//!
//! let reactor = Reactor::new();
//! let inner = reactor.clone();
//! reactor
//!     .spawn(move || {
//!         let (status, result) = adapter::await_deferred::<u32, _>(&inner, |promise| {
//!             // A real adapter submits a callback-based operation here;
//!             // its completion callback calls `promise.complete(...)`.
//!             promise.complete(0, Some(42)).unwrap();
//!         })
//!         .unwrap();
//!         assert_eq!(status, 0);
//!         assert_eq!(result, Some(42));
//!     })
//!     .unwrap();
//! reactor.run();
//! ```

pub mod adapter;
pub mod arena;
pub mod coro;
pub mod error;
pub mod reactor;

pub use arena::Arena;
pub use coro::{
    current, yield_now, CoroId, CoroState, Coroutine, CoroutineConfig, PoolConfig, PoolStats,
    Promise, QueueKind, Scheduler, SchedulerConfig, SchedulerStats, StackPool,
    DEFAULT_STACK_SIZE, MAX_STACK_SIZE, MIN_STACK_SIZE,
};
pub use error::RtError;
pub use reactor::{HandleId, HandleKind, Reactor};
