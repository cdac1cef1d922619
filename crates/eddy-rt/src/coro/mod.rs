//! Coroutine core: context switching, stacks and pools, the coroutine
//! lifecycle, promises, and the FIFO scheduler.
//!
//! ## Architecture
//!
//! - **Context** (`context.rs`): switches between execution flows via the
//!   corosensei fiber library; owns the trampoline, the panic boundary,
//!   and the thread-local yielder.
//! - **Stack** (`stack.rs`) / **Pool** (`pool.rs`): guard-page-protected
//!   stack regions, owned per coroutine or recycled through a free list.
//! - **Coroutine** (`coroutine.rs`): the lifecycle state machine binding
//!   entry closure, stack, context, and owning reactor.
//! - **Promise** (`promise.rs`): one-shot completion cells bridging
//!   callback-based operations to awaiting coroutines.
//! - **Scheduler** (`scheduler.rs`): bounded FIFO of ready coroutines,
//!   drained with a per-tick resume budget by the reactor.
//!
//! Coroutines are pinned to the reactor thread that created them; only
//! scheduler enqueues (and promise completions, which cause them) may come
//! from other threads.

pub mod config;
pub mod context;
pub mod coroutine;
pub mod pool;
pub mod promise;
pub mod scheduler;
pub mod stack;

pub use config::{CoroutineConfig, PoolConfig, QueueKind, SchedulerConfig};
pub use coroutine::{current, yield_now, CoroId, CoroState, Coroutine};
pub use pool::{PoolStats, StackPool};
pub use promise::Promise;
pub use scheduler::{Scheduler, SchedulerStats};
pub use stack::{DEFAULT_STACK_SIZE, MAX_STACK_SIZE, MIN_STACK_SIZE};
