//! Configuration for coroutines, stack pools, and the scheduler.

use std::sync::Arc;

use super::pool::StackPool;
use super::stack::DEFAULT_STACK_SIZE;

// ---------------------------------------------------------------------------
// CoroutineConfig
// ---------------------------------------------------------------------------

/// Per-coroutine creation options.
#[derive(Clone)]
pub struct CoroutineConfig {
    /// Stack size in bytes. Ignored when `pool` is set (the pool's configured
    /// stack size wins). Default 64 KiB.
    pub stack_size: usize,

    /// Borrow the stack from this pool instead of allocating a fresh one.
    /// The slot is returned to the pool when the coroutine is destroyed.
    pub pool: Option<Arc<StackPool>>,
}

impl Default for CoroutineConfig {
    fn default() -> Self {
        CoroutineConfig {
            stack_size: DEFAULT_STACK_SIZE,
            pool: None,
        }
    }
}

impl std::fmt::Debug for CoroutineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoroutineConfig")
            .field("stack_size", &self.stack_size)
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// PoolConfig
// ---------------------------------------------------------------------------

/// Stack pool creation options.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Stack size for every slot in the pool. Default 64 KiB.
    pub stack_size: usize,

    /// Slots pre-allocated at pool creation. Default 64.
    pub initial_count: usize,

    /// Upper bound on live slots. 0 means unbounded. Default 0.
    pub max_count: usize,

    /// Map each stack with a no-access guard page below it so overflow
    /// faults instead of corrupting neighboring memory. Default true.
    pub use_guard_pages: bool,

    /// Whether the pool is intended to be shared across threads. The pool
    /// is always internally mutex-guarded; this flag records intent only.
    /// Default false.
    pub thread_safe: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            stack_size: DEFAULT_STACK_SIZE,
            initial_count: 64,
            max_count: 0,
            use_guard_pages: true,
            thread_safe: false,
        }
    }
}

// ---------------------------------------------------------------------------
// SchedulerConfig
// ---------------------------------------------------------------------------

/// Which producers may enqueue on the ready queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueKind {
    /// Only the reactor thread enqueues (plain locked FIFO).
    Spsc,
    /// Any thread may enqueue; only the reactor thread dequeues. This is
    /// what lets a producer callback on a driver thread wake a coroutine
    /// owned by the reactor thread.
    #[default]
    Mpsc,
}

/// Scheduler creation options.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Ready queue capacity. Enqueue past this bound fails with
    /// `SchedulerFull`; producers never block. Default 4096.
    pub ready_capacity: usize,

    /// Maximum coroutines resumed per tick. Default 64.
    pub max_resume_per_tick: usize,

    /// Ready queue flavor. Default MPSC.
    pub queue_kind: QueueKind,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            ready_capacity: 4096,
            max_resume_per_tick: 64,
            queue_kind: QueueKind::Mpsc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let c = CoroutineConfig::default();
        assert_eq!(c.stack_size, 64 * 1024);
        assert!(c.pool.is_none());

        let p = PoolConfig::default();
        assert_eq!(p.stack_size, 64 * 1024);
        assert_eq!(p.initial_count, 64);
        assert_eq!(p.max_count, 0);
        assert!(p.use_guard_pages);
        assert!(!p.thread_safe);

        let s = SchedulerConfig::default();
        assert_eq!(s.ready_capacity, 4096);
        assert_eq!(s.max_resume_per_tick, 64);
        assert_eq!(s.queue_kind, QueueKind::Mpsc);
    }
}
