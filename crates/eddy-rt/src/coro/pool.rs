//! Stack pool: pre-allocate, guard-page-protect, and recycle coroutine
//! stacks.
//!
//! Stack allocation dominates coroutine creation cost at high concurrency,
//! so the pool keeps released stacks on a free list instead of unmapping
//! them. A slot is either on the free list or held by exactly one
//! coroutine, never both and never neither; conservation is observable via
//! [`StackPool::stats`] as `created == in_use_now + free_now`.
//!
//! The pool is internally mutex-guarded and hands out slots that return
//! themselves on drop, so it is shared behind an `Arc`.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::RtError;

use super::config::PoolConfig;
use super::stack::{check_stack_size, PooledStack, StackMemory};

// ---------------------------------------------------------------------------
// PoolStats
// ---------------------------------------------------------------------------

/// A snapshot of pool counters, taken under the pool lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Slots currently owned by the pool (live allocations).
    pub created: u64,
    /// Total acquires since creation.
    pub acquired: u64,
    /// Total releases since creation.
    pub released: u64,
    /// Slots on the free list right now.
    pub free_now: usize,
    /// Slots held by coroutines right now.
    pub in_use_now: usize,
    /// High-water mark of `in_use_now`.
    pub peak_in_use: usize,
    /// Configured per-slot stack size in bytes.
    pub stack_size: usize,
}

// ---------------------------------------------------------------------------
// StackPool
// ---------------------------------------------------------------------------

struct PoolInner {
    /// Released slots. Acquire pops the front, release pushes the front,
    /// shrink frees from the back (coldest slots first).
    free: VecDeque<StackMemory>,
    created: u64,
    acquired: u64,
    released: u64,
    in_use: usize,
    peak_in_use: usize,
}

/// A pool of reusable coroutine stacks.
pub struct StackPool {
    stack_size: usize,
    max_count: usize,
    use_guard_pages: bool,
    thread_safe: bool,
    inner: Mutex<PoolInner>,
}

impl StackPool {
    /// Create a pool and pre-allocate `initial_count` slots.
    pub fn new(config: PoolConfig) -> Result<Arc<Self>, RtError> {
        check_stack_size(config.stack_size)?;
        if config.max_count != 0 && config.initial_count > config.max_count {
            return Err(RtError::InvalidArgument(
                "pool initial_count exceeds max_count",
            ));
        }

        let pool = Arc::new(StackPool {
            stack_size: config.stack_size,
            max_count: config.max_count,
            use_guard_pages: config.use_guard_pages,
            thread_safe: config.thread_safe,
            inner: Mutex::new(PoolInner {
                free: VecDeque::new(),
                created: 0,
                acquired: 0,
                released: 0,
                in_use: 0,
                peak_in_use: 0,
            }),
        });
        pool.warmup(config.initial_count)?;
        Ok(pool)
    }

    /// Allocate one slot's worth of stack memory per the pool flavor.
    fn allocate(&self) -> Result<StackMemory, RtError> {
        if self.use_guard_pages {
            StackMemory::map(self.stack_size)
        } else {
            StackMemory::heap(self.stack_size)
        }
    }

    /// Take a slot: pop the free list, or allocate a new slot while under
    /// `max_count`. Fails with `PoolExhausted` when the pool is capped and
    /// every slot is in use.
    pub(crate) fn acquire(self: &Arc<Self>) -> Result<PooledStack, RtError> {
        let mut inner = self.inner.lock();
        let memory = match inner.free.pop_front() {
            Some(memory) => memory,
            None => {
                if self.max_count != 0 && inner.created as usize >= self.max_count {
                    return Err(RtError::PoolExhausted);
                }
                let memory = self.allocate()?;
                inner.created += 1;
                memory
            }
        };
        inner.acquired += 1;
        inner.in_use += 1;
        inner.peak_in_use = inner.peak_in_use.max(inner.in_use);
        let in_use = inner.in_use;
        drop(inner);

        log::trace!(
            "stack pool acquire: stack_size={} in_use={}",
            self.stack_size,
            in_use
        );
        Ok(PooledStack::new(memory, Arc::clone(self)))
    }

    /// Return a slot to the free list. The memory is kept mapped for reuse.
    ///
    /// Called from `PooledStack::drop`; not part of the public surface.
    pub(crate) fn release(&self, memory: StackMemory) {
        let mut inner = self.inner.lock();
        inner.released += 1;
        inner.in_use = inner.in_use.saturating_sub(1);
        inner.free.push_front(memory);
    }

    /// Pre-allocate `n` slots onto the free list.
    pub fn warmup(&self, n: usize) -> Result<(), RtError> {
        for _ in 0..n {
            let mut inner = self.inner.lock();
            if self.max_count != 0 && inner.created as usize >= self.max_count {
                return Err(RtError::PoolExhausted);
            }
            let memory = self.allocate()?;
            inner.created += 1;
            inner.free.push_back(memory);
        }
        Ok(())
    }

    /// Free slots from the back of the free list until at most `keep_n`
    /// remain there. In-use slots are unaffected.
    pub fn shrink(&self, keep_n: usize) {
        let mut freed = 0u64;
        loop {
            let memory = {
                let mut inner = self.inner.lock();
                if inner.free.len() <= keep_n {
                    break;
                }
                inner.created -= 1;
                inner.free.pop_back()
            };
            drop(memory);
            freed += 1;
        }
        if freed > 0 {
            log::debug!("stack pool shrink: freed {} slots", freed);
        }
    }

    /// Snapshot the pool counters.
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            created: inner.created,
            acquired: inner.acquired,
            released: inner.released,
            free_now: inner.free.len(),
            in_use_now: inner.in_use,
            peak_in_use: inner.peak_in_use,
            stack_size: self.stack_size,
        }
    }

    /// Configured per-slot stack size.
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Whether slots carry a guard page.
    pub fn use_guard_pages(&self) -> bool {
        self.use_guard_pages
    }

    /// Whether the pool was declared shared across threads.
    pub fn thread_safe(&self) -> bool {
        self.thread_safe
    }
}

impl Drop for StackPool {
    fn drop(&mut self) {
        let inner = self.inner.lock();
        if inner.in_use > 0 {
            // Slots still held by coroutines at teardown are a leak: their
            // memory is freed with the holder, not returned here.
            log::warn!("stack pool dropped with {} slots still in use", inner.in_use);
        }
    }
}

impl std::fmt::Debug for StackPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("StackPool")
            .field("stack_size", &self.stack_size)
            .field("max_count", &self.max_count)
            .field("use_guard_pages", &self.use_guard_pages)
            .field("free_now", &stats.free_now)
            .field("in_use_now", &stats.in_use_now)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
