//! Coroutine stack memory.
//!
//! Two allocation flavors:
//!
//! - **Mapped** (`StackMemory::map`): an anonymous mapping of
//!   `stack_size + 1 page`, with the lowest page left `PROT_NONE` as a
//!   guard. Overflow hits the guard and faults deterministically.
//! - **Heap** (`StackMemory::heap`): a plain 16-byte-aligned allocation
//!   with no guard, for pools configured without guard pages.
//!
//! A stack is either exclusively owned by its coroutine or borrowed from a
//! [`StackPool`](super::pool::StackPool); [`StackSource`] is that tag.
//! Release is RAII: dropping an owned stack frees the memory, dropping a
//! pooled one returns the slot to its pool without freeing.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::OnceLock;

use corosensei::stack::{Stack, StackPointer};

use crate::error::RtError;

use super::pool::StackPool;

/// Default coroutine stack size: 64 KiB.
///
/// Virtual memory lazy-commits pages, so tens of thousands of coroutines
/// with 64 KiB virtual stacks are feasible on modern systems.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Minimum supported stack size: 4 KiB.
pub const MIN_STACK_SIZE: usize = 4 * 1024;

/// Maximum supported stack size: 8 MiB.
pub const MAX_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Stack alignment required by the switching ABI.
const STACK_ALIGN: usize = 16;

/// Host page size, queried once.
pub(crate) fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

/// Validate a requested stack size against the supported bounds.
pub(crate) fn check_stack_size(size: usize) -> Result<(), RtError> {
    if size < MIN_STACK_SIZE || size > MAX_STACK_SIZE {
        return Err(RtError::InvalidArgument("stack size out of range"));
    }
    Ok(())
}

#[inline]
fn round_up(value: usize, to: usize) -> usize {
    (value + to - 1) & !(to - 1)
}

// ---------------------------------------------------------------------------
// StackMemory
// ---------------------------------------------------------------------------

enum Region {
    /// `mmap`ed region; the lowest page is the guard.
    Mapped { ptr: *mut u8, len: usize },
    /// Plain heap allocation, no guard.
    Heap {
        ptr: *mut u8,
        layout: std::alloc::Layout,
    },
}

/// A raw stack region: the unit the pool manages.
///
/// `base` is the highest address (stacks grow down), `limit` the lowest
/// usable address. Both are 16-byte aligned as the switching ABI requires.
pub(crate) struct StackMemory {
    region: Region,
    base: NonZeroUsize,
    limit: NonZeroUsize,
    stack_size: usize,
}

// The region is plain memory; it carries no thread affinity until a
// coroutine is running on it.
unsafe impl Send for StackMemory {}

impl StackMemory {
    /// Map a guard-page-protected stack of at least `stack_size` bytes.
    ///
    /// The whole region is mapped `PROT_NONE` first, then everything above
    /// the lowest page is flipped to read/write. The guard page stays
    /// no-access for the life of the stack.
    pub(crate) fn map(stack_size: usize) -> Result<Self, RtError> {
        check_stack_size(stack_size)?;
        let page = page_size();
        let size = round_up(stack_size, page);
        let total = size + page;

        // Safety: anonymous private mapping with no fixed address; the
        // result is checked against MAP_FAILED before use.
        unsafe {
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(RtError::AllocationFailed("stack mmap failed"));
            }
            let ptr = ptr as *mut u8;

            if libc::mprotect(
                ptr.add(page) as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                libc::munmap(ptr as *mut libc::c_void, total);
                return Err(RtError::AllocationFailed("stack mprotect failed"));
            }

            let limit = ptr as usize + page;
            let base = ptr as usize + total;
            Ok(StackMemory {
                region: Region::Mapped { ptr, len: total },
                base: NonZeroUsize::new(base).expect("mapped stack base is non-null"),
                limit: NonZeroUsize::new(limit).expect("mapped stack limit is non-null"),
                stack_size: size,
            })
        }
    }

    /// Allocate an unguarded stack on the heap.
    pub(crate) fn heap(stack_size: usize) -> Result<Self, RtError> {
        check_stack_size(stack_size)?;
        let size = round_up(stack_size, STACK_ALIGN);
        let layout = std::alloc::Layout::from_size_align(size, STACK_ALIGN)
            .map_err(|_| RtError::InvalidArgument("stack size out of range"))?;

        // Safety: layout has non-zero size; the result is null-checked.
        let ptr = unsafe { std::alloc::alloc(layout) };
        if ptr.is_null() {
            return Err(RtError::AllocationFailed("stack heap allocation failed"));
        }

        let limit = ptr as usize;
        let base = limit + size;
        Ok(StackMemory {
            region: Region::Heap { ptr, layout },
            base: NonZeroUsize::new(base).expect("heap stack base is non-null"),
            limit: NonZeroUsize::new(limit).expect("heap stack limit is non-null"),
            stack_size: size,
        })
    }

    /// Usable stack bytes (page- or 16-byte-rounded from the request).
    pub(crate) fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Base address of the guard page, if this stack has one.
    pub(crate) fn guard_base(&self) -> Option<usize> {
        match self.region {
            Region::Mapped { ptr, .. } => Some(ptr as usize),
            Region::Heap { .. } => None,
        }
    }
}

impl Drop for StackMemory {
    fn drop(&mut self) {
        match self.region {
            Region::Mapped { ptr, len } => {
                // Safety: `ptr`/`len` are exactly what mmap returned.
                unsafe {
                    libc::munmap(ptr as *mut libc::c_void, len);
                }
            }
            Region::Heap { ptr, layout } => {
                // Safety: allocated with this exact layout above.
                unsafe {
                    std::alloc::dealloc(ptr, layout);
                }
            }
        }
    }
}

impl std::fmt::Debug for StackMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackMemory")
            .field("stack_size", &self.stack_size)
            .field("guarded", &self.guard_base().is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// StackSource
// ---------------------------------------------------------------------------

/// A stack exclusively owned by one coroutine.
pub(crate) struct OwnedStack {
    memory: StackMemory,
}

impl OwnedStack {
    /// Allocate a fresh guard-page-protected stack.
    pub(crate) fn new(stack_size: usize) -> Result<Self, RtError> {
        Ok(OwnedStack {
            memory: StackMemory::map(stack_size)?,
        })
    }
}

/// A stack borrowed from a pool. Dropping it returns the slot to the pool;
/// the memory is not freed.
pub(crate) struct PooledStack {
    memory: Option<StackMemory>,
    pool: Arc<StackPool>,
}

impl PooledStack {
    pub(crate) fn new(memory: StackMemory, pool: Arc<StackPool>) -> Self {
        PooledStack {
            memory: Some(memory),
            pool,
        }
    }

    fn memory(&self) -> &StackMemory {
        self.memory.as_ref().expect("pooled stack slot already returned")
    }
}

impl Drop for PooledStack {
    fn drop(&mut self) {
        if let Some(memory) = self.memory.take() {
            self.pool.release(memory);
        }
    }
}

/// Owned-or-borrowed stack for one coroutine.
pub(crate) enum StackSource {
    Owned(OwnedStack),
    Pooled(PooledStack),
}

impl StackSource {
    fn memory(&self) -> &StackMemory {
        match self {
            StackSource::Owned(s) => &s.memory,
            StackSource::Pooled(s) => s.memory(),
        }
    }

    pub(crate) fn stack_size(&self) -> usize {
        self.memory().stack_size()
    }

    pub(crate) fn is_pooled(&self) -> bool {
        matches!(self, StackSource::Pooled(_))
    }
}

// Safety: `base` is the highest address and `limit` the lowest usable
// address of a region this object exclusively owns (or has exclusively
// borrowed from its pool); both are 16-byte aligned, and the region stays
// valid and immovable until the StackSource is dropped.
unsafe impl Stack for StackSource {
    fn base(&self) -> StackPointer {
        self.memory().base
    }

    fn limit(&self) -> StackPointer {
        self.memory().limit
    }
}

impl std::fmt::Debug for StackSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackSource")
            .field("pooled", &self.is_pooled())
            .field("stack_size", &self.stack_size())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
