//! Minimal event-loop collaborator.
//!
//! The coroutine core does not implement a reactor; it consumes a small
//! surface from one: a memory arena, a "post work to the next iteration"
//! primitive, lifetime ref-counting, and handle accounting. This module
//! provides exactly that surface plus the per-iteration scheduler hook, so
//! the core (and its adapters) can be driven and tested without a real
//! I/O event loop behind it.
//!
//! A `Reactor` is a cheap cloneable handle; all clones refer to the same
//! loop state. It is single-threaded (`!Send`): coroutines execute only on
//! the thread that created the reactor. Cross-thread producers interact
//! through `Promise` clones and the scheduler's MPSC queue, never through
//! the reactor handle itself.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::arena::Arena;
use crate::coro::config::{CoroutineConfig, SchedulerConfig};
use crate::coro::coroutine::{CoroId, Coroutine};
use crate::coro::scheduler::Scheduler;
use crate::error::RtError;

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// What a registered handle represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// A live coroutine.
    Coroutine,
    /// An adapter-owned registration (in-flight operation, timer, ...).
    Adapter,
}

/// Identifier of a registered reactor handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

// ---------------------------------------------------------------------------
// Reactor
// ---------------------------------------------------------------------------

type WorkFn = Box<dyn FnOnce()>;

struct ReactorInner {
    arena: Arc<Arena>,
    scheduler: Scheduler,
    /// Live coroutines by id: the lookup table the scheduler tick resumes
    /// through. Entries are removed at completion or destroy.
    registry: RefCell<FxHashMap<CoroId, Coroutine>>,
    /// Handle id assigned to each registered coroutine.
    coro_handles: RefCell<FxHashMap<CoroId, HandleId>>,
    /// Callbacks to run at the start of the next iteration.
    work: RefCell<VecDeque<WorkFn>>,
    /// Registered handles by id.
    handles: RefCell<FxHashMap<HandleId, HandleKind>>,
    next_handle: Cell<u64>,
    /// External references pinning the loop alive (e.g. awaits in flight).
    refs: Cell<usize>,
}

/// Handle to a single-threaded reactor loop.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<ReactorInner>,
}

impl Reactor {
    /// Create a reactor with default scheduler configuration.
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Create a reactor with an explicit scheduler configuration.
    pub fn with_config(config: SchedulerConfig) -> Self {
        Reactor {
            inner: Rc::new(ReactorInner {
                arena: Arc::new(Arena::new()),
                scheduler: Scheduler::new(&config),
                registry: RefCell::new(FxHashMap::default()),
                coro_handles: RefCell::new(FxHashMap::default()),
                work: RefCell::new(VecDeque::new()),
                handles: RefCell::new(FxHashMap::default()),
                next_handle: Cell::new(1),
                refs: Cell::new(0),
            }),
        }
    }

    /// The arena adapters deep-copy producer buffers into. Shared so that
    /// completion callbacks on other threads can allocate from it.
    pub fn arena(&self) -> Arc<Arena> {
        Arc::clone(&self.inner.arena)
    }

    /// Schedule a callback to run at the start of the next iteration.
    ///
    /// Work queued from inside queued work runs on the iteration after
    /// that, never in the current drain.
    pub fn queue_work<F>(&self, f: F)
    where
        F: FnOnce() + 'static,
    {
        self.inner.work.borrow_mut().push_back(Box::new(f));
    }

    /// Pin the reactor alive (an asynchronous boundary is in flight).
    pub fn retain(&self) {
        self.inner.refs.set(self.inner.refs.get() + 1);
    }

    /// Drop one pin.
    pub fn release(&self) {
        let refs = self.inner.refs.get();
        debug_assert!(refs > 0, "reactor release without matching retain");
        self.inner.refs.set(refs.saturating_sub(1));
    }

    /// Current pin count.
    pub fn refcount(&self) -> usize {
        self.inner.refs.get()
    }

    /// Register a handle so the loop accounts for it.
    pub fn register_handle(&self, kind: HandleKind) -> HandleId {
        let id = HandleId(self.inner.next_handle.get());
        self.inner.next_handle.set(id.0 + 1);
        self.inner.handles.borrow_mut().insert(id, kind);
        id
    }

    /// Close a registered handle.
    pub fn close_handle(&self, id: HandleId) {
        self.inner.handles.borrow_mut().remove(&id);
    }

    /// Number of open handles, optionally filtered by kind.
    pub fn handle_count(&self, kind: Option<HandleKind>) -> usize {
        let handles = self.inner.handles.borrow();
        match kind {
            Some(kind) => handles.values().filter(|k| **k == kind).count(),
            None => handles.len(),
        }
    }

    /// The reactor's scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// The per-iteration scheduler hook: resume ready coroutines up to the
    /// configured budget, in FIFO order. Returns the number resumed.
    pub fn scheduler_tick(&self) -> usize {
        self.inner.scheduler.tick(|id| self.lookup(id))
    }

    /// One loop iteration: drain the queued work, then tick the scheduler.
    /// Returns the number of coroutines resumed.
    pub fn run_once(&self) -> usize {
        let work: Vec<WorkFn> = {
            let mut queue = self.inner.work.borrow_mut();
            queue.drain(..).collect()
        };
        for f in work {
            f();
        }
        self.scheduler_tick()
    }

    /// Run iterations until there is no queued work, nothing ready, and no
    /// outstanding pins. Backs off briefly while pinned but idle (an
    /// external producer has not completed yet).
    pub fn run(&self) {
        let mut spin: u32 = 0;
        loop {
            let resumed = self.run_once();
            let idle = resumed == 0
                && self.inner.work.borrow().is_empty()
                && self.inner.scheduler.empty();
            if idle {
                if self.refcount() == 0 {
                    break;
                }
                spin += 1;
                if spin > 100 {
                    std::thread::sleep(std::time::Duration::from_micros(100));
                } else {
                    std::hint::spin_loop();
                }
            } else {
                spin = 0;
            }
        }
    }

    /// Create a coroutine with default config and stage it for the next
    /// tick.
    pub fn spawn<F>(&self, entry: F) -> Result<Coroutine, RtError>
    where
        F: FnOnce() + 'static,
    {
        self.spawn_with(&CoroutineConfig::default(), entry)
    }

    /// Create a coroutine with explicit config and stage it for the next
    /// tick.
    pub fn spawn_with<F>(&self, config: &CoroutineConfig, entry: F) -> Result<Coroutine, RtError>
    where
        F: FnOnce() + 'static,
    {
        let co = Coroutine::new(self, config, entry)?;
        co.schedule()?;
        Ok(co)
    }

    /// Number of live (registered) coroutines.
    pub fn coroutine_count(&self) -> usize {
        self.inner.registry.borrow().len()
    }

    pub(crate) fn register_coroutine(&self, co: &Coroutine) {
        let handle = self.register_handle(HandleKind::Coroutine);
        self.inner.coro_handles.borrow_mut().insert(co.id(), handle);
        self.inner.registry.borrow_mut().insert(co.id(), co.clone());
    }

    pub(crate) fn unregister_coroutine(&self, id: CoroId) {
        self.inner.registry.borrow_mut().remove(&id);
        if let Some(handle) = self.inner.coro_handles.borrow_mut().remove(&id) {
            self.close_handle(handle);
        }
    }

    pub(crate) fn lookup(&self, id: CoroId) -> Option<Coroutine> {
        self.inner.registry.borrow().get(&id).cloned()
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("coroutines", &self.coroutine_count())
            .field("ready", &self.inner.scheduler.ready_count())
            .field("queued_work", &self.inner.work.borrow().len())
            .field("refs", &self.refcount())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
