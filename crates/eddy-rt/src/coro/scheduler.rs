//! FIFO scheduler: stages ready coroutines for batched resume inside a
//! reactor tick.
//!
//! Producers enqueue coroutine ids (promise completions, spawns); the
//! reactor thread drains up to `max_resume_per_tick` per tick, in enqueue
//! order. The budget is what keeps tick latency bounded: a coroutine
//! resumed during a tick may schedule further coroutines, and those land
//! at the tail for a later tick instead of extending the current one.
//!
//! Two queue flavors:
//!
//! - `Spsc`: a plain locked FIFO for reactors whose producers all live on
//!   the reactor thread.
//! - `Mpsc` (default): a bounded crossbeam channel so that completion
//!   callbacks running on other threads (a database driver's worker, a
//!   resolver thread) can wake coroutines owned by the reactor thread.
//!
//! Enqueue never blocks; a full queue is reported as `SchedulerFull`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;

use crate::error::RtError;

use super::config::{QueueKind, SchedulerConfig};
use super::coroutine::{CoroId, Coroutine};

// ---------------------------------------------------------------------------
// SchedulerStats
// ---------------------------------------------------------------------------

/// A snapshot of scheduler counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Entries in the ready queue right now.
    pub current_ready: usize,
    /// High-water mark of `current_ready`.
    pub peak_ready: usize,
    /// Total successful enqueues.
    pub total_scheduled: u64,
    /// Total successful resumes across all ticks.
    pub total_resumed: u64,
    /// Entries dequeued whose resume failed or whose coroutine was gone.
    pub total_dropped: u64,
}

// ---------------------------------------------------------------------------
// Ready queue
// ---------------------------------------------------------------------------

enum ReadyQueue {
    Spsc(Mutex<VecDeque<CoroId>>),
    Mpsc {
        tx: Sender<CoroId>,
        rx: Receiver<CoroId>,
    },
}

/// The producer-facing half of the scheduler: the ready queue plus its
/// counters. Promises hold an `Arc` of this so `complete` can wake the
/// waiter from any thread.
pub(crate) struct SchedulerShared {
    queue: ReadyQueue,
    capacity: usize,
    current_ready: AtomicUsize,
    peak_ready: AtomicUsize,
    total_scheduled: AtomicU64,
    total_resumed: AtomicU64,
    total_dropped: AtomicU64,
}

impl SchedulerShared {
    fn new(config: &SchedulerConfig) -> Self {
        let queue = match config.queue_kind {
            QueueKind::Spsc => {
                ReadyQueue::Spsc(Mutex::new(VecDeque::with_capacity(config.ready_capacity)))
            }
            QueueKind::Mpsc => {
                let (tx, rx) = crossbeam_channel::bounded(config.ready_capacity);
                ReadyQueue::Mpsc { tx, rx }
            }
        };
        SchedulerShared {
            queue,
            capacity: config.ready_capacity,
            current_ready: AtomicUsize::new(0),
            peak_ready: AtomicUsize::new(0),
            total_scheduled: AtomicU64::new(0),
            total_resumed: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a coroutine id. Never blocks; fails when the queue is full.
    pub(crate) fn schedule_id(&self, id: CoroId) -> Result<(), RtError> {
        match &self.queue {
            ReadyQueue::Spsc(q) => {
                let mut q = q.lock();
                if q.len() >= self.capacity {
                    return Err(RtError::SchedulerFull);
                }
                q.push_back(id);
            }
            ReadyQueue::Mpsc { tx, .. } => match tx.try_send(id) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    return Err(RtError::SchedulerFull);
                }
            },
        }
        let ready = self.current_ready.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_ready.fetch_max(ready, Ordering::SeqCst);
        self.total_scheduled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn pop(&self) -> Option<CoroId> {
        let id = match &self.queue {
            ReadyQueue::Spsc(q) => q.lock().pop_front(),
            ReadyQueue::Mpsc { rx, .. } => match rx.try_recv() {
                Ok(id) => Some(id),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
            },
        };
        if id.is_some() {
            self.current_ready.fetch_sub(1, Ordering::SeqCst);
        }
        id
    }

    fn ready_count(&self) -> usize {
        self.current_ready.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// The per-reactor FIFO scheduler.
///
/// Enqueue is shared and thread-safe (see [`SchedulerShared`]); `tick` is
/// called only from the reactor thread, which is also the only place
/// coroutines are resumed.
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    max_resume_per_tick: usize,
}

impl Scheduler {
    /// Create a scheduler from its configuration.
    pub fn new(config: &SchedulerConfig) -> Self {
        Scheduler {
            shared: Arc::new(SchedulerShared::new(config)),
            max_resume_per_tick: config.max_resume_per_tick.max(1),
        }
    }

    /// Handle for producers (promises) to enqueue wakeups from any thread.
    pub(crate) fn shared(&self) -> Arc<SchedulerShared> {
        Arc::clone(&self.shared)
    }

    /// Enqueue a coroutine for resumption on the next tick.
    ///
    /// Fails with `SchedulerFull` when the ready queue is at capacity. A
    /// coroutine must not be enqueued twice before it runs; the await
    /// protocol guarantees that for promise wakeups, direct callers are
    /// responsible for it themselves.
    pub fn schedule(&self, coroutine: &Coroutine) -> Result<(), RtError> {
        self.shared.schedule_id(coroutine.id())
    }

    /// Drain the ready queue, resuming up to `max_resume_per_tick`
    /// coroutines in enqueue order. Returns the number resumed.
    ///
    /// Only entries staged before the tick began are considered: a
    /// coroutine scheduled by code running inside this tick lands at the
    /// tail and is observed in a later tick. `lookup` maps an id back to a
    /// live coroutine; ids whose coroutine is gone, and coroutines whose
    /// resume fails (already completed), are dropped without consuming
    /// budget.
    pub fn tick<F>(&self, mut lookup: F) -> usize
    where
        F: FnMut(CoroId) -> Option<Coroutine>,
    {
        let mut staged = self.shared.ready_count();
        let mut resumed = 0usize;
        while resumed < self.max_resume_per_tick && staged > 0 {
            let Some(id) = self.shared.pop() else { break };
            staged -= 1;
            match lookup(id) {
                Some(co) => match co.resume() {
                    Ok(()) => {
                        resumed += 1;
                        self.shared.total_resumed.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(err) => {
                        log::debug!("dropping unresumable coroutine {:?}: {}", id, err);
                        self.shared.total_dropped.fetch_add(1, Ordering::SeqCst);
                    }
                },
                None => {
                    log::debug!("dropping scheduled id {:?}: coroutine gone", id);
                    self.shared.total_dropped.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        resumed
    }

    /// Entries currently staged in the ready queue.
    pub fn ready_count(&self) -> usize {
        self.shared.ready_count()
    }

    /// True when nothing is staged.
    pub fn empty(&self) -> bool {
        self.ready_count() == 0
    }

    /// Configured per-tick resume budget.
    pub fn max_resume_per_tick(&self) -> usize {
        self.max_resume_per_tick
    }

    /// Snapshot the scheduler counters.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            current_ready: self.shared.current_ready.load(Ordering::SeqCst),
            peak_ready: self.shared.peak_ready.load(Ordering::SeqCst),
            total_scheduled: self.shared.total_scheduled.load(Ordering::SeqCst),
            total_resumed: self.shared.total_resumed.load(Ordering::SeqCst),
            total_dropped: self.shared.total_dropped.load(Ordering::SeqCst),
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("ready", &self.ready_count())
            .field("budget", &self.max_resume_per_tick)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
