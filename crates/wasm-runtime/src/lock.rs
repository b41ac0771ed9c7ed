//! FIFO serialization of calls into the module.
//!
//! The VM is not re-entrant: a second call that starts before the first one
//! returns corrupts its state. Every operation that touches the module holds a
//! [`CallPermit`] for its whole duration. Permits are granted in arrival order
//! and released on drop, so every exit path gives the lock back.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// A fair, async mutual-exclusion queue.
#[derive(Default)]
pub struct CallSerializer {
    queue: Arc<Mutex<()>>,
    tickets: AtomicU64,
    waiting: AtomicUsize,
}

impl CallSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access. `op` names the operation for tracing.
    ///
    /// The permit owns its place in the queue, so it can be moved onto the
    /// thread that runs the call. A caller dropped while still queued gives up
    /// its place without being counted as waiting.
    pub async fn acquire(&self, op: &'static str) -> CallPermit {
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let queued = Queued::enter(&self.waiting);
        trace!(ticket, op, "Waiting for call lock");

        let guard = self.queue.clone().lock_owned().await;

        drop(queued);
        trace!(ticket, op, "Call lock acquired");
        CallPermit {
            _guard: guard,
            ticket,
            op,
            acquired_at: Instant::now(),
        }
    }

    /// Whether a permit is currently held.
    pub fn is_locked(&self) -> bool {
        self.queue.try_lock().is_err()
    }

    /// Number of callers queued behind the current holder.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Relaxed)
    }
}

struct Queued<'a>(&'a AtomicUsize);

impl<'a> Queued<'a> {
    fn enter(waiting: &'a AtomicUsize) -> Self {
        waiting.fetch_add(1, Ordering::Relaxed);
        Queued(waiting)
    }
}

impl Drop for Queued<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Exclusive access to the module, released on drop.
pub struct CallPermit {
    _guard: OwnedMutexGuard<()>,
    ticket: u64,
    op: &'static str,
    acquired_at: Instant,
}

impl CallPermit {
    /// Arrival order of the caller holding this permit.
    pub fn ticket(&self) -> u64 {
        self.ticket
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        trace!(
            ticket = self.ticket,
            op = self.op,
            held_us = self.acquired_at.elapsed().as_micros() as u64,
            "Call lock released"
        );
    }
}
