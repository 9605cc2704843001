//! Parallel GC workers
//!
//! Phases fan work out over a fixed number of scoped threads. Region-level
//! work is handed out by a shared claim cursor; marking balances itself
//! through work stealing and ends with [`TaskTerminator`].

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

/// A fixed-size gang of GC worker threads.
#[derive(Debug, Clone, Copy)]
pub struct WorkerGang {
    threads: usize,
}

impl WorkerGang {
    /// Create a gang of `threads` workers (at least one)
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }

    /// Number of workers
    #[inline]
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Run `task(worker_id)` on every worker and wait for all of them.
    ///
    /// Worker 0 runs on the calling thread.
    pub fn run<F>(&self, task: F)
    where
        F: Fn(usize) + Sync,
    {
        if self.threads == 1 {
            task(0);
            return;
        }
        std::thread::scope(|s| {
            for id in 1..self.threads {
                let task = &task;
                s.spawn(move || task(id));
            }
            task(0);
        });
    }
}

/// Hands out indices `0..len` to competing workers, each exactly once.
pub struct ClaimCursor {
    next: CachePadded<AtomicUsize>,
    len: usize,
}

impl ClaimCursor {
    /// Cursor over `len` items
    pub fn new(len: usize) -> Self {
        Self {
            next: CachePadded::new(AtomicUsize::new(0)),
            len,
        }
    }

    /// Claim the next unclaimed index.
    #[inline]
    pub fn claim(&self) -> Option<usize> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed);
        (idx < self.len).then_some(idx)
    }
}

/// Termination protocol for work-stealing phases.
///
/// A worker that runs dry calls [`offer_termination`](Self::offer_termination).
/// It returns `true` once every worker has run dry at the same time, and
/// `false` as soon as `has_work` reports new work, in which case the worker
/// goes back to stealing.
pub struct TaskTerminator {
    active: CachePadded<AtomicUsize>,
}

impl TaskTerminator {
    /// Terminator for `workers` participants
    pub fn new(workers: usize) -> Self {
        Self {
            active: CachePadded::new(AtomicUsize::new(workers)),
        }
    }

    /// Offer to terminate.
    pub fn offer_termination(&self, has_work: impl Fn() -> bool) -> bool {
        self.active.fetch_sub(1, Ordering::AcqRel);
        let backoff = Backoff::new();
        loop {
            if self.active.load(Ordering::Acquire) == 0 {
                return true;
            }
            if has_work() {
                // Rejoin unless everyone already left.
                let mut active = self.active.load(Ordering::Acquire);
                loop {
                    if active == 0 {
                        return true;
                    }
                    match self.active.compare_exchange_weak(
                        active,
                        active + 1,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return false,
                        Err(actual) => active = actual,
                    }
                }
            }
            if backoff.is_completed() {
                std::thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
    }
}
