//! Safepoint protocol
//!
//! Mutators hold a shared guard for the duration of every heap operation.
//! A pause takes the exclusive guard, so it begins only once every mutator
//! is between operations and no mutator starts a new one until it ends.
//!
//! The lock is task-fair: a mutator must never acquire the shared guard
//! twice on one thread, or it can deadlock against a waiting pause.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Pause bookkeeping
#[derive(Debug, Clone, Copy, Default)]
pub struct PauseStats {
    /// Number of pauses taken
    pub count: u64,
    /// Sum of all pause durations
    pub total: Duration,
    /// Longest pause
    pub max: Duration,
    /// Most recent pause
    pub last: Duration,
}

/// Mutator/GC rendezvous.
#[derive(Default)]
pub struct Safepoint {
    lock: RwLock<()>,
    count: AtomicU64,
    total_nanos: AtomicU64,
    max_nanos: AtomicU64,
    last_nanos: AtomicU64,
}

impl Safepoint {
    /// Create a new safepoint
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a mutator operation. Blocks while a pause is in progress.
    #[inline]
    pub(crate) fn enter(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read()
    }

    /// Stop all mutators until the returned guard is dropped.
    pub(crate) fn pause(&self, name: &'static str) -> PauseGuard<'_> {
        let requested = Instant::now();
        let guard = self.lock.write();
        tracing::trace!(
            target: "shoal::gc",
            pause = name,
            wait_us = requested.elapsed().as_micros() as u64,
            "Safepoint reached"
        );
        PauseGuard {
            safepoint: self,
            name,
            start: Instant::now(),
            _guard: guard,
        }
    }

    /// Whether a pause is in progress.
    pub fn is_paused(&self) -> bool {
        self.lock.is_locked_exclusive()
    }

    /// Pause statistics so far
    pub fn stats(&self) -> PauseStats {
        PauseStats {
            count: self.count.load(Ordering::Relaxed),
            total: Duration::from_nanos(self.total_nanos.load(Ordering::Relaxed)),
            max: Duration::from_nanos(self.max_nanos.load(Ordering::Relaxed)),
            last: Duration::from_nanos(self.last_nanos.load(Ordering::Relaxed)),
        }
    }

    fn record(&self, elapsed: Duration) {
        let nanos = elapsed.as_nanos() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.max_nanos.fetch_max(nanos, Ordering::Relaxed);
        self.last_nanos.store(nanos, Ordering::Relaxed);
    }
}

/// An in-progress pause. Mutators resume when it is dropped.
pub(crate) struct PauseGuard<'a> {
    safepoint: &'a Safepoint,
    name: &'static str,
    start: Instant,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        self.safepoint.record(elapsed);
        tracing::debug!(
            target: "shoal::gc",
            pause = self.name,
            pause_us = elapsed.as_micros() as u64,
            "Pause complete"
        );
    }
}
