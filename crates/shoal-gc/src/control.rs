//! Control thread
//!
//! Drives the collector in the background: wakes every
//! `control_interval_ms` (or as soon as a cycle is requested), asks the
//! heuristics whether to start a concurrent cycle, runs it, and uncommits
//! regions that have stayed empty for `uncommit_delay_ms`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{GcError, GcResult};
use crate::heap::Heap;

/// Background thread running concurrent cycles for a [`Heap`].
///
/// Stopped and joined on [`shutdown`](Self::shutdown) or drop.
pub struct ControlThread {
    heap: Arc<Heap>,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ControlThread {
    /// Start the control thread.
    pub fn spawn(heap: Arc<Heap>) -> GcResult<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_heap = heap.clone();
        let thread_stop = stop.clone();
        heap.control_threads.fetch_add(1, Ordering::AcqRel);
        let handle = std::thread::Builder::new()
            .name("shoal-control".into())
            .spawn(move || {
                run(&thread_heap, &thread_stop);
                thread_heap.control_threads.fetch_sub(1, Ordering::AcqRel);
            })
            .map_err(|e| {
                heap.control_threads.fetch_sub(1, Ordering::AcqRel);
                GcError::Spawn(e)
            })?;
        tracing::debug!(target: "shoal::gc", "Control thread started");
        Ok(Self {
            heap,
            stop,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stop the thread and wait for it. A running cycle completes first.
    pub fn shutdown(&self) {
        {
            let _request = self.heap.request.lock();
            self.stop.store(true, Ordering::Release);
            self.heap.request_cv.notify_all();
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::warn!(target: "shoal::gc", "Control thread panicked");
            }
            tracing::debug!(target: "shoal::gc", "Control thread stopped");
        }
    }

    /// Whether the thread is still running
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for ControlThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(heap: &Heap, stop: &AtomicBool) {
    let interval = Duration::from_millis(heap.config.control_interval_ms.max(1));
    let uncommit_delay = Duration::from_millis(heap.config.uncommit_delay_ms);
    loop {
        let requested = {
            let mut request = heap.request.lock();
            if request.is_none() && !stop.load(Ordering::Acquire) {
                heap.request_cv.wait_for(&mut request, interval);
            }
            if stop.load(Ordering::Acquire) {
                break;
            }
            request.take()
        };

        if let Some(cause) = requested.or_else(|| heap.should_start_cycle()) {
            if let Err(err) = heap.collect(cause) {
                tracing::warn!(target: "shoal::gc", ?cause, %err, "Background cycle failed");
            }
        }

        let uncommitted = heap.directory.uncommit_idle(uncommit_delay);
        if uncommitted > 0 {
            heap.stats.lock().regions_uncommitted += uncommitted as u64;
            tracing::info!(target: "shoal::gc", regions = uncommitted, "Uncommitted idle regions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::heuristics::{GcCause, HeuristicsKind};
    use std::time::Instant;

    fn heap(heuristics: HeuristicsKind) -> Arc<Heap> {
        Heap::new(HeapConfig {
            region_size: 4096,
            region_count: 16,
            heuristics,
            parallel_gc_threads: Some(1),
            control_interval_ms: 1,
            uncommit_delay_ms: 0,
            ..HeapConfig::default()
        })
        .unwrap()
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_requested_cycle_runs() {
        let heap = heap(HeuristicsKind::Static);
        let control = ControlThread::spawn(heap.clone()).unwrap();
        assert!(control.is_running());
        heap.request_gc(GcCause::Explicit);
        assert!(wait_until(|| heap.gc_count() >= 1));
        control.shutdown();
        assert!(!control.is_running());
    }

    #[test]
    fn test_aggressive_runs_continuously() {
        let heap = heap(HeuristicsKind::Aggressive);
        let _control = ControlThread::spawn(heap.clone()).unwrap();
        assert!(wait_until(|| heap.gc_count() >= 3));
    }

    #[test]
    fn test_idle_regions_are_uncommitted() {
        let heap = heap(HeuristicsKind::Static);
        {
            let m = heap.mutator();
            for _ in 0..8 {
                m.alloc(4000, 0).unwrap();
            }
        }
        let _control = ControlThread::spawn(heap.clone()).unwrap();
        heap.request_gc(GcCause::Explicit);
        assert!(wait_until(|| heap.stats().regions_uncommitted > 0));
    }
}
