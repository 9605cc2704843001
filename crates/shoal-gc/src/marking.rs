//! Concurrent marking
//!
//! Marking traces the object graph from the roots and records every reached
//! object in its region's mark bitmap, accounting live bytes per region.
//!
//! ## Work distribution
//!
//! - Roots and barrier reports go into a global [`Injector`].
//! - Each worker has a LIFO [`Worker`] deque; idle workers steal from the
//!   injector first, then from each other.
//! - A worker whose deque holds `mark_queue_capacity` entries does not push
//!   more. It records the object's region in a shared overflow set instead;
//!   once the workers terminate, every marked object of an overflowed region
//!   is scanned again. Nothing is ever dropped.
//!
//! Objects at or above their region's TAMS were allocated after marking
//! began. They are implicitly live and are neither marked nor scanned.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use parking_lot::Mutex;

use crate::config::MarkingMode;
use crate::heap::Heap;
use crate::object::{HeapObject, ObjRef, ObjectKind};
use crate::reference::RefKind;
use crate::region::RegionId;
use crate::workers::TaskTerminator;

/// A unit of marking work.
#[derive(Debug, Clone, Copy)]
pub(crate) enum MarkTask {
    /// Reference reported by roots or barriers; may already be marked
    Candidate(ObjRef),
    /// Marked object whose fields still need scanning
    Scan(ObjRef),
}

/// Shared marking state for one cycle.
pub(crate) struct MarkingContext {
    injector: Injector<MarkTask>,
    overflow: Mutex<BTreeSet<RegionId>>,
    capacity: usize,
    clear_soft: AtomicBool,
    overflow_events: AtomicU64,
}

impl MarkingContext {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            injector: Injector::new(),
            overflow: Mutex::new(BTreeSet::new()),
            capacity: capacity.max(1),
            clear_soft: AtomicBool::new(false),
            overflow_events: AtomicU64::new(0),
        }
    }

    /// Drop any leftover work and set the soft reference policy for the
    /// coming cycle.
    pub(crate) fn reset(&self, clear_soft: bool) {
        while !self.injector.steal().is_empty() {}
        self.overflow.lock().clear();
        self.clear_soft.store(clear_soft, Ordering::Release);
    }

    #[inline]
    pub(crate) fn push(&self, r: ObjRef) {
        self.injector.push(MarkTask::Candidate(r));
    }

    pub(crate) fn push_all(&self, refs: impl IntoIterator<Item = ObjRef>) {
        for r in refs {
            self.push(r);
        }
    }

    pub(crate) fn clears_soft(&self) -> bool {
        self.clear_soft.load(Ordering::Acquire)
    }

    fn has_pending(&self) -> bool {
        !self.injector.is_empty() || !self.overflow.lock().is_empty()
    }

    fn record_overflow(&self, region: RegionId) {
        self.overflow_events.fetch_add(1, Ordering::Relaxed);
        self.overflow.lock().insert(region);
    }

    /// Number of pushes that fell back to the overflow set
    pub(crate) fn overflow_events(&self) -> u64 {
        self.overflow_events.load(Ordering::Relaxed)
    }
}

impl Heap {
    /// Push every root into the marking queue.
    pub(crate) fn mark_roots(&self) {
        let mut roots = 0usize;
        self.visit_roots(&mut |slot| {
            let value = slot.load();
            if !value.is_null() {
                self.marking.push(value);
                roots += 1;
            }
        });
        tracing::trace!(target: "shoal::gc", roots, "Roots scanned");
    }

    /// Mark `r` if it is below TAMS and unmarked. Returns the object when
    /// this call marked it and it still needs scanning.
    fn try_mark(&self, r: ObjRef) -> Option<Arc<HeapObject>> {
        let region = self.directory.region(r.region())?;
        let obj = region.object(r.offset())?;
        region.mark(r.offset(), obj.size()).then_some(obj)
    }

    /// Scan the fields of a marked object, handing every newly marked child
    /// to `push`.
    fn scan_object(&self, r: ObjRef, obj: &HeapObject, push: &mut impl FnMut(ObjRef)) {
        match obj.kind() {
            ObjectKind::Plain => obj.for_each_field(|_, child| {
                if self.try_mark(child).is_some() {
                    push(child);
                }
            }),
            ObjectKind::Reference { kind, .. } => {
                self.references.discover(r);
                if kind == RefKind::Soft && !self.marking.clears_soft() {
                    obj.for_each_field(|_, referent| {
                        if self.try_mark(referent).is_some() {
                            push(referent);
                        }
                    });
                }
            }
        }
    }

    fn process_task(&self, task: MarkTask, push: &mut impl FnMut(ObjRef)) {
        match task {
            MarkTask::Candidate(r) => {
                if let Some(obj) = self.try_mark(r) {
                    self.scan_object(r, &obj, push);
                }
            }
            MarkTask::Scan(r) => {
                if let Some(obj) = self.directory.object(r) {
                    self.scan_object(r, &obj, push);
                }
            }
        }
    }

    /// Run the marking workers until no grey object is left.
    ///
    /// Returns false if the cycle was cancelled first; any unfinished work
    /// is left in the global queue for the degenerated cycle.
    pub(crate) fn mark_to_completion(&self) -> bool {
        loop {
            let threads = self.workers.threads();
            let locals: Vec<Mutex<Option<Worker<MarkTask>>>> = (0..threads)
                .map(|_| Mutex::new(Some(Worker::new_lifo())))
                .collect();
            let stealers: Vec<Stealer<MarkTask>> = locals
                .iter()
                .filter_map(|w| w.lock().as_ref().map(Worker::stealer))
                .collect();
            let terminator = TaskTerminator::new(threads);

            self.workers.run(|id| {
                if let Some(local) = locals[id].lock().take() {
                    self.mark_worker(&local, &stealers, &terminator);
                }
            });

            if self.is_cancelled() {
                return false;
            }
            let overflowed = std::mem::take(&mut *self.marking.overflow.lock());
            if overflowed.is_empty() && self.marking.injector.is_empty() {
                return true;
            }
            for region in overflowed {
                self.rescan_overflowed(region);
            }
        }
    }

    fn mark_worker(
        &self,
        local: &Worker<MarkTask>,
        stealers: &[Stealer<MarkTask>],
        terminator: &TaskTerminator,
    ) {
        let capacity = self.marking.capacity;
        let mut push = |child: ObjRef| {
            if local.len() >= capacity {
                self.marking.record_overflow(child.region());
            } else {
                local.push(MarkTask::Scan(child));
            }
        };

        loop {
            if self.is_cancelled() {
                while let Some(task) = local.pop() {
                    self.marking.injector.push(task);
                }
                terminator.offer_termination(|| false);
                return;
            }
            match self.pop_mark_task(local, stealers) {
                Some(task) => self.process_task(task, &mut push),
                None => {
                    let has_work = || {
                        !self.is_cancelled()
                            && (!self.marking.injector.is_empty()
                                || stealers.iter().any(|s| !s.is_empty()))
                    };
                    if terminator.offer_termination(has_work) {
                        return;
                    }
                }
            }
        }
    }

    fn pop_mark_task(
        &self,
        local: &Worker<MarkTask>,
        stealers: &[Stealer<MarkTask>],
    ) -> Option<MarkTask> {
        if let Some(task) = local.pop() {
            return Some(task);
        }

        loop {
            match self.marking.injector.steal_batch_and_pop(local) {
                Steal::Retry => {}
                Steal::Empty => break,
                Steal::Success(task) => return Some(task),
            }
        }

        for stealer in stealers {
            loop {
                match stealer.steal_batch_and_pop(local) {
                    Steal::Retry => {}
                    Steal::Empty => break,
                    Steal::Success(task) => return Some(task),
                }
            }
        }

        None
    }

    /// Fallback pass for an overflowed region: scan every marked object in
    /// it again, pushing newly marked children to the global queue.
    fn rescan_overflowed(&self, id: RegionId) {
        let Some(region) = self.directory.region(id) else {
            return;
        };
        tracing::trace!(target: "shoal::gc", region = id.0, "Rescanning overflowed region");
        for (offset, obj) in region.objects() {
            if region.is_marked(offset) {
                let r = ObjRef::new(id, offset);
                self.scan_object(r, &obj, &mut |child| {
                    self.marking.injector.push(MarkTask::Scan(child))
                });
            }
        }
    }

    /// Final-mark termination: drain every mutator barrier buffer (and
    /// rescan roots in incremental-update mode) until no new grey work
    /// appears.
    pub(crate) fn finish_marking(&self) -> bool {
        loop {
            let mut reported = 0;
            for mutator in self.mutators.lock().values() {
                let entries = mutator.barrier.drain();
                reported += entries.len();
                self.marking.push_all(entries);
            }
            if self.config.mode == MarkingMode::IncrementalUpdate {
                self.mark_roots();
            }
            if !self.mark_to_completion() {
                return false;
            }
            if reported == 0 && !self.marking.has_pending() {
                return true;
            }
        }
    }
}
