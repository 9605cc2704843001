//! Evacuation and reference updating
//!
//! Live objects in collection-set regions are copied into collector regions.
//! A copy becomes the object's only valid location when a CAS installs it in
//! the original's forwarding slot. Every thread that races to evacuate the
//! same object makes its own copy; the CAS winner's copy stays and the
//! losers retract theirs, so exactly one copy is ever accounted.
//!
//! When no collector space is left, the object is forwarded to itself and
//! the cycle is cancelled. The degenerated cycle finishes the job with
//! mutators stopped, then returns the region to service with its
//! self-forwarded objects in place.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::collector::CancelCause;
use crate::error::GcResult;
use crate::heap::Heap;
use crate::object::{HeapObject, ObjRef};
use crate::region::{RegionId, RegionState};
use crate::workers::ClaimCursor;

/// Per-cycle evacuation counters.
#[derive(Default)]
pub(crate) struct EvacuationCounters {
    bytes_copied: AtomicUsize,
    objects_copied: AtomicU64,
    lost_races: AtomicU64,
    failures: AtomicU64,
}

impl EvacuationCounters {
    pub(crate) fn reset(&self) {
        self.bytes_copied.store(0, Ordering::Relaxed);
        self.objects_copied.store(0, Ordering::Relaxed);
        self.lost_races.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
    }

    pub(crate) fn bytes_copied(&self) -> usize {
        self.bytes_copied.load(Ordering::Relaxed)
    }

    pub(crate) fn objects_copied(&self) -> u64 {
        self.objects_copied.load(Ordering::Relaxed)
    }

    pub(crate) fn lost_races(&self) -> u64 {
        self.lost_races.load(Ordering::Relaxed)
    }

    pub(crate) fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl Heap {
    /// Evacuate one cset object, returning its to-space address.
    ///
    /// Safe to call from any number of threads at once for the same object.
    pub(crate) fn evacuate_object(&self, r: ObjRef, obj: &HeapObject) -> ObjRef {
        if let Some(fwd) = obj.forwardee() {
            return fwd;
        }
        if self.faults.should_fail_evac() {
            return self.evacuation_failed(r, obj);
        }
        let Ok((to, offset)) = self.directory.collector_allocate(obj.size()) else {
            return self.evacuation_failed(r, obj);
        };
        let Some(to_region) = self.directory.region(to) else {
            return self.evacuation_failed(r, obj);
        };
        let copy = to_region.install(offset, obj.copy_of());
        match obj.try_forward(copy) {
            Ok(()) => {
                self.evac.bytes_copied.fetch_add(obj.size(), Ordering::Relaxed);
                self.evac.objects_copied.fetch_add(1, Ordering::Relaxed);
                copy
            }
            Err(winner) => {
                to_region.retract(offset as u32);
                self.evac.lost_races.fetch_add(1, Ordering::Relaxed);
                winner
            }
        }
    }

    #[cold]
    fn evacuation_failed(&self, r: ObjRef, obj: &HeapObject) -> ObjRef {
        match obj.try_forward(r) {
            Ok(()) => {
                if let Some(region) = self.directory.region(r.region()) {
                    region.set_evac_failed();
                }
                self.evac.failures.fetch_add(1, Ordering::Relaxed);
                self.cancel(CancelCause::EvacuationFailure);
                r
            }
            Err(winner) => winner,
        }
    }

    /// Address `r` refers to once the current evacuation is complete.
    ///
    /// Unlike the load barrier this never evacuates.
    #[inline]
    pub(crate) fn forwarded(&self, r: ObjRef) -> ObjRef {
        if r.is_null() {
            return r;
        }
        let Some(region) = self.directory.region(r.region()) else {
            return r;
        };
        if region.state() != RegionState::Cset {
            return r;
        }
        region
            .object(r.offset())
            .and_then(|obj| obj.forwardee())
            .unwrap_or(r)
    }

    /// Point every root at the to-space copy, evacuating as needed.
    pub(crate) fn evacuate_roots(&self) {
        self.visit_roots(&mut |slot| {
            let value = slot.load();
            let resolved = self.load_barrier(value);
            if resolved != value {
                slot.store(resolved);
            }
        });
    }

    /// Copy every live object out of the collection set.
    ///
    /// Returns false if the cycle was cancelled before all regions were done.
    pub(crate) fn evacuate_collection_set(&self) -> bool {
        let cset: Vec<RegionId> = self.cset.read().regions().to_vec();
        let cursor = ClaimCursor::new(cset.len());
        self.workers.run(|_| {
            while let Some(i) = cursor.claim() {
                let Some(region) = self.directory.region(cset[i]) else {
                    continue;
                };
                for (offset, obj) in region.objects() {
                    if self.is_cancelled() {
                        return;
                    }
                    if obj.forwardee().is_none() && region.is_live(offset) {
                        self.evacuate_object(ObjRef::new(region.id(), offset), &obj);
                    }
                }
            }
        });
        !self.is_cancelled()
    }

    fn update_object_fields(&self, obj: &HeapObject) {
        obj.for_each_field(|field, value| {
            let resolved = self.forwarded(value);
            if resolved != value {
                // Losing the CAS means a mutator already stored a newer value.
                obj.cas_field(field, value, resolved);
            }
        });
    }

    /// Replace every from-space reference held by a live object.
    ///
    /// Walks live objects outside the collection set, plus the objects that
    /// stayed in place in regions whose evacuation failed.
    pub(crate) fn update_references(&self) -> bool {
        let regions: Vec<RegionId> = self.directory.iterate_live_regions().collect();
        let cursor = ClaimCursor::new(regions.len());
        self.workers.run(|_| {
            while let Some(i) = cursor.claim() {
                if self.is_cancelled() {
                    return;
                }
                let Some(region) = self.directory.region(regions[i]) else {
                    continue;
                };
                let state = region.state();
                let in_cset = state == RegionState::Cset;
                if state == RegionState::HumongousContinuation || in_cset && !region.evac_failed()
                {
                    continue;
                }
                for (offset, obj) in region.objects() {
                    let keep = if in_cset {
                        obj.forwardee() == Some(ObjRef::new(region.id(), offset))
                    } else {
                        region.is_live(offset)
                    };
                    if keep {
                        self.update_object_fields(&obj);
                    }
                }
            }
        });
        !self.is_cancelled()
    }

    /// Final-update-refs pause work: fix roots, put failed regions back in
    /// service, then trash and recycle the rest of the collection set.
    ///
    /// Returns `(regions recycled, bytes released)`.
    pub(crate) fn final_update_refs(&self) -> GcResult<(usize, usize)> {
        self.visit_roots(&mut |slot| {
            let value = slot.load();
            let resolved = self.forwarded(value);
            if resolved != value {
                slot.store(resolved);
            }
        });

        let cset: Vec<RegionId> = self.cset.read().regions().to_vec();
        let mut released = 0;
        let mut restored = 0;
        for &id in &cset {
            if let Some(region) = self.directory.region(id) {
                if region.evac_failed() {
                    released += region.restore_after_failed_evacuation();
                    restored += 1;
                }
            }
        }

        if self.config.verify {
            self.verify_region_closure()?;
        }

        let mut trash = Vec::with_capacity(cset.len());
        for &id in &cset {
            if let Some(region) = self.directory.region(id) {
                if region.state() == RegionState::Cset {
                    region.set_state(RegionState::Trash);
                    trash.push(id);
                }
            }
        }
        self.gc_state.set(0);

        let mut recycled = 0;
        for id in trash {
            if let Some(region) = self.directory.region(id) {
                released += region.used();
            }
            if self.directory.recycle(id) {
                recycled += 1;
            }
        }
        if restored > 0 {
            tracing::info!(
                target: "shoal::gc",
                regions = restored,
                "Regions with failed evacuation returned to service"
            );
        }
        Ok((recycled, released))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::GcState;
    use crate::config::HeapConfig;
    use crate::heuristics::CollectionSet;
    use std::sync::Arc;

    fn heap(regions: usize) -> Arc<Heap> {
        Heap::new(HeapConfig {
            region_size: 4096,
            region_count: regions,
            parallel_gc_threads: Some(2),
            ..HeapConfig::default()
        })
        .unwrap()
    }

    /// Put `id` in the collection set with every object counted live.
    fn make_cset(heap: &Heap, ids: &[RegionId]) {
        heap.retire_tlabs();
        heap.directory.retire_alloc_regions();
        for &id in ids {
            let region = heap.directory.region(id).unwrap();
            region.set_state(RegionState::Cset);
        }
        *heap.cset.write() = CollectionSet::from_regions(ids.to_vec(), &heap.directory);
        heap.evac.reset();
        heap.gc_state
            .set(GcState::EVACUATION | GcState::HAS_FORWARDED);
    }

    #[test]
    fn test_evacuate_copies_once() {
        let heap = heap(8);
        let m = heap.mutator();
        let a = m.alloc(48, 1).unwrap();
        m.store_data(a, 7).unwrap();
        make_cset(&heap, &[a.region()]);

        let obj = heap.directory.object(a).unwrap();
        let first = heap.evacuate_object(a, &obj);
        let second = heap.evacuate_object(a, &obj);
        assert_eq!(first, second);
        assert_ne!(first.region(), a.region());
        assert_eq!(heap.evac.bytes_copied(), 48);
        assert_eq!(heap.directory.object(first).unwrap().data(), 7);
    }

    #[test]
    fn test_racing_evacuation_keeps_one_copy() {
        let heap = heap(16);
        let m = heap.mutator();
        let objs: Vec<ObjRef> = (0..64).map(|_| m.alloc(32, 0).unwrap()).collect();
        let regions: Vec<RegionId> = {
            let mut ids: Vec<_> = objs.iter().map(|r| r.region()).collect();
            ids.dedup();
            ids
        };
        let used_before = heap.directory.used_bytes();
        make_cset(&heap, &regions);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for &r in &objs {
                        let obj = heap.directory.object(r).unwrap();
                        heap.evacuate_object(r, &obj);
                    }
                });
            }
        });

        assert_eq!(heap.evac.bytes_copied(), 64 * 32);
        assert_eq!(heap.evac.objects_copied(), 64);
        // From-space plus exactly one accounted copy per object.
        assert_eq!(heap.directory.used_bytes(), used_before * 2);
    }

    #[test]
    fn test_evacuation_failure_self_forwards() {
        let heap = heap(2);
        let m = heap.mutator();
        let a = m.alloc(32, 0).unwrap();
        make_cset(&heap, &[a.region()]);
        // Take the only other region so the collector has nowhere to copy.
        heap.directory.allocate_region().unwrap();

        let obj = heap.directory.object(a).unwrap();
        assert_eq!(heap.evacuate_object(a, &obj), a);
        assert!(heap.is_cancelled());
        assert!(heap.directory.region(a.region()).unwrap().evac_failed());
        assert_eq!(heap.evac.failures(), 1);
    }

    #[test]
    fn test_update_references_heals_fields() {
        let heap = heap(8);
        let m = heap.mutator();
        let holder = m.alloc(32, 1).unwrap();
        // Fill the holder's region so the target lands elsewhere.
        let target = {
            let mut t = m.alloc(32, 0).unwrap();
            while t.region() == holder.region() {
                t = m.alloc(32, 0).unwrap();
            }
            t
        };
        m.store_field(holder, 0, target).unwrap();
        // No marking has run: TAMS is zero, so everything counts as live.
        make_cset(&heap, &[target.region()]);
        assert!(heap.evacuate_collection_set());

        heap.gc_state
            .set(GcState::UPDATE_REFS | GcState::HAS_FORWARDED);
        assert!(heap.update_references());
        let field = heap.directory.object(holder).unwrap().load_field(0);
        assert_ne!(field.region(), target.region());
        assert_eq!(field, heap.forwarded(target));
    }
}
