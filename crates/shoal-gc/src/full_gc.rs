//! Full stop-the-world compaction
//!
//! The last resort before running out of memory, and the cure for
//! fragmentation that leaves no contiguous run for a humongous object.
//! Everything happens in one pause:
//!
//! 1. Mark from the roots and process references.
//! 2. Plan: slide every live object toward the bottom of the heap in address
//!    order. Humongous objects start on a region boundary. Pinned regions
//!    (and pinned humongous spans) stay where they are and are skipped.
//! 3. Move objects to their planned slots and rewrite every root and field
//!    through the forwarding table.
//! 4. Rebuild region accounting and the free set.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use rustc_hash::FxHashMap;

use crate::error::{GcError, GcResult};
use crate::heap::Heap;
use crate::heuristics::GcCause;
use crate::object::{HeapObject, ObjRef};
use crate::region::{RegionId, RegionState};
use crate::stats::{CycleKind, CycleSummary};

/// A live object that will be moved.
struct Mover {
    from: ObjRef,
    object: Arc<HeapObject>,
    /// Regions spanned; zero for regular objects
    span: usize,
}

/// Planned post-compaction layout of one region.
#[derive(Clone, Copy)]
struct Layout {
    state: RegionState,
    top: usize,
    used: usize,
    span: usize,
}

impl Layout {
    const EMPTY: Layout = Layout {
        state: RegionState::Empty,
        top: 0,
        used: 0,
        span: 0,
    };
}

impl Heap {
    /// Run a full compaction now.
    ///
    /// Must not be called from inside a [`MutatorScope`](crate::MutatorScope).
    pub fn collect_full(&self, cause: GcCause) -> GcResult<CycleSummary> {
        let _cycle = self.cycle_lock.lock();
        self.run_full_gc(cause)
    }

    pub(crate) fn run_full_gc(&self, cause: GcCause) -> GcResult<CycleSummary> {
        let start = Instant::now();
        let mut summary = self.begin_cycle(cause, CycleKind::Full);
        tracing::warn!(target: "shoal::gc", gc_id = summary.gc_id, ?cause, "Full collection");
        let result = {
            let _pause = self.safepoint.pause("full");
            self.degenerating.store(true, Ordering::Release);
            let result = self.full_gc_work(&mut summary);
            self.degenerating.store(false, Ordering::Release);
            self.cancelled.store(0, Ordering::Release);
            result
        };
        result?;
        self.end_cycle(summary, start)
    }

    fn full_gc_work(&self, summary: &mut CycleSummary) -> GcResult<()> {
        self.gc_state.set(0);
        self.retire_tlabs();
        for region in self.directory.regions() {
            region.reset_marking();
        }
        self.marking.reset(self.clears_soft(summary.cause, true));
        self.references.reset();
        self.mark_roots();
        self.finish_marking();
        summary.references = self.references.process(&self.directory);

        let regions = self.directory.regions();
        let region_size = self.directory.region_size();
        let was_active = regions.iter().filter(|r| r.state().is_active()).count();

        // Pinned regions and pinned humongous spans do not move.
        let mut fixed = vec![false; regions.len()];
        for (i, region) in regions.iter().enumerate() {
            if region.is_pinned() && region.state().is_active() {
                let span = if region.state() == RegionState::HumongousStart {
                    region.humongous_span().max(1)
                } else {
                    1
                };
                for slot in fixed.iter_mut().skip(i).take(span) {
                    *slot = true;
                }
            }
        }

        let mut movers = Vec::new();
        let mut layout = vec![Layout::EMPTY; regions.len()];
        for (i, region) in regions.iter().enumerate() {
            if fixed[i] {
                if region.state() == RegionState::HumongousContinuation
                    || region.state() == RegionState::HumongousStart
                {
                    layout[i] = Layout {
                        state: region.state(),
                        top: region.top(),
                        used: region.used(),
                        span: region.humongous_span(),
                    };
                    continue;
                }
                for (offset, _) in region.objects() {
                    if !region.is_live(offset) {
                        region.retract(offset);
                    }
                }
                layout[i] = Layout {
                    state: RegionState::Regular,
                    top: region.top(),
                    used: region.used(),
                    span: 0,
                };
                continue;
            }
            match region.state() {
                RegionState::Empty | RegionState::HumongousContinuation => {}
                RegionState::HumongousStart => {
                    let span = region.humongous_span().max(1);
                    for (offset, object) in region.take_objects() {
                        if region.is_live(offset) {
                            movers.push(Mover {
                                from: ObjRef::new(region.id(), offset),
                                object,
                                span,
                            });
                        }
                    }
                }
                _ => {
                    for (offset, object) in region.take_objects() {
                        if region.is_live(offset) {
                            movers.push(Mover {
                                from: ObjRef::new(region.id(), offset),
                                object,
                                span: 0,
                            });
                        }
                    }
                }
            }
        }

        // Plan destinations.
        let mut forwarding: FxHashMap<ObjRef, ObjRef> = FxHashMap::default();
        let mut placements = Vec::with_capacity(movers.len());
        let mut cursor = 0usize;
        let mut offset = 0usize;
        for mover in movers {
            let size = mover.object.size();
            let dest = if mover.span > 0 {
                if offset > 0 {
                    cursor += 1;
                    offset = 0;
                }
                while let Some(blocked) = (cursor..cursor + mover.span)
                    .take_while(|&i| i < fixed.len())
                    .find(|&i| fixed[i])
                {
                    cursor = blocked + 1;
                }
                if cursor + mover.span > regions.len() {
                    return Err(GcError::Verification(
                        "full compaction ran out of regions".into(),
                    ));
                }
                let mut remaining = size;
                for j in 0..mover.span {
                    let share = remaining.min(region_size);
                    remaining -= share;
                    layout[cursor + j] = Layout {
                        state: if j == 0 {
                            RegionState::HumongousStart
                        } else {
                            RegionState::HumongousContinuation
                        },
                        top: region_size,
                        used: share,
                        span: if j == 0 { mover.span } else { 0 },
                    };
                }
                let dest = ObjRef::new(RegionId(cursor as u32), 0);
                cursor += mover.span;
                dest
            } else {
                while cursor < fixed.len() && (fixed[cursor] || offset + size > region_size) {
                    cursor += 1;
                    offset = 0;
                }
                if cursor >= regions.len() {
                    return Err(GcError::Verification(
                        "full compaction ran out of regions".into(),
                    ));
                }
                let dest = ObjRef::new(RegionId(cursor as u32), offset as u32);
                offset += size;
                let slot = &mut layout[cursor];
                slot.state = RegionState::Regular;
                slot.top = offset;
                slot.used += size;
                dest
            };
            if dest != mover.from {
                forwarding.insert(mover.from, dest);
                summary.bytes_copied += size;
            }
            placements.push((dest, mover.object));
        }

        // Move.
        for (i, region) in regions.iter().enumerate() {
            let plan = layout[i];
            if plan.state == RegionState::Empty && region.state() == RegionState::Empty {
                continue;
            }
            region.reset_layout(plan.state, plan.top, plan.used, plan.span);
        }
        for (dest, object) in placements {
            if let Some(region) = self.directory.region(dest.region()) {
                region.put_object(dest.offset(), object);
            }
        }
        self.directory.rebuild_free_set();

        // Fix references.
        let forward = |r: ObjRef| forwarding.get(&r).copied();
        self.visit_roots(&mut |slot| {
            if let Some(to) = forward(slot.load()) {
                slot.store(to);
            }
        });
        for region in regions {
            for (_, object) in region.objects() {
                object.for_each_field(|field, value| {
                    if let Some(to) = forward(value) {
                        object.store_field(field, to);
                    }
                });
            }
        }

        let now_active = regions.iter().filter(|r| r.state().is_active()).count();
        summary.regions_recycled = was_active.saturating_sub(now_active);
        tracing::info!(
            target: "shoal::gc",
            gc_id = summary.gc_id,
            moved = forwarding.len(),
            copied = summary.bytes_copied,
            regions_freed = summary.regions_recycled,
            "Compaction complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;

    fn heap(regions: usize) -> Arc<Heap> {
        Heap::new(HeapConfig {
            region_size: 4096,
            region_count: regions,
            parallel_gc_threads: Some(1),
            verify: true,
            ..HeapConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_full_gc_compacts_and_preserves_graph() {
        let heap = heap(16);
        let m = heap.mutator();
        let head = m.alloc_rooted(32, 1).unwrap();
        let mut tail = m.roots().get(head);
        for i in 0..100 {
            m.alloc(256, 0).unwrap();
            let next = m.alloc(32, 1).unwrap();
            m.store_data(next, i).unwrap();
            m.store_field(tail, 0, next).unwrap();
            tail = next;
        }
        let regions_before = heap.directory.region_count() - heap.directory.free_regions();

        let summary = heap.collect_full(GcCause::Explicit).unwrap();
        assert_eq!(summary.kind, CycleKind::Full);
        assert_eq!(summary.used_after, 32 * 101);
        assert!(heap.directory.region_count() - heap.directory.free_regions() < regions_before);

        let mut cur = m.load_field(m.roots().get(head), 0).unwrap();
        for i in 0..100 {
            assert_eq!(m.load_data(cur).unwrap(), i);
            cur = m.load_field(cur, 0).unwrap();
        }
        assert!(cur.is_null());
    }

    #[test]
    fn test_full_gc_leaves_pinned_regions() {
        let heap = heap(8);
        let m = heap.mutator();
        m.alloc(1024, 0).unwrap();
        let pinned = m.alloc_rooted(64, 0).unwrap();
        let addr = m.pin(m.roots().get(pinned)).unwrap();

        heap.collect_full(GcCause::Explicit).unwrap();
        assert_eq!(m.roots().get(pinned), addr);
        assert_eq!(
            heap.directory.region_state(addr.region()),
            Some(RegionState::Pinned)
        );
        assert_eq!(heap.directory.region(addr.region()).unwrap().used(), 64);
    }

    #[test]
    fn test_full_gc_defragments_humongous() {
        let heap = heap(8);
        let m = heap.mutator();
        // Alternate live and dead two-region objects.
        let mut live = Vec::new();
        for i in 0..4 {
            let h = m.alloc_rooted(4096 + 8, 0).unwrap();
            if i % 2 == 0 {
                live.push(h);
            } else {
                m.roots().remove(h);
            }
        }
        assert_eq!(heap.directory.free_regions(), 0);

        heap.collect_full(GcCause::Explicit).unwrap();
        assert_eq!(heap.directory.free_regions(), 4);
        let starts: Vec<u32> = live.iter().map(|&h| m.roots().get(h).region().0).collect();
        assert_eq!(starts, vec![0, 2]);
        // A four-region object now fits.
        m.alloc(3 * 4096 + 8, 0).unwrap();
    }
}
