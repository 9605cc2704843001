//! Cycle driver
//!
//! A concurrent cycle alternates short pauses with concurrent phases:
//!
//! ```text
//! init-mark (pause)         TAMS, roots
//! concurrent mark
//! final-mark (pause)        drain barriers, references, cset, evacuate roots
//! concurrent evacuation
//! init-update-refs (pause)
//! concurrent update-refs
//! final-update-refs (pause) roots, recycle the collection set
//! ```
//!
//! A cancelled cycle degenerates: whatever was left is finished inside one
//! pause, starting from the phase that was interrupted. An allocation that
//! still fails afterwards escalates to a full compaction, and only then to
//! [`GcError::FatalOutOfMemory`].

use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::barrier::GcState;
use crate::error::{GcError, GcResult};
use crate::heap::Heap;
use crate::heuristics::{CollectionSet, CollectionSetBuilder, GcCause, RegionCandidate};
use crate::reference::SoftRefPolicy;
use crate::region::{RegionId, RegionState};
use crate::stats::{CycleKind, CycleSummary};

/// Why the running cycle was cancelled
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelCause {
    None = 0,
    AllocationFailure = 1,
    EvacuationFailure = 2,
}

impl From<u8> for CancelCause {
    fn from(v: u8) -> Self {
        match v {
            1 => CancelCause::AllocationFailure,
            2 => CancelCause::EvacuationFailure,
            _ => CancelCause::None,
        }
    }
}

/// Where a degenerated cycle picks up
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum DegenPoint {
    OutsideCycle,
    Mark,
    Evacuation,
    UpdateRefs,
}

impl Heap {
    /// Cancel the running concurrent cycle. Ignored while degenerating.
    pub(crate) fn cancel(&self, cause: CancelCause) {
        if self.degenerating.load(Ordering::Acquire) {
            return;
        }
        if self
            .cancelled
            .compare_exchange(0, cause as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::debug!(target: "shoal::gc", ?cause, "Cancelling concurrent cycle");
        }
    }

    /// Whether concurrent work should stop.
    #[inline]
    pub(crate) fn is_cancelled(&self) -> bool {
        !self.degenerating.load(Ordering::Acquire) && self.cancelled.load(Ordering::Acquire) != 0
    }

    fn cancel_cause(&self) -> CancelCause {
        CancelCause::from(self.cancelled.load(Ordering::Acquire))
    }

    pub(crate) fn clears_soft(&self, cause: GcCause, under_pressure: bool) -> bool {
        match self.config.soft_ref_policy {
            SoftRefPolicy::AlwaysClear => true,
            SoftRefPolicy::NeverClear => false,
            SoftRefPolicy::ClearOnPressure => {
                under_pressure || cause == GcCause::AllocationFailure
            }
        }
    }

    /// Run a concurrent cycle now, on the calling thread.
    ///
    /// Must not be called from inside a [`MutatorScope`](crate::MutatorScope).
    pub fn collect(&self, cause: GcCause) -> GcResult<CycleSummary> {
        let _cycle = self.cycle_lock.lock();
        self.run_concurrent_cycle(cause)
    }

    /// Escalation step `attempt` after an allocation of `size` bytes failed.
    pub(crate) fn collect_for_allocation(&self, size: usize, attempt: usize) -> GcResult<()> {
        match attempt {
            0 => {
                let seen = self.gc_id.load(Ordering::Acquire);
                let _cycle = match self.cycle_lock.try_lock() {
                    Some(guard) => guard,
                    None => {
                        self.cancel(CancelCause::AllocationFailure);
                        let guard = self.cycle_lock.lock();
                        if self.gc_id.load(Ordering::Acquire) != seen {
                            return Ok(());
                        }
                        guard
                    }
                };
                self.run_concurrent_cycle(GcCause::AllocationFailure)?;
            }
            1 => {
                let _cycle = self.cycle_lock.lock();
                self.run_degenerated_cycle(GcCause::AllocationFailure)?;
            }
            2 => {
                let _cycle = self.cycle_lock.lock();
                self.run_full_gc(GcCause::AllocationFailure)?;
            }
            _ => {
                let capacity = self.directory.capacity();
                tracing::warn!(
                    target: "shoal::gc",
                    requested = size,
                    capacity,
                    used = self.directory.used_bytes(),
                    "Out of memory after full collection"
                );
                return Err(GcError::FatalOutOfMemory {
                    requested: size,
                    capacity,
                });
            }
        }
        Ok(())
    }

    pub(crate) fn begin_cycle(&self, cause: GcCause, kind: CycleKind) -> CycleSummary {
        let gc_id = self.gc_id.fetch_add(1, Ordering::AcqRel) + 1;
        self.cancelled.store(0, Ordering::Release);
        *self.last_cycle_start.lock() = Instant::now();
        self.allocated_since_cycle.store(0, Ordering::Relaxed);
        self.heuristics.lock().record_cycle_start();
        tracing::info!(target: "shoal::gc", gc_id, ?cause, ?kind, "Cycle start");
        CycleSummary::new(gc_id, cause, kind, self.directory.used_bytes())
    }

    fn run_concurrent_cycle(&self, cause: GcCause) -> GcResult<CycleSummary> {
        let start = Instant::now();
        let mut summary = self.begin_cycle(cause, CycleKind::Concurrent);
        let clear_soft = self.clears_soft(cause, false);

        {
            let _pause = self.safepoint.pause("init-mark");
            self.init_mark(clear_soft);
        }

        if !self.mark_to_completion() {
            return self.degenerate(DegenPoint::Mark, summary, start);
        }

        let marked = {
            let _pause = self.safepoint.pause("final-mark");
            self.final_mark(&mut summary, false)
        };
        if !marked {
            return self.degenerate(DegenPoint::Mark, summary, start);
        }
        if self.cset.read().is_empty() {
            return self.end_cycle(summary, start);
        }
        if self.is_cancelled() {
            return self.degenerate(DegenPoint::Evacuation, summary, start);
        }

        if !self.evacuate_collection_set() {
            return self.degenerate(DegenPoint::Evacuation, summary, start);
        }

        {
            let _pause = self.safepoint.pause("init-update-refs");
            self.gc_state
                .set(GcState::UPDATE_REFS | GcState::HAS_FORWARDED);
        }

        if !self.update_references() {
            return self.degenerate(DegenPoint::UpdateRefs, summary, start);
        }

        {
            let _pause = self.safepoint.pause("final-update-refs");
            let (recycled, _) = self.final_update_refs()?;
            summary.regions_recycled += recycled;
        }
        self.end_cycle(summary, start)
    }

    /// Degenerated cycle after repeated allocation failure: marks from
    /// scratch, clears soft references and evacuates every candidate.
    fn run_degenerated_cycle(&self, cause: GcCause) -> GcResult<CycleSummary> {
        let start = Instant::now();
        let summary = self.begin_cycle(cause, CycleKind::Degenerated);
        tracing::warn!(target: "shoal::gc", gc_id = summary.gc_id, ?cause, "Degenerated cycle");
        self.finish_degenerated(DegenPoint::OutsideCycle, summary, start, true)
    }

    fn degenerate(
        &self,
        point: DegenPoint,
        summary: CycleSummary,
        start: Instant,
    ) -> GcResult<CycleSummary> {
        tracing::warn!(
            target: "shoal::gc",
            gc_id = summary.gc_id,
            ?point,
            cause = ?self.cancel_cause(),
            "Concurrent cycle cancelled, degenerating"
        );
        self.stats.lock().cancelled += 1;
        self.finish_degenerated(point, summary, start, false)
    }

    fn finish_degenerated(
        &self,
        point: DegenPoint,
        mut summary: CycleSummary,
        start: Instant,
        aggressive: bool,
    ) -> GcResult<CycleSummary> {
        summary.kind = CycleKind::Degenerated;
        let result = {
            let _pause = self.safepoint.pause("degenerated");
            self.degenerating.store(true, Ordering::Release);
            let result = self.degenerated_work(point, &mut summary, aggressive);
            self.degenerating.store(false, Ordering::Release);
            self.cancelled.store(0, Ordering::Release);
            result
        };
        self.heuristics.lock().record_degenerated();
        result?;
        self.end_cycle(summary, start)
    }

    /// Finish a cycle from `point` with mutators stopped.
    fn degenerated_work(
        &self,
        point: DegenPoint,
        summary: &mut CycleSummary,
        aggressive: bool,
    ) -> GcResult<()> {
        if point == DegenPoint::OutsideCycle {
            self.init_mark(self.clears_soft(summary.cause, true));
        }
        if point <= DegenPoint::Mark {
            self.mark_to_completion();
            self.final_mark(summary, aggressive);
        }
        if self.cset.read().is_empty() {
            self.gc_state.set(0);
            return Ok(());
        }
        if point <= DegenPoint::Evacuation {
            self.gc_state
                .set(GcState::EVACUATION | GcState::HAS_FORWARDED);
            self.evacuate_roots();
            self.evacuate_collection_set();
            self.gc_state
                .set(GcState::UPDATE_REFS | GcState::HAS_FORWARDED);
        }
        self.update_references();
        let (recycled, _) = self.final_update_refs()?;
        summary.regions_recycled += recycled;
        Ok(())
    }

    /// Init-mark pause work.
    fn init_mark(&self, clear_soft: bool) {
        self.retire_tlabs();
        for region in self.directory.regions() {
            region.reset_marking();
        }
        self.marking.reset(clear_soft);
        self.references.reset();
        self.gc_state.set(GcState::MARKING);
        self.mark_roots();
    }

    /// Final-mark pause work. Returns false if marking was cancelled.
    ///
    /// Clears dead references, reclaims regions with no live data, selects
    /// the collection set and evacuates the roots.
    fn final_mark(&self, summary: &mut CycleSummary, aggressive: bool) -> bool {
        if !self.finish_marking() {
            return false;
        }
        self.gc_state.set(0);
        self.retire_tlabs();
        summary.references = self.references.process(&self.directory);

        let region_size = self.directory.region_size();
        let mut candidates = Vec::new();
        let mut trash: Vec<RegionId> = Vec::new();
        for region in self.directory.regions() {
            match region.state() {
                RegionState::Regular => {
                    let live = region.finalize_live();
                    if live == 0 {
                        trash.push(region.id());
                    } else if region.used() > live {
                        candidates.push(RegionCandidate::new(
                            region.id(),
                            region.used(),
                            live,
                            region_size,
                        ));
                    }
                }
                RegionState::HumongousStart => {
                    region.finalize_live();
                    if !region.is_live(0) && !region.is_pinned() {
                        let first = region.id().0;
                        let span = region.humongous_span().max(1) as u32;
                        trash.extend((first..first + span).map(RegionId));
                    }
                }
                RegionState::Pinned => {
                    region.finalize_live();
                }
                _ => {}
            }
        }

        for &id in &trash {
            if let Some(region) = self.directory.region(id) {
                summary.immediate_bytes += region.used();
                region.set_state(RegionState::Trash);
            }
        }
        for &id in &trash {
            if self.directory.recycle(id) {
                summary.immediate_regions += 1;
                summary.regions_recycled += 1;
            }
        }

        let ctx = self.heuristics_context();
        let mut builder = CollectionSetBuilder::new(
            candidates,
            self.config.cset_region_budget(),
            summary.immediate_bytes,
        );
        if builder.immediate_garbage_dominates(self.config.immediate_threshold_percent) {
            tracing::debug!(
                target: "shoal::gc",
                immediate = summary.immediate_bytes,
                "Immediate garbage dominates, skipping evacuation"
            );
        } else if aggressive {
            builder.add_above(0.0);
        } else {
            self.heuristics
                .lock()
                .select_collection_set(&mut builder, &ctx);
        }
        let cset = builder.build();
        for &id in cset.regions() {
            if let Some(region) = self.directory.region(id) {
                region.set_state(RegionState::Cset);
            }
        }
        summary.cset_regions = cset.len();
        summary.cset_live_bytes = cset.live_bytes();
        tracing::debug!(
            target: "shoal::gc",
            gc_id = summary.gc_id,
            regions = cset.len(),
            live = cset.live_bytes(),
            garbage = cset.garbage_bytes(),
            immediate_regions = summary.immediate_regions,
            cleared_refs = summary.references.cleared,
            "Collection set selected"
        );

        let empty = cset.is_empty();
        *self.cset.write() = cset;
        self.evac.reset();
        if !empty {
            self.gc_state
                .set(GcState::EVACUATION | GcState::HAS_FORWARDED);
            self.evacuate_roots();
        }
        true
    }

    pub(crate) fn end_cycle(
        &self,
        mut summary: CycleSummary,
        start: Instant,
    ) -> GcResult<CycleSummary> {
        *self.cset.write() = CollectionSet::default();
        if summary.kind != CycleKind::Full {
            summary.bytes_copied = self.evac.bytes_copied();
        }
        summary.used_after = self.directory.used_bytes();
        summary.duration = start.elapsed();

        if self.config.verify {
            let _pause = self.safepoint.pause("verify");
            self.verify_heap()?;
        }

        {
            let mut stats = self.stats.lock();
            stats.record(&summary);
            if summary.kind != CycleKind::Full {
                stats.evacuation_failures += self.evac.failures();
                stats.evacuation_races += self.evac.lost_races();
            }
        }
        {
            let mut heuristics = self.heuristics.lock();
            heuristics.record_cycle_end(&summary);
            if summary.kind == CycleKind::Concurrent {
                heuristics.record_success();
            }
        }
        tracing::info!(
            target: "shoal::gc",
            gc_id = summary.gc_id,
            cause = ?summary.cause,
            kind = ?summary.kind,
            used_before = summary.used_before,
            used_after = summary.used_after,
            copied = summary.bytes_copied,
            objects = self.evac.objects_copied(),
            recycled = summary.regions_recycled,
            duration_us = summary.duration.as_micros() as u64,
            "Cycle end"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HeapConfig, MarkingMode};
    use crate::heuristics::HeuristicsKind;
    use crate::object::ObjRef;
    use crate::reference::RefKind;
    use std::sync::Arc;

    fn heap(heuristics: HeuristicsKind) -> Arc<Heap> {
        Heap::new(HeapConfig {
            region_size: 4096,
            region_count: 16,
            heuristics,
            parallel_gc_threads: Some(2),
            verify: true,
            ..HeapConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_cancel_ignored_while_degenerating() {
        let heap = heap(HeuristicsKind::Static);
        heap.degenerating.store(true, Ordering::Release);
        heap.cancel(CancelCause::AllocationFailure);
        assert!(!heap.is_cancelled());
        heap.degenerating.store(false, Ordering::Release);
        assert!(!heap.is_cancelled());
        heap.cancel(CancelCause::EvacuationFailure);
        heap.cancel(CancelCause::AllocationFailure);
        assert!(heap.is_cancelled());
        assert_eq!(heap.cancel_cause(), CancelCause::EvacuationFailure);
    }

    #[test]
    fn test_cycle_reclaims_unreachable_regions() {
        let heap = heap(HeuristicsKind::Static);
        let m = heap.mutator();
        let keep = m.alloc_rooted(64, 0).unwrap();
        for _ in 0..200 {
            m.alloc(64, 0).unwrap();
        }
        let before = heap.used_bytes();
        let summary = heap.collect(GcCause::Explicit).unwrap();
        assert_eq!(summary.kind, CycleKind::Concurrent);
        assert!(summary.used_after < before);
        assert!(summary.regions_recycled > 0);
        let kept = m.roots().get(keep);
        assert!(heap.directory.object(kept).is_some());
    }

    #[test]
    fn test_aggressive_cycle_evacuates_live_data() {
        let heap = heap(HeuristicsKind::Aggressive);
        let m = heap.mutator();
        let head = m.alloc_rooted(32, 1).unwrap();
        let mut tail = m.roots().get(head);
        for i in 0..40 {
            let next = m.alloc(32, 1).unwrap();
            m.store_data(next, i).unwrap();
            m.store_field(tail, 0, next).unwrap();
            tail = next;
            m.alloc(64, 0).unwrap();
        }

        let summary = heap.collect(GcCause::Explicit).unwrap();
        assert!(summary.cset_regions > 0);
        assert_eq!(summary.bytes_copied, summary.cset_live_bytes);

        let mut cur = m.load_field(m.roots().get(head), 0).unwrap();
        for i in 0..40 {
            assert_eq!(m.load_data(cur).unwrap(), i);
            cur = m.load_field(cur, 0).unwrap();
        }
        assert!(cur.is_null());
    }

    #[test]
    fn test_no_garbage_cycle_is_noop() {
        let heap = heap(HeuristicsKind::Aggressive);
        let m = heap.mutator();
        for _ in 0..20 {
            m.alloc_rooted(48, 0).unwrap();
        }
        let used = heap.used_bytes();
        let first = heap.collect(GcCause::Explicit).unwrap();
        let second = heap.collect(GcCause::Explicit).unwrap();
        assert_eq!(second.cset_regions, 0);
        assert_eq!(second.bytes_copied, 0);
        assert_eq!(first.used_after, used);
        assert_eq!(second.used_after, used);
    }

    #[test]
    fn test_soft_policy() {
        let heap = heap(HeuristicsKind::Static);
        assert!(!heap.clears_soft(GcCause::Explicit, false));
        assert!(heap.clears_soft(GcCause::AllocationFailure, false));
        assert!(heap.clears_soft(GcCause::Explicit, true));
    }

    /// Runs one concurrent cycle by hand, cutting the only strong path to a
    /// weakly referenced object between init-mark and final-mark. Returns
    /// the referents cleared by that cycle and by the next one.
    fn referent_dropped_during_marking(mode: MarkingMode) -> (usize, usize) {
        let heap = Heap::new(HeapConfig {
            region_size: 4096,
            region_count: 16,
            heuristics: HeuristicsKind::Static,
            mode,
            parallel_gc_threads: Some(2),
            verify: true,
            ..HeapConfig::default()
        })
        .unwrap();
        let m = heap.mutator();
        let holder = m.alloc_rooted(32, 1).unwrap();
        let referent = m.alloc(64, 0).unwrap();
        m.store_field(m.roots().get(holder), 0, referent).unwrap();
        let weak = m.alloc_reference(RefKind::Weak, referent, None).unwrap();
        let weak = m.roots().insert(weak);

        let start = Instant::now();
        let mut summary = heap.begin_cycle(GcCause::Explicit, CycleKind::Concurrent);
        {
            let _pause = heap.safepoint.pause("init-mark");
            heap.init_mark(false);
        }
        m.store_field(m.roots().get(holder), 0, ObjRef::NULL).unwrap();
        assert!(heap.mark_to_completion());
        {
            let _pause = heap.safepoint.pause("final-mark");
            assert!(heap.final_mark(&mut summary, false));
        }
        let first = summary.references.cleared;
        {
            let _pause = heap.safepoint.pause("finish");
            heap.degenerated_work(DegenPoint::Evacuation, &mut summary, false)
                .unwrap();
        }
        heap.end_cycle(summary, start).unwrap();

        let second = heap.collect(GcCause::Explicit).unwrap().references.cleared;
        assert!(m.reference_get(m.roots().get(weak)).unwrap().is_null());
        (first, second)
    }

    #[test]
    fn test_incremental_update_clears_referent_dropped_during_marking() {
        assert_eq!(
            referent_dropped_during_marking(MarkingMode::IncrementalUpdate),
            (1, 0)
        );
    }

    #[test]
    fn test_satb_clears_referent_dropped_during_marking_next_cycle() {
        assert_eq!(referent_dropped_during_marking(MarkingMode::Satb), (0, 1));
    }
}
