//! Object allocation
//!
//! Three paths, chosen by size:
//!
//! - **TLAB**: small objects are bump-allocated from a thread-local buffer
//!   carved out of the current mutator region. The buffer starts at
//!   `min_tlab_size` and doubles on every refill up to `max_tlab_size`; a
//!   thread that stayed idle for `tlab_idle_shrink_ms` starts over at the
//!   minimum.
//! - **Shared**: objects larger than the TLAB cap go straight to the
//!   mutator region under the free-set lock.
//! - **Humongous**: objects at or above the humongous threshold get a run of
//!   contiguous regions of their own.
//!
//! A failed attempt leaves the heap untouched; the caller escalates through
//! the collector and retries.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crate::config::HeapConfig;
use crate::error::{GcError, GcResult};
use crate::heap::Heap;
use crate::object::{
    HeapObject, ObjRef, ObjectKind, checked_align_size, checked_min_object_size,
};
use crate::region::RegionId;

/// Thread-local allocation buffer
#[derive(Debug)]
pub(crate) struct Tlab {
    region: Option<RegionId>,
    cursor: usize,
    end: usize,
    /// Size of the next refill
    size: usize,
    min: usize,
    max: usize,
    idle_shrink: Duration,
    last_used: Instant,
    refills: u64,
}

impl Tlab {
    pub(crate) fn new(config: &HeapConfig) -> Self {
        let (min, max) = config.tlab_bounds();
        Self {
            region: None,
            cursor: 0,
            end: 0,
            size: min,
            min,
            max,
            idle_shrink: Duration::from_millis(config.tlab_idle_shrink_ms),
            last_used: Instant::now(),
            refills: 0,
        }
    }

    /// Drop the remaining space.
    pub(crate) fn retire(&mut self) {
        self.region = None;
        self.cursor = 0;
        self.end = 0;
    }

    /// Size the next refill will ask for
    pub(crate) fn desired_size(&self) -> usize {
        self.size
    }

    fn bump(&mut self, size: usize) -> Option<(RegionId, usize)> {
        let region = self.region?;
        if self.cursor + size > self.end {
            return None;
        }
        let offset = self.cursor;
        self.cursor += size;
        Some((region, offset))
    }

    fn refilled(&mut self, region: RegionId, start: usize, len: usize) {
        self.region = Some(region);
        self.cursor = start;
        self.end = start + len;
        self.size = (self.size * 2).min(self.max);
        self.refills += 1;
        tracing::trace!(target: "shoal::gc", region = region.0, len, refills = self.refills, "TLAB refilled");
    }

    fn touch(&mut self, now: Instant) {
        if now.duration_since(self.last_used) > self.idle_shrink && self.size > self.min {
            tracing::trace!(target: "shoal::gc", from = self.size, to = self.min, "TLAB shrunk after idling");
            self.size = self.min;
        }
        self.last_used = now;
    }
}

impl Heap {
    /// Validate a requested size, returning the aligned size.
    pub(crate) fn check_allocation(&self, size: usize, ref_fields: usize) -> GcResult<usize> {
        let capacity = self.directory.capacity();
        let Some(minimum) = checked_min_object_size(ref_fields) else {
            return Err(GcError::InvalidSize {
                size,
                ref_fields,
                minimum: usize::MAX,
            });
        };
        let Some(aligned) = checked_align_size(size) else {
            tracing::warn!(target: "shoal::gc", requested = size, capacity, "Allocation larger than the heap");
            return Err(GcError::FatalOutOfMemory {
                requested: size,
                capacity,
            });
        };
        if aligned < minimum {
            return Err(GcError::InvalidSize {
                size,
                ref_fields,
                minimum,
            });
        }
        if aligned > capacity {
            tracing::warn!(target: "shoal::gc", requested = aligned, capacity, "Allocation larger than the heap");
            return Err(GcError::FatalOutOfMemory {
                requested: aligned,
                capacity,
            });
        }
        Ok(aligned)
    }

    /// One allocation attempt, without collecting.
    ///
    /// `size` must come from [`check_allocation`](Self::check_allocation).
    /// Must run inside a mutator operation.
    pub(crate) fn try_allocate(
        &self,
        tlab: &mut Tlab,
        size: usize,
        kind: ObjectKind,
        ref_fields: usize,
    ) -> GcResult<ObjRef> {
        let r = if size >= self.config.humongous_threshold() {
            self.allocate_humongous(size, kind, ref_fields)?
        } else {
            let (region, offset) = if size <= tlab.max {
                self.allocate_in_tlab(tlab, size)?
            } else {
                self.directory.mutator_allocate(size)?
            };
            let region = self
                .directory
                .region(region)
                .ok_or(GcError::AllocationFailure { size })?;
            region.install(offset, HeapObject::new(size, kind, ref_fields))
        };
        self.allocated_since_cycle.fetch_add(size, Ordering::Relaxed);
        Ok(r)
    }

    fn allocate_in_tlab(&self, tlab: &mut Tlab, size: usize) -> GcResult<(RegionId, usize)> {
        tlab.touch(Instant::now());
        if let Some(slot) = tlab.bump(size) {
            return Ok(slot);
        }
        // A refill may come back smaller than desired, but never smaller
        // than the object.
        let (region, start, len) = self
            .directory
            .mutator_allocate_tlab(size, tlab.desired_size())?;
        tlab.refilled(region, start, len);
        tlab.bump(size).ok_or(GcError::AllocationFailure { size })
    }

    fn allocate_humongous(
        &self,
        size: usize,
        kind: ObjectKind,
        ref_fields: usize,
    ) -> GcResult<ObjRef> {
        let count = size.div_ceil(self.directory.region_size());
        let start = self.directory.allocate_contiguous(count, size)?;
        let region = self
            .directory
            .region(start)
            .ok_or(GcError::AllocationFailure { size })?;
        // The run's accounting was set when it was claimed.
        region.put_object(0, Arc::new(HeapObject::new(size, kind, ref_fields)));
        tracing::trace!(target: "shoal::gc", region = start.0, regions = count, size, "Humongous allocation");
        Ok(ObjRef::new(start, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionState;

    fn heap(config: HeapConfig) -> Arc<Heap> {
        Heap::new(config).unwrap()
    }

    fn small() -> HeapConfig {
        HeapConfig {
            region_size: 4096,
            region_count: 8,
            min_tlab_size: 256,
            max_tlab_size: 1024,
            ..HeapConfig::default()
        }
    }

    #[test]
    fn test_tlab_grows_elastically() {
        let heap = heap(small());
        let mut tlab = Tlab::new(&heap.config);
        assert_eq!(tlab.desired_size(), 256);
        for _ in 0..(256 / 32) {
            heap.try_allocate(&mut tlab, 32, ObjectKind::Plain, 0).unwrap();
        }
        assert_eq!(tlab.refills, 1);
        heap.try_allocate(&mut tlab, 32, ObjectKind::Plain, 0).unwrap();
        assert_eq!(tlab.refills, 2);
        assert_eq!(tlab.desired_size(), 1024);
        assert_eq!(heap.directory.used_bytes(), 9 * 32);
    }

    #[test]
    fn test_tlab_shrinks_after_idle() {
        let heap = heap(HeapConfig {
            tlab_idle_shrink_ms: 0,
            ..small()
        });
        let mut tlab = Tlab::new(&heap.config);
        tlab.size = 1024;
        std::thread::sleep(Duration::from_millis(2));
        tlab.touch(Instant::now());
        assert_eq!(tlab.desired_size(), 256);
    }

    #[test]
    fn test_size_validation() {
        let heap = heap(small());
        assert!(matches!(
            heap.check_allocation(16, 0),
            Err(GcError::InvalidSize { minimum: 24, .. })
        ));
        assert_eq!(heap.check_allocation(25, 0).unwrap(), 32);
        assert!(matches!(
            heap.check_allocation(9 * 4096, 0),
            Err(GcError::FatalOutOfMemory { .. })
        ));
    }

    #[test]
    fn test_shared_and_humongous_paths() {
        let heap = heap(small());
        let mut tlab = Tlab::new(&heap.config);

        let shared = heap
            .try_allocate(&mut tlab, 2048, ObjectKind::Plain, 0)
            .unwrap();
        assert_eq!(tlab.refills, 0);
        assert_eq!(
            heap.directory.region_state(shared.region()),
            Some(RegionState::Regular)
        );

        let big = heap
            .try_allocate(&mut tlab, 2 * 4096 + 8, ObjectKind::Plain, 0)
            .unwrap();
        assert_eq!(big.offset(), 0);
        assert_eq!(
            heap.directory.region_state(big.region()),
            Some(RegionState::HumongousStart)
        );
        assert_eq!(heap.directory.used_bytes(), 2048 + 2 * 4096 + 8);
        assert!(heap.directory.object(big).is_some());
    }
}
