//! Region directory and free set
//!
//! Owns every region of the heap. Region state lives in each region as an
//! atomic; the set of empty regions and the current allocation regions sit
//! behind one lock.
//!
//! Mutators take empty regions from the low end of the heap and the
//! collector takes them from the high end, so evacuation copies tend to
//! land away from fresh mutator allocation.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{GcError, GcResult};
use crate::object::{HeapObject, ObjRef};
use crate::region::{Region, RegionId, RegionSample, RegionState};

/// Which end of the heap an allocation region is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Mutator,
    Collector,
}

#[derive(Debug, Default)]
struct FreeSet {
    empty: BTreeSet<u32>,
    mutator_region: Option<RegionId>,
    collector_region: Option<RegionId>,
}

impl FreeSet {
    fn take(&mut self, side: Side) -> Option<u32> {
        match side {
            Side::Mutator => self.empty.pop_first(),
            Side::Collector => self.empty.pop_last(),
        }
    }

    fn current(&mut self, side: Side) -> &mut Option<RegionId> {
        match side {
            Side::Mutator => &mut self.mutator_region,
            Side::Collector => &mut self.collector_region,
        }
    }
}

/// The region directory.
pub struct RegionDirectory {
    regions: Box<[Region]>,
    region_size: usize,
    free: Mutex<FreeSet>,
}

impl RegionDirectory {
    /// Create `count` empty regions of `region_size` bytes each.
    pub fn new(count: usize, region_size: usize) -> Self {
        let regions = (0..count)
            .map(|i| Region::new(RegionId(i as u32), region_size))
            .collect();
        let free = FreeSet {
            empty: (0..count as u32).collect(),
            ..Default::default()
        };
        Self {
            regions,
            region_size,
            free: Mutex::new(free),
        }
    }

    /// Size of every region in bytes
    #[inline]
    pub fn region_size(&self) -> usize {
        self.region_size
    }

    /// Number of regions
    #[inline]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Total heap capacity in bytes
    #[inline]
    pub fn capacity(&self) -> usize {
        self.regions.len() * self.region_size
    }

    /// Look up a region.
    #[inline]
    pub fn region(&self, id: RegionId) -> Option<&Region> {
        self.regions.get(id.index())
    }

    /// All regions in address order.
    #[inline]
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Current state of a region, or `None` for an unknown id.
    pub fn region_state(&self, id: RegionId) -> Option<RegionState> {
        self.region(id).map(Region::state)
    }

    /// Look up the object an `ObjRef` names.
    #[inline]
    pub(crate) fn object(&self, r: ObjRef) -> Option<Arc<HeapObject>> {
        if r.is_null() {
            return None;
        }
        self.region(r.region())?.object(r.offset())
    }

    /// Take the lowest empty region and make it a regular region.
    pub fn allocate_region(&self) -> GcResult<RegionId> {
        let mut free = self.free.lock();
        self.take_locked(&mut free, Side::Mutator)
    }

    /// Take the highest empty region for evacuation copies.
    pub fn allocate_collector_region(&self) -> GcResult<RegionId> {
        let mut free = self.free.lock();
        self.take_locked(&mut free, Side::Collector)
    }

    fn take_locked(&self, free: &mut FreeSet, side: Side) -> GcResult<RegionId> {
        let idx = free.take(side).ok_or(GcError::OutOfRegions)?;
        let region = &self.regions[idx as usize];
        region.activate(RegionState::Regular);
        Ok(region.id())
    }

    /// Take the lowest run of `count` contiguous empty regions.
    ///
    /// The first region becomes `HumongousStart`, the rest
    /// `HumongousContinuation`. `size` is spread over the run for accounting.
    pub fn allocate_contiguous(&self, count: usize, size: usize) -> GcResult<RegionId> {
        if count == 0 {
            return Err(GcError::AllocationFailure { size });
        }
        let mut free = self.free.lock();
        let mut run_start = None;
        let mut run_len = 0;
        let mut prev: Option<u32> = None;
        for &idx in free.empty.iter() {
            match prev {
                Some(p) if p + 1 == idx => run_len += 1,
                _ => {
                    run_start = Some(idx);
                    run_len = 1;
                }
            }
            prev = Some(idx);
            if run_len == count {
                break;
            }
        }
        let start = match run_start {
            Some(start) if run_len == count => start,
            _ => return Err(GcError::OutOfRegions),
        };

        let mut remaining = size;
        for (i, idx) in (start..start + count as u32).enumerate() {
            free.empty.remove(&idx);
            let share = remaining.min(self.region_size);
            remaining -= share;
            let region = &self.regions[idx as usize];
            let state = if i == 0 {
                RegionState::HumongousStart
            } else {
                RegionState::HumongousContinuation
            };
            region.activate(state);
            region.make_humongous(state, if i == 0 { count } else { 0 }, share);
        }
        Ok(RegionId(start))
    }

    /// Bump-allocate `size` bytes from the current allocation region of one
    /// side, switching to a fresh region when it is full.
    fn allocate_in(&self, side: Side, size: usize) -> GcResult<(RegionId, usize)> {
        let mut free = self.free.lock();
        if let Some(id) = *free.current(side) {
            if let Some(offset) = self.regions[id.index()].bump(size) {
                return Ok((id, offset));
            }
        }
        let id = self.take_locked(&mut free, side)?;
        *free.current(side) = Some(id);
        let offset = self.regions[id.index()]
            .bump(size)
            .ok_or(GcError::AllocationFailure { size })?;
        Ok((id, offset))
    }

    /// Shared (out-of-TLAB) mutator allocation.
    pub(crate) fn mutator_allocate(&self, size: usize) -> GcResult<(RegionId, usize)> {
        self.allocate_in(Side::Mutator, size)
    }

    /// Evacuation allocation.
    pub(crate) fn collector_allocate(&self, size: usize) -> GcResult<(RegionId, usize)> {
        self.allocate_in(Side::Collector, size)
    }

    /// Carve a TLAB of up to `desired` bytes (at least `min`) from the
    /// current mutator region. Returns `(region, start, len)`.
    pub(crate) fn mutator_allocate_tlab(
        &self,
        min: usize,
        desired: usize,
    ) -> GcResult<(RegionId, usize, usize)> {
        let desired = desired.clamp(min, self.region_size);
        let mut free = self.free.lock();
        if let Some(id) = free.mutator_region {
            let region = &self.regions[id.index()];
            let len = desired.min(region.free());
            if len >= min {
                if let Some(start) = region.bump(len) {
                    return Ok((id, start, len));
                }
            }
        }
        let id = self.take_locked(&mut free, Side::Mutator)?;
        free.mutator_region = Some(id);
        let start = self.regions[id.index()]
            .bump(desired)
            .ok_or(GcError::AllocationFailure { size: min })?;
        Ok((id, start, desired))
    }

    /// Forget the current allocation regions. Their remaining space is
    /// abandoned until they are recycled.
    pub(crate) fn retire_alloc_regions(&self) {
        let mut free = self.free.lock();
        free.mutator_region = None;
        free.collector_region = None;
    }

    /// Return a region to the empty pool.
    ///
    /// Returns false if the region was already empty, so a region can only
    /// be handed back once per use.
    pub fn recycle(&self, id: RegionId) -> bool {
        let Some(region) = self.region(id) else {
            return false;
        };
        let mut free = self.free.lock();
        if free.empty.contains(&id.0) {
            return false;
        }
        if free.mutator_region == Some(id) {
            free.mutator_region = None;
        }
        if free.collector_region == Some(id) {
            free.collector_region = None;
        }
        region.recycle();
        free.empty.insert(id.0);
        true
    }

    /// Lazily iterate the ids of regions that may hold live objects.
    ///
    /// The iterator is `Clone`; cloning it before use restarts the walk.
    pub fn iterate_live_regions(&self) -> LiveRegions<'_> {
        LiveRegions {
            regions: &self.regions,
            next: 0,
        }
    }

    /// Sum of the object bytes in all regions.
    pub fn used_bytes(&self) -> usize {
        self.regions.iter().map(Region::used).sum()
    }

    /// Number of regions in the empty pool.
    pub fn free_regions(&self) -> usize {
        self.free.lock().empty.len()
    }

    /// Bytes held by empty regions.
    pub fn free_bytes(&self) -> usize {
        self.free_regions() * self.region_size
    }

    /// Bytes of committed backing memory.
    pub fn committed_bytes(&self) -> usize {
        self.regions.iter().filter(|r| r.is_committed()).count() * self.region_size
    }

    /// Uncommit empty regions that have been idle for longer than `delay`.
    /// Returns how many regions were uncommitted.
    pub fn uncommit_idle(&self, delay: Duration) -> usize {
        let Some(deadline) = Instant::now().checked_sub(delay) else {
            return 0;
        };
        let free = self.free.lock();
        free.empty
            .iter()
            .filter(|&&idx| self.regions[idx as usize].try_uncommit(deadline))
            .count()
    }

    /// Read-only occupancy snapshot of every region.
    pub fn snapshot(&self) -> Vec<RegionSample> {
        self.regions.iter().map(Region::sample).collect()
    }

    /// Rebuild the empty pool from region states after a compaction.
    ///
    /// The regular region with the most room left becomes the mutator
    /// allocation region, so the tail of the compacted heap stays usable.
    pub(crate) fn rebuild_free_set(&self) {
        let mut free = self.free.lock();
        free.collector_region = None;
        free.mutator_region = self
            .regions
            .iter()
            .filter(|r| r.state() == RegionState::Regular && r.free() > 0)
            .max_by_key(|r| (r.free(), std::cmp::Reverse(r.id())))
            .map(Region::id);
        free.empty = self
            .regions
            .iter()
            .filter(|r| r.state() == RegionState::Empty)
            .map(|r| r.id().0)
            .collect();
    }
}

/// Iterator over regions that may hold live objects.
#[derive(Clone)]
pub struct LiveRegions<'a> {
    regions: &'a [Region],
    next: usize,
}

impl Iterator for LiveRegions<'_> {
    type Item = RegionId;

    fn next(&mut self) -> Option<RegionId> {
        while let Some(region) = self.regions.get(self.next) {
            self.next += 1;
            if region.state().is_active() {
                return Some(region.id());
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.regions.len() - self.next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectKind;

    const SIZE: usize = 1024;

    #[test]
    fn test_allocate_region_lowest_first() {
        let dir = RegionDirectory::new(4, SIZE);
        assert_eq!(dir.allocate_region().unwrap(), RegionId(0));
        assert_eq!(dir.allocate_collector_region().unwrap(), RegionId(3));
        assert_eq!(dir.allocate_region().unwrap(), RegionId(1));
        assert_eq!(dir.region_state(RegionId(1)), Some(RegionState::Regular));
        assert_eq!(dir.free_regions(), 1);
    }

    #[test]
    fn test_exhaustion() {
        let dir = RegionDirectory::new(2, SIZE);
        dir.allocate_region().unwrap();
        dir.allocate_region().unwrap();
        assert!(matches!(dir.allocate_region(), Err(GcError::OutOfRegions)));
    }

    #[test]
    fn test_recycle_exactly_once() {
        let dir = RegionDirectory::new(2, SIZE);
        let id = dir.allocate_region().unwrap();
        assert!(dir.recycle(id));
        assert!(!dir.recycle(id));
        assert_eq!(dir.region_state(id), Some(RegionState::Empty));
        assert_eq!(dir.free_regions(), 2);
    }

    #[test]
    fn test_contiguous_allocation() {
        let dir = RegionDirectory::new(6, SIZE);
        let single = dir.allocate_region().unwrap();
        let _ = dir.allocate_region().unwrap();
        dir.recycle(single);

        // Region 0 is free but not adjacent to a run of three.
        let start = dir.allocate_contiguous(3, 2 * SIZE + 100).unwrap();
        assert_eq!(start, RegionId(2));
        assert_eq!(dir.region_state(RegionId(2)), Some(RegionState::HumongousStart));
        assert_eq!(
            dir.region_state(RegionId(4)),
            Some(RegionState::HumongousContinuation)
        );
        assert_eq!(dir.used_bytes(), 2 * SIZE + 100);
        assert!(matches!(
            dir.allocate_contiguous(3, 3 * SIZE),
            Err(GcError::OutOfRegions)
        ));
    }

    #[test]
    fn test_iterate_live_regions_restartable() {
        let dir = RegionDirectory::new(5, SIZE);
        dir.allocate_region().unwrap();
        dir.allocate_collector_region().unwrap();

        let iter = dir.iterate_live_regions();
        let first: Vec<_> = iter.clone().collect();
        let second: Vec<_> = iter.collect();
        assert_eq!(first, vec![RegionId(0), RegionId(4)]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_tlab_and_shared_allocation() {
        let dir = RegionDirectory::new(3, SIZE);
        let (r, start, len) = dir.mutator_allocate_tlab(64, 512).unwrap();
        assert_eq!((r, start, len), (RegionId(0), 0, 512));

        let (r, off) = dir.mutator_allocate(256).unwrap();
        assert_eq!((r, off), (RegionId(0), 512));

        // Only 256 bytes left: the TLAB is trimmed to what remains.
        let (r, start, len) = dir.mutator_allocate_tlab(64, 512).unwrap();
        assert_eq!((r, start, len), (RegionId(0), 768, 256));

        let (r, off) = dir.mutator_allocate(128).unwrap();
        assert_eq!((r, off), (RegionId(1), 0));

        let (r, off) = dir.collector_allocate(64).unwrap();
        assert_eq!((r, off), (RegionId(2), 0));
    }

    #[test]
    fn test_used_bytes_tracks_objects() {
        let dir = RegionDirectory::new(2, SIZE);
        let (r, off) = dir.mutator_allocate(48).unwrap();
        dir.region(r)
            .unwrap()
            .install(off, HeapObject::new(48, ObjectKind::Plain, 1));
        assert_eq!(dir.used_bytes(), 48);
        dir.recycle(r);
        assert_eq!(dir.used_bytes(), 0);
    }

    #[test]
    fn test_uncommit_and_recommit() {
        let dir = RegionDirectory::new(3, SIZE);
        assert_eq!(dir.committed_bytes(), 3 * SIZE);
        assert_eq!(dir.uncommit_idle(Duration::ZERO), 3);
        assert_eq!(dir.committed_bytes(), 0);
        dir.allocate_region().unwrap();
        assert_eq!(dir.committed_bytes(), SIZE);
    }
}
