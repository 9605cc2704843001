//! Heap regions
//!
//! The heap is split into fixed-size regions. A region owns an ordered table
//! of the objects allocated in it, a mark bitmap with one bit per 8-byte
//! granule, and the per-cycle marking metadata (TAMS and live bytes).
//!
//! ## Accounting
//!
//! - `top`: bump pointer, includes space reserved by TLABs that is not yet used
//! - `used`: exact sum of the sizes of objects installed in the region
//! - `live`: bytes proven live by the current (or last) marking
//! - `tams`: top-at-mark-start; objects at or above it are implicitly live

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::object::{HeapObject, OBJECT_ALIGNMENT, ObjRef};

/// Index of a region in the region directory.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RegionId(pub u32);

impl RegionId {
    /// Region index as `usize`
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Region state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegionState {
    /// In the free set, holds nothing
    Empty = 0,
    /// Holds regular objects
    Regular = 1,
    /// First region of a humongous object
    HumongousStart = 2,
    /// Tail region of a humongous object
    HumongousContinuation = 3,
    /// Regular region pinned in place; never evacuated
    Pinned = 4,
    /// Selected for evacuation in the current cycle
    Cset = 5,
    /// Evacuated and awaiting recycling
    Trash = 6,
}

impl From<u8> for RegionState {
    fn from(v: u8) -> Self {
        match v {
            1 => RegionState::Regular,
            2 => RegionState::HumongousStart,
            3 => RegionState::HumongousContinuation,
            4 => RegionState::Pinned,
            5 => RegionState::Cset,
            6 => RegionState::Trash,
            _ => RegionState::Empty,
        }
    }
}

impl RegionState {
    /// Region holds objects that may be reachable
    #[inline]
    pub fn is_active(self) -> bool {
        !matches!(self, RegionState::Empty | RegionState::Trash)
    }

    /// Region is part of a humongous object
    #[inline]
    pub fn is_humongous(self) -> bool {
        matches!(
            self,
            RegionState::HumongousStart | RegionState::HumongousContinuation
        )
    }
}

/// One mark bit per allocation granule.
pub(crate) struct MarkBitmap {
    words: Box<[AtomicU64]>,
}

impl MarkBitmap {
    pub(crate) fn new(region_size: usize) -> Self {
        let bits = region_size / OBJECT_ALIGNMENT;
        let words = (0..bits.div_ceil(64)).map(|_| AtomicU64::new(0)).collect();
        Self { words }
    }

    #[inline]
    fn locate(offset: usize) -> (usize, u64) {
        let bit = offset / OBJECT_ALIGNMENT;
        (bit / 64, 1u64 << (bit % 64))
    }

    /// Set the bit for `offset`. Returns true if this call set it.
    #[inline]
    pub(crate) fn mark(&self, offset: usize) -> bool {
        let (word, mask) = Self::locate(offset);
        self.words[word].fetch_or(mask, Ordering::AcqRel) & mask == 0
    }

    #[inline]
    pub(crate) fn is_marked(&self, offset: usize) -> bool {
        let (word, mask) = Self::locate(offset);
        self.words[word].load(Ordering::Acquire) & mask != 0
    }

    /// Clear every bit covering `[0, limit)`.
    pub(crate) fn clear_below(&self, limit: usize) {
        let bits = limit.div_ceil(OBJECT_ALIGNMENT);
        let words = bits.div_ceil(64).min(self.words.len());
        for w in &self.words[..words] {
            w.store(0, Ordering::Relaxed);
        }
    }
}

/// A fixed-size heap region.
pub struct Region {
    id: RegionId,
    size: usize,
    state: AtomicU8,
    top: AtomicUsize,
    used: AtomicUsize,
    live: AtomicUsize,
    tams: AtomicUsize,
    pins: AtomicUsize,
    /// Number of regions spanned, set on humongous start regions
    humongous_span: AtomicUsize,
    committed: AtomicBool,
    /// Set when an object in this cset region had to be self-forwarded
    evac_failed: AtomicBool,
    empty_since: Mutex<Option<Instant>>,
    bitmap: MarkBitmap,
    objects: RwLock<BTreeMap<u32, Arc<HeapObject>>>,
}

impl Region {
    pub(crate) fn new(id: RegionId, size: usize) -> Self {
        Self {
            id,
            size,
            state: AtomicU8::new(RegionState::Empty as u8),
            top: AtomicUsize::new(0),
            used: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            tams: AtomicUsize::new(0),
            pins: AtomicUsize::new(0),
            humongous_span: AtomicUsize::new(0),
            committed: AtomicBool::new(true),
            evac_failed: AtomicBool::new(false),
            empty_since: Mutex::new(Some(Instant::now())),
            bitmap: MarkBitmap::new(size),
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    /// Region id
    #[inline]
    pub fn id(&self) -> RegionId {
        self.id
    }

    /// Region size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current state
    #[inline]
    pub fn state(&self) -> RegionState {
        RegionState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: RegionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Bump pointer (bytes reserved so far)
    #[inline]
    pub fn top(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    /// Bytes occupied by installed objects
    #[inline]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Live bytes from the most recent marking
    #[inline]
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Top-at-mark-start
    #[inline]
    pub fn tams(&self) -> usize {
        self.tams.load(Ordering::Acquire)
    }

    /// Bytes left above the bump pointer
    #[inline]
    pub fn free(&self) -> usize {
        self.size - self.top()
    }

    /// Whether any pin is held on this region
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }

    /// Whether the region's backing memory is committed
    #[inline]
    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn humongous_span(&self) -> usize {
        self.humongous_span.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn evac_failed(&self) -> bool {
        self.evac_failed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_evac_failed(&self) {
        self.evac_failed.store(true, Ordering::Release);
    }

    /// Reserve `size` bytes at the bump pointer.
    pub(crate) fn bump(&self, size: usize) -> Option<usize> {
        let mut top = self.top.load(Ordering::Acquire);
        loop {
            if top + size > self.size {
                return None;
            }
            match self.top.compare_exchange_weak(
                top,
                top + size,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(top),
                Err(actual) => top = actual,
            }
        }
    }

    /// Install an object at `offset` and account its size.
    pub(crate) fn install(&self, offset: usize, object: HeapObject) -> ObjRef {
        self.used.fetch_add(object.size(), Ordering::AcqRel);
        self.objects.write().insert(offset as u32, Arc::new(object));
        ObjRef::new(self.id, offset as u32)
    }

    /// Remove the object at `offset`, giving back its accounted bytes.
    pub(crate) fn retract(&self, offset: u32) -> Option<Arc<HeapObject>> {
        let removed = self.objects.write().remove(&offset);
        if let Some(obj) = &removed {
            self.used.fetch_sub(obj.size(), Ordering::AcqRel);
        }
        removed
    }

    /// Look up the object at `offset`.
    #[inline]
    pub(crate) fn object(&self, offset: u32) -> Option<Arc<HeapObject>> {
        self.objects.read().get(&offset).cloned()
    }

    /// Ordered copy of the object table.
    pub(crate) fn objects(&self) -> Vec<(u32, Arc<HeapObject>)> {
        self.objects
            .read()
            .iter()
            .map(|(off, obj)| (*off, obj.clone()))
            .collect()
    }

    pub(crate) fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    /// Prepare for a new marking: clear marks below top and set TAMS.
    pub(crate) fn reset_marking(&self) {
        let top = self.top();
        self.bitmap.clear_below(top);
        self.tams.store(top, Ordering::Release);
        self.live.store(0, Ordering::Release);
        self.evac_failed.store(false, Ordering::Release);
    }

    /// Mark the object at `offset`. Returns true if this call marked it.
    ///
    /// Objects at or above TAMS are implicitly live and are never marked.
    #[inline]
    pub(crate) fn mark(&self, offset: u32, size: usize) -> bool {
        let offset = offset as usize;
        if offset >= self.tams() {
            return false;
        }
        if self.bitmap.mark(offset) {
            self.live.fetch_add(size, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    /// Whether the object at `offset` is live for the current marking.
    #[inline]
    pub(crate) fn is_live(&self, offset: u32) -> bool {
        let offset = offset as usize;
        offset >= self.tams() || self.bitmap.is_marked(offset)
    }

    /// Whether the object at `offset` was explicitly marked.
    #[inline]
    pub(crate) fn is_marked(&self, offset: u32) -> bool {
        self.bitmap.is_marked(offset as usize)
    }

    /// Fold the bytes allocated above TAMS into `live`.
    ///
    /// Called in the final mark pause, when allocation is stopped.
    pub(crate) fn finalize_live(&self) -> usize {
        let tams = self.tams() as u32;
        let above: usize = self
            .objects
            .read()
            .range(tams..)
            .map(|(_, obj)| obj.size())
            .sum();
        self.live.fetch_add(above, Ordering::AcqRel) + above
    }

    /// Set the humongous bookkeeping for one region of a humongous span.
    ///
    /// `used` is this region's share of the object size.
    pub(crate) fn make_humongous(&self, state: RegionState, span: usize, used: usize) {
        self.set_state(state);
        self.humongous_span.store(span, Ordering::Release);
        self.top.store(self.size, Ordering::Release);
        self.tams.store(0, Ordering::Release);
        self.used.store(used, Ordering::Release);
    }

    /// Reset the region for reuse. Objects still in the table are dropped.
    pub(crate) fn recycle(&self) {
        let top = self.top();
        self.objects.write().clear();
        self.bitmap.clear_below(top);
        self.top.store(0, Ordering::Release);
        self.used.store(0, Ordering::Release);
        self.live.store(0, Ordering::Release);
        self.tams.store(0, Ordering::Release);
        self.pins.store(0, Ordering::Release);
        self.humongous_span.store(0, Ordering::Release);
        self.evac_failed.store(false, Ordering::Release);
        *self.empty_since.lock() = Some(Instant::now());
        self.set_state(RegionState::Empty);
    }

    /// Leave the empty pool.
    pub(crate) fn activate(&self, state: RegionState) {
        *self.empty_since.lock() = None;
        self.committed.store(true, Ordering::Release);
        self.set_state(state);
    }

    /// Uncommit if the region has been empty since before `deadline`.
    pub(crate) fn try_uncommit(&self, deadline: Instant) -> bool {
        let since = *self.empty_since.lock();
        match since {
            Some(t) if t <= deadline && self.is_committed() => {
                self.committed.store(false, Ordering::Release);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn pin(&self) -> usize {
        let prev = self.pins.fetch_add(1, Ordering::AcqRel);
        if prev == 0 && self.state() == RegionState::Regular {
            self.set_state(RegionState::Pinned);
        }
        prev + 1
    }

    pub(crate) fn unpin(&self) -> usize {
        let prev = self.pins.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 && self.state() == RegionState::Pinned {
            self.set_state(RegionState::Regular);
        }
        prev.saturating_sub(1)
    }

    /// Restore a cset region whose evacuation failed.
    ///
    /// Objects that were copied elsewhere, and dead objects, are dropped.
    /// Self-forwarded objects stay in place and lose their forwarding.
    /// Returns the bytes released.
    pub(crate) fn restore_after_failed_evacuation(&self) -> usize {
        let self_ref = |off: u32| ObjRef::new(self.id, off);
        let mut released = 0;
        let mut objects = self.objects.write();
        objects.retain(|off, obj| match obj.forwardee() {
            Some(fwd) if fwd == self_ref(*off) => {
                obj.clear_forwardee();
                true
            }
            _ => {
                released += obj.size();
                false
            }
        });
        drop(objects);
        self.used.fetch_sub(released, Ordering::AcqRel);
        self.live.store(self.used(), Ordering::Release);
        self.tams.store(0, Ordering::Release);
        self.evac_failed.store(false, Ordering::Release);
        if self.is_pinned() {
            self.set_state(RegionState::Pinned);
        } else {
            self.set_state(RegionState::Regular);
        }
        released
    }

    /// Move every object out of the table (full GC compaction).
    pub(crate) fn take_objects(&self) -> BTreeMap<u32, Arc<HeapObject>> {
        std::mem::take(&mut *self.objects.write())
    }

    /// Put an object back during compaction without touching accounting.
    pub(crate) fn put_object(&self, offset: u32, object: Arc<HeapObject>) {
        self.objects.write().insert(offset, object);
    }

    /// Overwrite the accounting after compaction.
    pub(crate) fn reset_layout(&self, state: RegionState, top: usize, used: usize, span: usize) {
        let old_top = self.top();
        self.bitmap.clear_below(old_top.max(top));
        self.top.store(top, Ordering::Release);
        self.used.store(used, Ordering::Release);
        self.live.store(used, Ordering::Release);
        self.tams.store(0, Ordering::Release);
        self.humongous_span.store(span, Ordering::Release);
        self.evac_failed.store(false, Ordering::Release);
        let state = if state == RegionState::Regular && self.is_pinned() {
            RegionState::Pinned
        } else {
            state
        };
        if state == RegionState::Empty {
            *self.empty_since.lock() = Some(Instant::now());
        } else {
            *self.empty_since.lock() = None;
        }
        self.set_state(state);
    }

    /// Read-only occupancy sample
    pub fn sample(&self) -> RegionSample {
        RegionSample {
            id: self.id,
            state: self.state(),
            used: self.used(),
            live: self.live(),
            top: self.top(),
            objects: self.object_count(),
            pinned: self.is_pinned(),
            committed: self.is_committed(),
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("top", &self.top())
            .field("used", &self.used())
            .field("live", &self.live())
            .field("tams", &self.tams())
            .finish()
    }
}

/// Read-only view of a region, used for region sampling.
#[derive(Debug, Clone, Serialize)]
pub struct RegionSample {
    /// Region id
    pub id: RegionId,
    /// State at sampling time
    pub state: RegionState,
    /// Bytes occupied by objects
    pub used: usize,
    /// Live bytes from the last marking
    pub live: usize,
    /// Bump pointer
    pub top: usize,
    /// Number of objects in the region
    pub objects: usize,
    /// Pinned in place
    pub pinned: bool,
    /// Backing memory committed
    pub committed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectKind;

    const SIZE: usize = 4096;

    #[test]
    fn test_region_state_roundtrip() {
        for state in [
            RegionState::Empty,
            RegionState::Regular,
            RegionState::HumongousStart,
            RegionState::HumongousContinuation,
            RegionState::Pinned,
            RegionState::Cset,
            RegionState::Trash,
        ] {
            assert_eq!(RegionState::from(state as u8), state);
        }
        assert_eq!(RegionState::from(200), RegionState::Empty);
    }

    #[test]
    fn test_bitmap() {
        let bitmap = MarkBitmap::new(SIZE);
        assert!(bitmap.mark(64));
        assert!(!bitmap.mark(64));
        assert!(bitmap.is_marked(64));
        assert!(!bitmap.is_marked(72));
        bitmap.clear_below(128);
        assert!(!bitmap.is_marked(64));
    }

    #[test]
    fn test_bump_and_install() {
        let region = Region::new(RegionId(0), SIZE);
        let a = region.bump(64).unwrap();
        let b = region.bump(32).unwrap();
        assert_eq!((a, b), (0, 64));
        assert!(region.bump(SIZE).is_none());

        let r = region.install(a, HeapObject::new(64, ObjectKind::Plain, 2));
        assert_eq!(r, ObjRef::new(RegionId(0), 0));
        assert_eq!(region.used(), 64);
        assert_eq!(region.top(), 96);

        assert!(region.retract(0).is_some());
        assert_eq!(region.used(), 0);
        assert!(region.object(0).is_none());
    }

    #[test]
    fn test_marking_respects_tams() {
        let region = Region::new(RegionId(0), SIZE);
        let off = region.bump(32).unwrap();
        region.install(off, HeapObject::new(32, ObjectKind::Plain, 0));
        region.reset_marking();
        assert_eq!(region.tams(), 32);

        let late = region.bump(48).unwrap();
        region.install(late, HeapObject::new(48, ObjectKind::Plain, 0));

        assert!(!region.is_live(off as u32));
        assert!(region.is_live(late as u32));
        assert!(!region.mark(late as u32, 48));

        assert!(region.mark(off as u32, 32));
        assert!(!region.mark(off as u32, 32));
        assert_eq!(region.live(), 32);
        assert_eq!(region.finalize_live(), 80);
    }

    #[test]
    fn test_recycle_clears_everything() {
        let region = Region::new(RegionId(3), SIZE);
        region.activate(RegionState::Regular);
        let off = region.bump(32).unwrap();
        region.install(off, HeapObject::new(32, ObjectKind::Plain, 0));
        region.reset_marking();
        region.mark(off as u32, 32);

        region.recycle();
        assert_eq!(region.state(), RegionState::Empty);
        assert_eq!(region.top(), 0);
        assert_eq!(region.used(), 0);
        assert_eq!(region.object_count(), 0);
        assert!(!region.is_marked(off as u32));
    }

    #[test]
    fn test_pinning_changes_state() {
        let region = Region::new(RegionId(1), SIZE);
        region.activate(RegionState::Regular);
        region.pin();
        region.pin();
        assert_eq!(region.state(), RegionState::Pinned);
        region.unpin();
        assert_eq!(region.state(), RegionState::Pinned);
        region.unpin();
        assert_eq!(region.state(), RegionState::Regular);
    }

    #[test]
    fn test_restore_after_failed_evacuation() {
        let region = Region::new(RegionId(2), SIZE);
        region.activate(RegionState::Cset);
        let kept = region.bump(32).unwrap() as u32;
        region.install(kept as usize, HeapObject::new(32, ObjectKind::Plain, 0));
        let moved = region.bump(32).unwrap() as u32;
        region.install(moved as usize, HeapObject::new(32, ObjectKind::Plain, 0));

        let kept_obj = region.object(kept).unwrap();
        kept_obj
            .try_forward(ObjRef::new(RegionId(2), kept))
            .unwrap();
        region
            .object(moved)
            .unwrap()
            .try_forward(ObjRef::new(RegionId(9), 0))
            .unwrap();

        let released = region.restore_after_failed_evacuation();
        assert_eq!(released, 32);
        assert_eq!(region.used(), 32);
        assert_eq!(region.state(), RegionState::Regular);
        assert_eq!(kept_obj.forwardee(), None);
        assert!(region.object(moved).is_none());
    }

    #[test]
    fn test_uncommit_only_after_delay() {
        let region = Region::new(RegionId(0), SIZE);
        let before = Instant::now() - std::time::Duration::from_secs(60);
        assert!(!region.try_uncommit(before));
        assert!(region.try_uncommit(Instant::now()));
        assert!(!region.is_committed());
        region.activate(RegionState::Regular);
        assert!(region.is_committed());
    }
}
