//! GC roots
//!
//! Roots are atomic slots holding an [`ObjRef`]. The collector reads them at
//! init mark and rewrites them when objects move, so every slot a root
//! provider reports must stay valid for as long as it is registered.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::object::ObjRef;

/// A root slot.
pub struct RootSlot(AtomicU64);

impl RootSlot {
    /// Create a slot holding `value`
    pub const fn new(value: ObjRef) -> Self {
        RootSlot(AtomicU64::new(value.to_raw()))
    }

    /// Current value
    #[inline]
    pub fn load(&self) -> ObjRef {
        ObjRef::from_raw(self.0.load(Ordering::Acquire))
    }

    /// Overwrite the value
    #[inline]
    pub fn store(&self, value: ObjRef) {
        self.0.store(value.to_raw(), Ordering::Release);
    }
}

impl Default for RootSlot {
    fn default() -> Self {
        RootSlot::new(ObjRef::NULL)
    }
}

impl std::fmt::Debug for RootSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RootSlot").field(&self.load()).finish()
    }
}

/// Source of root slots, supplied by the embedder (stack walker, globals).
///
/// Values written into provider slots must come from the collector's
/// barriers; the collector updates them when objects move.
pub trait RootProvider: Send + Sync {
    /// Call `visitor` once for every root slot.
    fn visit_roots(&self, visitor: &mut dyn FnMut(&RootSlot));
}

/// Index into a [`RootSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

#[derive(Default)]
struct RootTable {
    slots: Vec<RootSlot>,
    free: Vec<u32>,
}

/// A simple handle table of roots.
///
/// Every mutator owns one; embedders can also register their own.
#[derive(Default)]
pub struct RootSet {
    table: Mutex<RootTable>,
}

impl RootSet {
    /// Create an empty root set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a root and return its handle.
    pub fn insert(&self, value: ObjRef) -> Handle {
        let mut table = self.table.lock();
        if let Some(idx) = table.free.pop() {
            table.slots[idx as usize].store(value);
            Handle(idx)
        } else {
            table.slots.push(RootSlot::new(value));
            Handle(table.slots.len() as u32 - 1)
        }
    }

    /// Current value of a root.
    pub fn get(&self, handle: Handle) -> ObjRef {
        self.table
            .lock()
            .slots
            .get(handle.0 as usize)
            .map_or(ObjRef::NULL, RootSlot::load)
    }

    /// Overwrite a root.
    pub fn set(&self, handle: Handle, value: ObjRef) {
        if let Some(slot) = self.table.lock().slots.get(handle.0 as usize) {
            slot.store(value);
        }
    }

    /// Drop a root. The handle must not be used afterwards.
    pub fn remove(&self, handle: Handle) {
        let mut table = self.table.lock();
        if let Some(slot) = table.slots.get(handle.0 as usize) {
            slot.store(ObjRef::NULL);
            table.free.push(handle.0);
        }
    }

    /// Number of live handles
    pub fn len(&self) -> usize {
        let table = self.table.lock();
        table.slots.len() - table.free.len()
    }

    /// Whether the set holds no handles
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every root.
    pub fn clear(&self) {
        let mut table = self.table.lock();
        table.slots.clear();
        table.free.clear();
    }
}

impl RootProvider for RootSet {
    fn visit_roots(&self, visitor: &mut dyn FnMut(&RootSlot)) {
        let table = self.table.lock();
        for slot in &table.slots {
            if !slot.load().is_null() {
                visitor(slot);
            }
        }
    }
}
