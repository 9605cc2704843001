//! Load and store barriers
//!
//! Every reference load and store made by a mutator goes through here.
//!
//! - **Load barrier**: once the heap has forwarded objects, a reference into
//!   a collection-set region is resolved through the object's forwarding
//!   slot. During evacuation a mutator that finds an unforwarded cset object
//!   copies it itself.
//! - **Store barrier**: the target object and the stored value are both
//!   resolved to to-space before the write. While marking, the overwritten
//!   value (SATB) or the new value (incremental update) is reported to the
//!   marker through a per-mutator buffer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::MarkingMode;
use crate::error::{GcError, GcResult};
use crate::heap::Heap;
use crate::object::{HeapObject, ObjRef, ObjectKind};
use crate::region::RegionState;

/// Global GC state flags read by the barriers.
///
/// Flags only change inside pauses, so a mutator sees one consistent value
/// for the whole of an operation.
pub(crate) struct GcState(AtomicU8);

impl GcState {
    pub(crate) const MARKING: u8 = 1;
    pub(crate) const EVACUATION: u8 = 2;
    pub(crate) const UPDATE_REFS: u8 = 4;
    pub(crate) const HAS_FORWARDED: u8 = 8;

    pub(crate) fn new() -> Self {
        GcState(AtomicU8::new(0))
    }

    #[inline]
    pub(crate) fn load(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set(&self, flags: u8) {
        self.0.store(flags, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_marking(&self) -> bool {
        self.load() & Self::MARKING != 0
    }

    #[inline]
    pub(crate) fn is_evacuating(&self) -> bool {
        self.load() & Self::EVACUATION != 0
    }

    #[inline]
    pub(crate) fn has_forwarded(&self) -> bool {
        self.load() & Self::HAS_FORWARDED != 0
    }

    pub(crate) fn phase(&self) -> GcPhase {
        let flags = self.load();
        if flags & Self::MARKING != 0 {
            GcPhase::Marking
        } else if flags & Self::EVACUATION != 0 {
            GcPhase::Evacuation
        } else if flags & Self::UPDATE_REFS != 0 {
            GcPhase::UpdateRefs
        } else {
            GcPhase::Idle
        }
    }
}

/// Concurrent phase the heap is in
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GcPhase {
    /// No cycle in progress
    Idle = 0,
    /// Concurrent marking
    Marking = 1,
    /// Concurrent evacuation
    Evacuation = 2,
    /// Concurrent reference updating
    UpdateRefs = 3,
}

impl From<u8> for GcPhase {
    fn from(v: u8) -> Self {
        match v {
            1 => GcPhase::Marking,
            2 => GcPhase::Evacuation,
            3 => GcPhase::UpdateRefs,
            _ => GcPhase::Idle,
        }
    }
}

/// Write barrier buffer for batching marking reports
///
/// Each mutator owns one. When it fills up, it is flushed into the marker's
/// global queue; the final mark pause drains whatever is left.
pub struct WriteBarrierBuffer {
    entries: Mutex<Vec<ObjRef>>,
    max_size: usize,
}

impl WriteBarrierBuffer {
    /// Create a new buffer with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new buffer with specific capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(Vec::with_capacity(capacity)),
            max_size: capacity.max(1),
        }
    }

    /// Add an entry. Returns true if the buffer is now full.
    #[inline]
    pub fn push(&self, obj: ObjRef) -> bool {
        let mut entries = self.entries.lock();
        entries.push(obj);
        entries.len() >= self.max_size
    }

    /// Take every buffered entry
    pub fn drain(&self) -> Vec<ObjRef> {
        std::mem::take(&mut *self.entries.lock())
    }

    /// Number of buffered entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for WriteBarrierBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// Resolve `r` to the current copy of the object it names.
    ///
    /// Must be called from inside a mutator operation or a pause.
    #[inline]
    pub fn load_barrier(&self, r: ObjRef) -> ObjRef {
        if r.is_null() || !self.gc_state.has_forwarded() {
            return r;
        }
        self.resolve_forwarded(r)
    }

    #[cold]
    fn resolve_forwarded(&self, r: ObjRef) -> ObjRef {
        let Some(region) = self.directory.region(r.region()) else {
            return r;
        };
        if region.state() != RegionState::Cset {
            return r;
        }
        let Some(obj) = region.object(r.offset()) else {
            return r;
        };
        if let Some(fwd) = obj.forwardee() {
            return fwd;
        }
        if self.gc_state.is_evacuating() {
            return self.evacuate_object(r, &obj);
        }
        r
    }

    /// Look up a plain object for field access.
    pub(crate) fn plain_object(&self, r: ObjRef) -> GcResult<Arc<HeapObject>> {
        let obj = self
            .directory
            .object(r)
            .ok_or(GcError::InvalidReference(r))?;
        match obj.kind() {
            ObjectKind::Plain => Ok(obj),
            ObjectKind::Reference { .. } => Err(GcError::WrongObjectKind(r)),
        }
    }

    fn check_field(obj: &HeapObject, field: usize) -> GcResult<()> {
        if field < obj.field_count() {
            Ok(())
        } else {
            Err(GcError::FieldOutOfBounds {
                field,
                count: obj.field_count(),
            })
        }
    }

    /// Load a reference field, healing it in place if it held a stale
    /// from-space reference.
    pub(crate) fn load_field_barrier(&self, obj: ObjRef, field: usize) -> GcResult<ObjRef> {
        let obj = self.load_barrier(obj);
        let target = self.plain_object(obj)?;
        Self::check_field(&target, field)?;
        let value = target.load_field(field);
        let resolved = self.load_barrier(value);
        if resolved != value {
            // A failed heal means a mutator stored a newer value.
            target.cas_field(field, value, resolved);
        }
        Ok(resolved)
    }

    /// Store `value` into `field` of `obj`.
    pub(crate) fn store_barrier(
        &self,
        buffer: &WriteBarrierBuffer,
        obj: ObjRef,
        field: usize,
        value: ObjRef,
    ) -> GcResult<()> {
        let obj = self.load_barrier(obj);
        let target = self.plain_object(obj)?;
        Self::check_field(&target, field)?;
        let value = self.load_barrier(value);
        if !value.is_null() && self.directory.object(value).is_none() {
            return Err(GcError::InvalidReference(value));
        }
        let old = target.swap_field(field, value);
        if self.gc_state.is_marking() {
            match self.config.mode {
                MarkingMode::Satb => self.enqueue_for_marking(buffer, old),
                MarkingMode::IncrementalUpdate => self.enqueue_for_marking(buffer, value),
            }
        }
        Ok(())
    }

    /// Report a reference to the marker unless it is already known live.
    pub(crate) fn enqueue_for_marking(&self, buffer: &WriteBarrierBuffer, r: ObjRef) {
        if r.is_null() || !self.needs_marking(r) {
            return;
        }
        if buffer.push(r) {
            self.marking.push_all(buffer.drain());
        }
    }

    #[inline]
    pub(crate) fn needs_marking(&self, r: ObjRef) -> bool {
        self.directory
            .region(r.region())
            .is_some_and(|region| !region.is_live(r.offset()))
    }
}
