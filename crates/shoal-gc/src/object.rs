//! Object references and the heap object layout
//!
//! Objects are never addressed by raw pointers. An [`ObjRef`] packs the
//! region id and the byte offset inside that region, so moving an object is
//! a matter of installing it under a new `(region, offset)` key and recording
//! the new address in the old copy's forwarding slot.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::reference::{QueueId, RefKind};
use crate::region::RegionId;

/// Size of the object header (forwarding slot + kind word).
pub const HEADER_SIZE: usize = 16;

/// Size of one reference field or data word.
pub const WORD_SIZE: usize = 8;

/// Allocation granularity. Every object size is rounded up to this.
pub const OBJECT_ALIGNMENT: usize = 8;

/// Packed `(region, offset)` address of a heap object.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjRef(u64);

impl ObjRef {
    /// The null reference
    pub const NULL: ObjRef = ObjRef(u64::MAX);

    /// Build a reference from a region id and byte offset.
    #[inline]
    pub const fn new(region: RegionId, offset: u32) -> Self {
        ObjRef(((region.0 as u64) << 32) | offset as u64)
    }

    /// Region holding the object
    #[inline]
    pub const fn region(self) -> RegionId {
        RegionId((self.0 >> 32) as u32)
    }

    /// Byte offset of the object inside its region
    #[inline]
    pub const fn offset(self) -> u32 {
        self.0 as u32
    }

    /// Check for the null reference
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == u64::MAX
    }

    /// Convert `NULL` to `None`
    #[inline]
    pub fn non_null(self) -> Option<ObjRef> {
        if self.is_null() { None } else { Some(self) }
    }

    #[inline]
    pub(crate) const fn to_raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub(crate) const fn from_raw(raw: u64) -> Self {
        ObjRef(raw)
    }
}

impl Default for ObjRef {
    fn default() -> Self {
        ObjRef::NULL
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("ObjRef(null)")
        } else {
            write!(f, "ObjRef({}+{:#x})", self.region().0, self.offset())
        }
    }
}

/// What kind of object a heap cell holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// Ordinary object: every reference field is traced strongly
    Plain,
    /// Soft/weak/phantom reference. Field 0 is the referent and is not
    /// traced strongly.
    Reference {
        /// Reference strength
        kind: RefKind,
        /// Queue notified when the referent is cleared
        queue: Option<QueueId>,
    },
}

/// Round a requested size up to the allocation granularity.
#[inline]
pub fn align_size(size: usize) -> usize {
    (size + OBJECT_ALIGNMENT - 1) & !(OBJECT_ALIGNMENT - 1)
}

/// [`align_size`], or `None` if rounding up overflows.
#[inline]
pub fn checked_align_size(size: usize) -> Option<usize> {
    Some(size.checked_add(OBJECT_ALIGNMENT - 1)? & !(OBJECT_ALIGNMENT - 1))
}

/// Smallest legal size for an object with `ref_fields` reference fields.
#[inline]
pub fn min_object_size(ref_fields: usize) -> usize {
    HEADER_SIZE + WORD_SIZE + ref_fields * WORD_SIZE
}

/// [`min_object_size`], or `None` if the field count overflows.
#[inline]
pub fn checked_min_object_size(ref_fields: usize) -> Option<usize> {
    ref_fields
        .checked_mul(WORD_SIZE)?
        .checked_add(HEADER_SIZE + WORD_SIZE)
}

/// A heap object.
///
/// The forwarding slot holds `NULL` until the object is evacuated; it is then
/// written exactly once by CAS with the address of the to-space copy. An
/// object whose evacuation failed forwards to itself.
pub(crate) struct HeapObject {
    size: usize,
    kind: ObjectKind,
    forwardee: AtomicU64,
    data: AtomicU64,
    fields: Box<[AtomicU64]>,
}

impl HeapObject {
    pub(crate) fn new(size: usize, kind: ObjectKind, ref_fields: usize) -> Self {
        let fields = (0..ref_fields)
            .map(|_| AtomicU64::new(ObjRef::NULL.to_raw()))
            .collect();
        Self {
            size,
            kind,
            forwardee: AtomicU64::new(ObjRef::NULL.to_raw()),
            data: AtomicU64::new(0),
            fields,
        }
    }

    /// Fresh copy for evacuation. The copy starts unforwarded.
    pub(crate) fn copy_of(&self) -> Self {
        let fields = self
            .fields
            .iter()
            .map(|f| AtomicU64::new(f.load(Ordering::Acquire)))
            .collect();
        Self {
            size: self.size,
            kind: self.kind,
            forwardee: AtomicU64::new(ObjRef::NULL.to_raw()),
            data: AtomicU64::new(self.data.load(Ordering::Acquire)),
            fields,
        }
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub(crate) fn kind(&self) -> ObjectKind {
        self.kind
    }

    #[inline]
    pub(crate) fn is_reference(&self) -> bool {
        matches!(self.kind, ObjectKind::Reference { .. })
    }

    #[inline]
    pub(crate) fn field_count(&self) -> usize {
        self.fields.len()
    }

    #[inline]
    pub(crate) fn load_field(&self, index: usize) -> ObjRef {
        ObjRef::from_raw(self.fields[index].load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn store_field(&self, index: usize, value: ObjRef) {
        self.fields[index].store(value.to_raw(), Ordering::Release);
    }

    /// Store and return the previous value in one atomic step.
    #[inline]
    pub(crate) fn swap_field(&self, index: usize, value: ObjRef) -> ObjRef {
        ObjRef::from_raw(self.fields[index].swap(value.to_raw(), Ordering::AcqRel))
    }

    /// Replace `expected` with `new`. Fails if a racing store got there first.
    #[inline]
    pub(crate) fn cas_field(&self, index: usize, expected: ObjRef, new: ObjRef) -> bool {
        self.fields[index]
            .compare_exchange(
                expected.to_raw(),
                new.to_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Visit every non-null reference field as `(index, value)`.
    pub(crate) fn for_each_field(&self, mut visit: impl FnMut(usize, ObjRef)) {
        for (i, f) in self.fields.iter().enumerate() {
            let value = ObjRef::from_raw(f.load(Ordering::Acquire));
            if !value.is_null() {
                visit(i, value);
            }
        }
    }

    #[inline]
    pub(crate) fn data(&self) -> u64 {
        self.data.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_data(&self, value: u64) {
        self.data.store(value, Ordering::Release);
    }

    /// Forwarding address, if the object has been forwarded.
    #[inline]
    pub(crate) fn forwardee(&self) -> Option<ObjRef> {
        ObjRef::from_raw(self.forwardee.load(Ordering::Acquire)).non_null()
    }

    /// Install a forwarding address.
    ///
    /// Exactly one caller wins; every loser gets the winner's address back.
    #[inline]
    pub(crate) fn try_forward(&self, to: ObjRef) -> Result<(), ObjRef> {
        self.forwardee
            .compare_exchange(
                ObjRef::NULL.to_raw(),
                to.to_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(ObjRef::from_raw)
    }

    /// Drop a self-forward once the failed region has been restored.
    pub(crate) fn clear_forwardee(&self) {
        self.forwardee
            .store(ObjRef::NULL.to_raw(), Ordering::Release);
    }
}

impl fmt::Debug for HeapObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapObject")
            .field("size", &self.size)
            .field("kind", &self.kind)
            .field("fields", &self.fields.len())
            .field("forwardee", &self.forwardee())
            .finish()
    }
}
