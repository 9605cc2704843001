//! Mutator threads
//!
//! A [`Mutator`] is a thread's handle on the heap. Every operation runs
//! inside the safepoint's shared guard, so collector pauses only ever
//! observe a mutator between operations.
//!
//! ## Rooting
//!
//! An `ObjRef` held outside the heap is only guaranteed valid until the next
//! pause. References that must survive a collection belong in the mutator's
//! [`RootSet`] (or a registered [`RootProvider`](crate::RootProvider)) and
//! should be read back from there afterwards. Several operations can be made
//! atomic with respect to collections through [`Mutator::enter`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLockReadGuard};

use crate::allocator::Tlab;
use crate::barrier::WriteBarrierBuffer;
use crate::config::HeapConfig;
use crate::error::{GcError, GcResult};
use crate::heap::Heap;
use crate::object::{ObjRef, ObjectKind, min_object_size};
use crate::reference::{QueueId, RefKind};
use crate::roots::{Handle, RootSet};

/// Mutator state the collector can reach.
pub(crate) struct MutatorShared {
    pub(crate) id: usize,
    pub(crate) tlab: Mutex<Tlab>,
    pub(crate) barrier: WriteBarrierBuffer,
    pub(crate) roots: RootSet,
}

impl MutatorShared {
    pub(crate) fn new(id: usize, config: &HeapConfig) -> Self {
        Self {
            id,
            tlab: Mutex::new(Tlab::new(config)),
            barrier: WriteBarrierBuffer::new(),
            roots: RootSet::new(),
        }
    }
}

/// A thread's handle on the heap.
pub struct Mutator {
    heap: Arc<Heap>,
    shared: Arc<MutatorShared>,
}

impl Mutator {
    pub(crate) fn new(heap: Arc<Heap>, shared: Arc<MutatorShared>) -> Self {
        Self { heap, shared }
    }

    /// The heap this mutator allocates in
    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// Mutator id
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// This mutator's roots
    pub fn roots(&self) -> &RootSet {
        &self.shared.roots
    }

    /// Begin an operation that no pause can interrupt.
    ///
    /// The scope must be dropped before this thread allocates through
    /// [`alloc`](Self::alloc) or collects, or it deadlocks.
    pub fn enter(&self) -> MutatorScope<'_> {
        MutatorScope {
            mutator: self,
            _guard: self.heap.safepoint.enter(),
        }
    }

    /// Allocate a plain object, collecting if the heap is full.
    pub fn alloc(&self, size: usize, ref_fields: usize) -> GcResult<ObjRef> {
        self.allocate(size, ref_fields, |scope| {
            scope.try_alloc_kind(size, ObjectKind::Plain, ref_fields)
        })
    }

    /// Allocate a plain object and root it in the same operation.
    pub fn alloc_rooted(&self, size: usize, ref_fields: usize) -> GcResult<Handle> {
        self.allocate(size, ref_fields, |scope| {
            let r = scope.try_alloc_kind(size, ObjectKind::Plain, ref_fields)?;
            Ok(scope.root(r))
        })
    }

    /// Allocate a soft, weak or phantom reference to `referent`.
    pub fn alloc_reference(
        &self,
        kind: RefKind,
        referent: ObjRef,
        queue: Option<QueueId>,
    ) -> GcResult<ObjRef> {
        if let Some(id) = queue {
            self.heap.reference_queue(id)?;
        }
        let size = min_object_size(1);
        let object_kind = ObjectKind::Reference { kind, queue };
        self.allocate(size, 1, |scope| {
            let referent = scope.load_barrier(referent);
            if !referent.is_null() && scope.heap().directory.object(referent).is_none() {
                return Err(GcError::InvalidReference(referent));
            }
            let r = scope.try_alloc_kind(size, object_kind, 1)?;
            scope.init_referent(r, referent);
            Ok(r)
        })
    }

    fn allocate<T>(
        &self,
        size: usize,
        ref_fields: usize,
        mut attempt_fn: impl FnMut(&MutatorScope<'_>) -> GcResult<T>,
    ) -> GcResult<T> {
        let aligned = self.heap.check_allocation(size, ref_fields)?;
        let mut attempt = 0;
        loop {
            let result = {
                let scope = self.enter();
                if attempt == 0 && self.heap.faults.should_fail_alloc() {
                    tracing::trace!(target: "shoal::gc", size = aligned, "Injected allocation failure");
                    Err(GcError::AllocationFailure { size: aligned })
                } else {
                    attempt_fn(&scope)
                }
            };
            match result {
                Ok(r) => return Ok(r),
                Err(GcError::AllocationFailure { .. } | GcError::OutOfRegions) => {
                    self.heap.collect_for_allocation(aligned, attempt)?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Load reference field `field` of `obj`.
    pub fn load_field(&self, obj: ObjRef, field: usize) -> GcResult<ObjRef> {
        self.enter().load_field(obj, field)
    }

    /// Store `value` into reference field `field` of `obj`.
    pub fn store_field(&self, obj: ObjRef, field: usize, value: ObjRef) -> GcResult<()> {
        self.enter().store_field(obj, field, value)
    }

    /// Read an object's data word.
    pub fn load_data(&self, obj: ObjRef) -> GcResult<u64> {
        self.enter().load_data(obj)
    }

    /// Write an object's data word.
    pub fn store_data(&self, obj: ObjRef, value: u64) -> GcResult<()> {
        self.enter().store_data(obj, value)
    }

    /// Referent of a reference object, or null once cleared.
    pub fn reference_get(&self, r: ObjRef) -> GcResult<ObjRef> {
        self.enter().reference_get(r)
    }

    /// Clear a reference without enqueueing it.
    pub fn reference_clear(&self, r: ObjRef) -> GcResult<()> {
        self.enter().reference_clear(r)
    }

    /// Current address of the object `r` names.
    pub fn resolve(&self, r: ObjRef) -> ObjRef {
        self.enter().load_barrier(r)
    }

    /// Pin the object's region so it is never evacuated or compacted.
    pub fn pin(&self, r: ObjRef) -> GcResult<ObjRef> {
        self.enter().pin(r)
    }

    /// Release a pin taken with [`pin`](Self::pin).
    pub fn unpin(&self, r: ObjRef) -> GcResult<()> {
        self.enter().unpin(r)
    }

    /// Take the oldest cleared reference from a queue, if any.
    pub fn poll_reference_queue(&self, id: QueueId) -> GcResult<Option<ObjRef>> {
        let queue = self.heap.reference_queue(id)?;
        let scope = self.enter();
        Ok(queue.pop().map(|r| scope.load_barrier(r)))
    }

    /// Wait up to `timeout` for a cleared reference.
    pub fn remove_reference_queue(
        &self,
        id: QueueId,
        timeout: Duration,
    ) -> GcResult<Option<ObjRef>> {
        let queue = self.heap.reference_queue(id)?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(r) = self.poll_reference_queue(id)? {
                return Ok(Some(r));
            }
            if !queue.wait_until(deadline) {
                return Ok(None);
            }
        }
    }

    /// Give back the rest of this mutator's TLAB.
    pub fn retire_tlab(&self) {
        let _scope = self.enter();
        self.shared.tlab.lock().retire();
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        let _guard = self.heap.safepoint.enter();
        self.shared.tlab.lock().retire();
        let pending = self.shared.barrier.drain();
        if self.heap.gc_state.is_marking() {
            self.heap.marking.push_all(pending);
        }
        self.heap.mutators.lock().remove(&self.shared.id);
    }
}

/// A mutator operation in progress. No pause begins while it is alive.
pub struct MutatorScope<'a> {
    mutator: &'a Mutator,
    _guard: RwLockReadGuard<'a, ()>,
}

impl MutatorScope<'_> {
    fn heap(&self) -> &Heap {
        &self.mutator.heap
    }

    /// Allocate without collecting. Fails with
    /// [`GcError::AllocationFailure`] when the heap is full.
    pub fn try_alloc(&self, size: usize, ref_fields: usize) -> GcResult<ObjRef> {
        let aligned = self.heap().check_allocation(size, ref_fields)?;
        self.try_alloc_kind(aligned, ObjectKind::Plain, ref_fields)
    }

    fn try_alloc_kind(&self, size: usize, kind: ObjectKind, ref_fields: usize) -> GcResult<ObjRef> {
        let size = crate::object::align_size(size);
        let mut tlab = self.mutator.shared.tlab.lock();
        self.heap()
            .try_allocate(&mut tlab, size, kind, ref_fields)
            .map_err(|e| match e {
                GcError::OutOfRegions => GcError::AllocationFailure { size },
                other => other,
            })
    }

    fn init_referent(&self, r: ObjRef, referent: ObjRef) {
        if let Some(obj) = self.heap().directory.object(r) {
            obj.store_field(0, referent);
        }
        if self.heap().gc_state.is_marking() {
            self.heap()
                .enqueue_for_marking(&self.mutator.shared.barrier, referent);
        }
    }

    /// Add `r` to the mutator's roots.
    pub fn root(&self, r: ObjRef) -> Handle {
        self.mutator.shared.roots.insert(self.load_barrier(r))
    }

    /// Resolve `r` through the load barrier.
    pub fn load_barrier(&self, r: ObjRef) -> ObjRef {
        self.heap().load_barrier(r)
    }

    /// Load reference field `field` of `obj`.
    pub fn load_field(&self, obj: ObjRef, field: usize) -> GcResult<ObjRef> {
        self.heap().load_field_barrier(obj, field)
    }

    /// Store `value` into reference field `field` of `obj`.
    pub fn store_field(&self, obj: ObjRef, field: usize, value: ObjRef) -> GcResult<()> {
        self.heap()
            .store_barrier(&self.mutator.shared.barrier, obj, field, value)
    }

    /// Read an object's data word.
    pub fn load_data(&self, obj: ObjRef) -> GcResult<u64> {
        let obj = self.load_barrier(obj);
        let target = self
            .heap()
            .directory
            .object(obj)
            .ok_or(GcError::InvalidReference(obj))?;
        Ok(target.data())
    }

    /// Write an object's data word.
    pub fn store_data(&self, obj: ObjRef, value: u64) -> GcResult<()> {
        let obj = self.load_barrier(obj);
        let target = self
            .heap()
            .directory
            .object(obj)
            .ok_or(GcError::InvalidReference(obj))?;
        target.set_data(value);
        Ok(())
    }

    /// Referent of a reference object.
    pub fn reference_get(&self, r: ObjRef) -> GcResult<ObjRef> {
        self.heap()
            .reference_get_barrier(&self.mutator.shared.barrier, r)
    }

    /// Clear a reference without enqueueing it.
    pub fn reference_clear(&self, r: ObjRef) -> GcResult<()> {
        self.heap().reference_clear(r)
    }

    /// Pin the object's region. Returns the object's pinned address.
    pub fn pin(&self, r: ObjRef) -> GcResult<ObjRef> {
        let r = self.load_barrier(r);
        let region = self
            .heap()
            .directory
            .region(r.region())
            .filter(|region| region.object(r.offset()).is_some())
            .ok_or(GcError::InvalidReference(r))?;
        region.pin();
        Ok(r)
    }

    /// Release a pin.
    pub fn unpin(&self, r: ObjRef) -> GcResult<()> {
        let r = self.load_barrier(r);
        let region = self
            .heap()
            .directory
            .region(r.region())
            .filter(|region| region.is_pinned())
            .ok_or(GcError::InvalidReference(r))?;
        region.unpin();
        Ok(())
    }
}
