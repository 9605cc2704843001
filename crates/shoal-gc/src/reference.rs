//! Soft, weak and phantom references
//!
//! A reference object keeps its referent in field 0, which marking does not
//! trace. Marking records every reference object it scans; once marking is
//! complete, each recorded reference whose referent was not marked is
//! cleared and, if it has a queue, appended to that queue.
//!
//! Soft referents are traced like strong fields unless the current cycle
//! clears soft references (see [`SoftRefPolicy`]). Phantom references never
//! hand out their referent.
//!
//! Pending queue entries are GC roots: they keep the reference objects
//! alive and are updated when those objects move.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::barrier::WriteBarrierBuffer;
use crate::directory::RegionDirectory;
use crate::error::{GcError, GcResult};
use crate::heap::Heap;
use crate::object::{ObjRef, ObjectKind};
use crate::roots::RootSlot;

/// Reference strength
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefKind {
    /// Cleared only when the cycle clears soft references
    Soft,
    /// Cleared as soon as the referent is not strongly reachable
    Weak,
    /// Like weak, but `get` always returns null
    Phantom,
}

/// When soft references are cleared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SoftRefPolicy {
    /// Every cycle treats soft references as weak
    AlwaysClear,
    /// Soft referents are always kept
    NeverClear,
    /// Cleared by degenerated and full collections and by cycles started
    /// for an allocation failure
    #[default]
    ClearOnPressure,
}

/// Identifies a reference queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct QueueId(pub(crate) u32);

/// Queue of cleared references.
pub struct ReferenceQueue {
    id: QueueId,
    entries: Mutex<VecDeque<RootSlot>>,
    available: Condvar,
}

impl ReferenceQueue {
    fn new(id: QueueId) -> Self {
        Self {
            id,
            entries: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    /// Queue id
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Number of pending references
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no reference is pending
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn enqueue(&self, r: ObjRef) {
        self.entries.lock().push_back(RootSlot::new(r));
        self.available.notify_all();
    }

    /// Pop the oldest entry. The caller must resolve it through the load
    /// barrier before the next pause.
    pub(crate) fn pop(&self) -> Option<ObjRef> {
        self.entries.lock().pop_front().map(|slot| slot.load())
    }

    /// Block until an entry is pending or `deadline` passes.
    pub(crate) fn wait_until(&self, deadline: Instant) -> bool {
        let mut entries = self.entries.lock();
        while entries.is_empty() {
            if self.available.wait_until(&mut entries, deadline).timed_out() {
                return !entries.is_empty();
            }
        }
        true
    }

    fn visit_roots(&self, visitor: &mut dyn FnMut(&RootSlot)) {
        for slot in self.entries.lock().iter() {
            visitor(slot);
        }
    }
}

/// Outcome of one round of reference processing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReferenceStats {
    /// References found by marking
    pub discovered: usize,
    /// Referents cleared
    pub cleared: usize,
    /// References appended to a queue
    pub enqueued: usize,
}

/// Discovers and processes reference objects.
pub(crate) struct ReferenceProcessor {
    discovered: Mutex<FxHashSet<ObjRef>>,
    queues: RwLock<FxHashMap<QueueId, Arc<ReferenceQueue>>>,
    next_queue: AtomicU32,
}

impl ReferenceProcessor {
    pub(crate) fn new() -> Self {
        Self {
            discovered: Mutex::new(FxHashSet::default()),
            queues: RwLock::new(FxHashMap::default()),
            next_queue: AtomicU32::new(0),
        }
    }

    /// Record a reference object found by marking.
    pub(crate) fn discover(&self, r: ObjRef) {
        self.discovered.lock().insert(r);
    }

    pub(crate) fn reset(&self) {
        self.discovered.lock().clear();
    }

    pub(crate) fn create_queue(&self) -> QueueId {
        let id = QueueId(self.next_queue.fetch_add(1, Ordering::Relaxed));
        self.queues
            .write()
            .insert(id, Arc::new(ReferenceQueue::new(id)));
        id
    }

    pub(crate) fn queue(&self, id: QueueId) -> GcResult<Arc<ReferenceQueue>> {
        self.queues
            .read()
            .get(&id)
            .cloned()
            .ok_or(GcError::UnknownQueue(id.0))
    }

    /// Clear the referents marking did not reach and enqueue their
    /// references. Must run after marking is complete.
    pub(crate) fn process(&self, dir: &RegionDirectory) -> ReferenceStats {
        let mut discovered: Vec<ObjRef> = self.discovered.lock().drain().collect();
        discovered.sort();
        let mut stats = ReferenceStats {
            discovered: discovered.len(),
            ..ReferenceStats::default()
        };
        let queues = self.queues.read();

        for r in discovered {
            let Some(obj) = dir.object(r) else {
                continue;
            };
            let ObjectKind::Reference { queue, .. } = obj.kind() else {
                continue;
            };
            let referent = obj.load_field(0);
            if referent.is_null() {
                continue;
            }
            let live = dir
                .region(referent.region())
                .is_some_and(|region| region.is_live(referent.offset()));
            if live {
                continue;
            }
            obj.store_field(0, ObjRef::NULL);
            stats.cleared += 1;
            if let Some(q) = queue.and_then(|id| queues.get(&id)) {
                q.enqueue(r);
                stats.enqueued += 1;
            }
        }
        stats
    }

    /// Pending queue entries, as roots.
    pub(crate) fn visit_roots(&self, visitor: &mut dyn FnMut(&RootSlot)) {
        for queue in self.queues.read().values() {
            queue.visit_roots(visitor);
        }
    }
}

impl Heap {
    /// Read a reference's referent.
    ///
    /// While marking, the referent is reported to the marker so it survives
    /// the cycle that handed it out.
    pub(crate) fn reference_get_barrier(
        &self,
        buffer: &WriteBarrierBuffer,
        r: ObjRef,
    ) -> GcResult<ObjRef> {
        let r = self.load_barrier(r);
        let obj = self
            .directory
            .object(r)
            .ok_or(GcError::InvalidReference(r))?;
        let ObjectKind::Reference { kind, .. } = obj.kind() else {
            return Err(GcError::WrongObjectKind(r));
        };
        if kind == RefKind::Phantom {
            return Ok(ObjRef::NULL);
        }
        let referent = obj.load_field(0);
        let resolved = self.load_barrier(referent);
        if resolved != referent {
            obj.cas_field(0, referent, resolved);
        }
        if self.gc_state.is_marking() {
            self.enqueue_for_marking(buffer, resolved);
        }
        Ok(resolved)
    }

    /// Clear a reference without enqueueing it.
    pub(crate) fn reference_clear(&self, r: ObjRef) -> GcResult<()> {
        let r = self.load_barrier(r);
        let obj = self
            .directory
            .object(r)
            .ok_or(GcError::InvalidReference(r))?;
        if !obj.is_reference() {
            return Err(GcError::WrongObjectKind(r));
        }
        obj.store_field(0, ObjRef::NULL);
        Ok(())
    }

    /// Create a queue that cleared references can be appended to.
    pub fn create_reference_queue(&self) -> QueueId {
        self.references.create_queue()
    }

    /// Look up a reference queue.
    pub fn reference_queue(&self, id: QueueId) -> GcResult<Arc<ReferenceQueue>> {
        self.references.queue(id)
    }
}
