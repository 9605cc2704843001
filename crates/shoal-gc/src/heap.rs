//! The heap: regions, collector state and registered roots

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::barrier::{GcPhase, GcState};
use crate::config::HeapConfig;
use crate::directory::RegionDirectory;
use crate::error::GcResult;
use crate::evacuation::EvacuationCounters;
use crate::fault::FaultInjector;
use crate::heuristics::{CollectionSet, GcCause, Heuristics, HeuristicsContext};
use crate::marking::MarkingContext;
use crate::mutator::{Mutator, MutatorShared};
use crate::reference::ReferenceProcessor;
use crate::roots::{RootProvider, RootSlot};
use crate::safepoint::Safepoint;
use crate::stats::GcStats;
use crate::workers::WorkerGang;

/// Identifies a registered [`RootProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProviderId(usize);

/// A collected heap.
///
/// Shared between mutator threads through `Arc`. Mutators are created with
/// [`Heap::mutator`]; collections run on whichever thread asks for them, or
/// on a [`ControlThread`](crate::ControlThread).
pub struct Heap {
    pub(crate) config: HeapConfig,
    pub(crate) directory: RegionDirectory,
    pub(crate) safepoint: Safepoint,
    pub(crate) gc_state: GcState,
    pub(crate) marking: MarkingContext,
    pub(crate) references: ReferenceProcessor,
    pub(crate) heuristics: Mutex<Box<dyn Heuristics>>,
    pub(crate) faults: FaultInjector,
    pub(crate) workers: WorkerGang,
    pub(crate) mutators: Mutex<FxHashMap<usize, Arc<MutatorShared>>>,
    next_mutator: AtomicUsize,
    root_providers: RwLock<FxHashMap<usize, Arc<dyn RootProvider>>>,
    next_provider: AtomicUsize,
    /// Held for the whole of every collection
    pub(crate) cycle_lock: Mutex<()>,
    pub(crate) gc_id: AtomicU64,
    pub(crate) cancelled: AtomicU8,
    pub(crate) degenerating: AtomicBool,
    pub(crate) cset: RwLock<CollectionSet>,
    pub(crate) evac: EvacuationCounters,
    pub(crate) stats: Mutex<GcStats>,
    pub(crate) request: Mutex<Option<GcCause>>,
    pub(crate) request_cv: Condvar,
    /// Running control threads
    pub(crate) control_threads: AtomicUsize,
    pub(crate) target_heap_size: AtomicUsize,
    pub(crate) allocated_since_cycle: AtomicUsize,
    pub(crate) last_cycle_start: Mutex<Instant>,
}

impl Heap {
    /// Build a heap from a validated configuration.
    pub fn new(config: HeapConfig) -> GcResult<Arc<Self>> {
        config.validate()?;
        let capacity = config.capacity();
        let target = config
            .target_heap_size
            .map_or(capacity, |t| t.min(capacity));
        let heap = Self {
            directory: RegionDirectory::new(config.region_count, config.region_size),
            safepoint: Safepoint::new(),
            gc_state: GcState::new(),
            marking: MarkingContext::new(config.mark_queue_capacity),
            references: ReferenceProcessor::new(),
            heuristics: Mutex::new(config.heuristics.build(&config)),
            faults: FaultInjector::new(config.alloc_failure_a_lot, config.evac_failure_a_lot),
            workers: WorkerGang::new(config.gc_threads()),
            mutators: Mutex::new(FxHashMap::default()),
            next_mutator: AtomicUsize::new(0),
            root_providers: RwLock::new(FxHashMap::default()),
            next_provider: AtomicUsize::new(0),
            cycle_lock: Mutex::new(()),
            gc_id: AtomicU64::new(0),
            cancelled: AtomicU8::new(0),
            degenerating: AtomicBool::new(false),
            cset: RwLock::new(CollectionSet::default()),
            evac: EvacuationCounters::default(),
            stats: Mutex::new(GcStats::default()),
            request: Mutex::new(None),
            request_cv: Condvar::new(),
            control_threads: AtomicUsize::new(0),
            target_heap_size: AtomicUsize::new(target),
            allocated_since_cycle: AtomicUsize::new(0),
            last_cycle_start: Mutex::new(Instant::now()),
            config,
        };
        tracing::info!(
            target: "shoal::gc",
            regions = heap.config.region_count,
            region_size = heap.config.region_size,
            heuristics = heap.heuristics.lock().name(),
            mode = ?heap.config.mode,
            workers = heap.workers.threads(),
            "Heap initialized"
        );
        Ok(Arc::new(heap))
    }

    /// Register a new mutator.
    pub fn mutator(self: &Arc<Self>) -> Mutator {
        let id = self.next_mutator.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(MutatorShared::new(id, &self.config));
        self.mutators.lock().insert(id, shared.clone());
        Mutator::new(self.clone(), shared)
    }

    /// Heap configuration
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Region directory
    pub fn directory(&self) -> &RegionDirectory {
        &self.directory
    }

    /// Register an external root enumerator.
    pub fn add_root_provider(&self, provider: Arc<dyn RootProvider>) -> ProviderId {
        let id = self.next_provider.fetch_add(1, Ordering::Relaxed);
        self.root_providers.write().insert(id, provider);
        ProviderId(id)
    }

    /// Unregister a root enumerator. Returns false if it was not registered.
    pub fn remove_root_provider(&self, id: ProviderId) -> bool {
        self.root_providers.write().remove(&id.0).is_some()
    }

    /// Visit every root slot: mutator root sets, registered providers and
    /// pending reference queue entries.
    pub(crate) fn visit_roots(&self, visitor: &mut dyn FnMut(&RootSlot)) {
        let mutators: Vec<Arc<MutatorShared>> = self.mutators.lock().values().cloned().collect();
        for mutator in &mutators {
            mutator.roots.visit_roots(visitor);
        }
        let providers: Vec<Arc<dyn RootProvider>> =
            self.root_providers.read().values().cloned().collect();
        for provider in &providers {
            provider.visit_roots(visitor);
        }
        self.references.visit_roots(visitor);
    }

    /// Abandon every mutator TLAB and both allocation regions.
    pub(crate) fn retire_tlabs(&self) {
        for mutator in self.mutators.lock().values() {
            mutator.tlab.lock().retire();
        }
        self.directory.retire_alloc_regions();
    }

    /// Occupancy as seen by the heuristics.
    pub fn heuristics_context(&self) -> HeuristicsContext {
        let capacity = self.target_heap_size();
        let used = self.directory.used_bytes();
        let available = self
            .directory
            .free_bytes()
            .min(capacity.saturating_sub(used));
        let guaranteed_interval = (self.config.guaranteed_interval_ms > 0)
            .then(|| Duration::from_millis(self.config.guaranteed_interval_ms));
        HeuristicsContext {
            capacity,
            max_capacity: self.directory.capacity(),
            used,
            available,
            region_size: self.directory.region_size(),
            allocated_since_cycle: self.allocated_since_cycle.load(Ordering::Relaxed),
            since_last_cycle: self.last_cycle_start.lock().elapsed(),
            guaranteed_interval,
        }
    }

    /// Ask the heuristics whether a concurrent cycle should start now.
    pub fn should_start_cycle(&self) -> Option<GcCause> {
        let ctx = self.heuristics_context();
        self.heuristics.lock().should_start_cycle(&ctx)
    }

    /// Ask the control thread to run a cycle. Returns immediately.
    ///
    /// Nothing runs until a [`ControlThread`](crate::ControlThread) picks
    /// the request up.
    pub fn request_gc(&self, cause: GcCause) {
        *self.request.lock() = Some(cause);
        self.request_cv.notify_all();
        tracing::debug!(target: "shoal::gc", ?cause, "Collection requested");
    }

    /// Whether a [`ControlThread`](crate::ControlThread) is serving requests
    pub fn has_control_thread(&self) -> bool {
        self.control_threads.load(Ordering::Acquire) > 0
    }

    /// Cumulative statistics
    pub fn stats(&self) -> GcStats {
        let mut stats = self.stats.lock().clone();
        stats.pauses = self.safepoint.stats();
        stats.mark_overflows = self.marking.overflow_events();
        stats.injected_alloc_failures = self.faults.injected_alloc_failures();
        stats.injected_evac_failures = self.faults.injected_evac_failures();
        stats
    }

    /// Phase the collector is in
    pub fn phase(&self) -> GcPhase {
        self.gc_state.phase()
    }

    /// Number of cycles started so far
    pub fn gc_count(&self) -> u64 {
        self.gc_id.load(Ordering::Acquire)
    }

    /// Object bytes in the heap
    pub fn used_bytes(&self) -> usize {
        self.directory.used_bytes()
    }

    /// Maximum heap size in bytes
    pub fn capacity(&self) -> usize {
        self.directory.capacity()
    }

    /// Soft heap size the heuristics aim for
    pub fn target_heap_size(&self) -> usize {
        self.target_heap_size.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heuristics::HeuristicsKind;
    use crate::object::ObjRef;
    use crate::roots::RootSet;

    fn heap() -> Arc<Heap> {
        Heap::new(HeapConfig {
            region_size: 4096,
            region_count: 8,
            heuristics: HeuristicsKind::Static,
            parallel_gc_threads: Some(1),
            ..HeapConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_visit_roots_covers_mutators_and_providers() {
        let heap = heap();
        let m = heap.mutator();
        let a = m.alloc(24, 0).unwrap();
        let b = m.alloc(24, 0).unwrap();
        m.roots().insert(a);

        let extra = Arc::new(RootSet::new());
        extra.insert(b);
        let id = heap.add_root_provider(extra);

        let mut seen = Vec::new();
        heap.visit_roots(&mut |slot| seen.push(slot.load()));
        seen.sort();
        assert_eq!(seen, vec![a, b]);

        assert!(heap.remove_root_provider(id));
        assert!(!heap.remove_root_provider(id));
        let mut seen: Vec<ObjRef> = Vec::new();
        heap.visit_roots(&mut |slot| seen.push(slot.load()));
        assert_eq!(seen, vec![a]);
    }

    #[test]
    fn test_dropped_mutator_unregisters() {
        let heap = heap();
        let m = heap.mutator();
        assert_eq!(heap.mutators.lock().len(), 1);
        drop(m);
        assert!(heap.mutators.lock().is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = HeapConfig {
            region_size: 3000,
            ..HeapConfig::default()
        };
        assert!(Heap::new(config).is_err());
    }

    #[test]
    fn test_heuristics_context_uses_target() {
        let heap = Heap::new(HeapConfig {
            region_size: 4096,
            region_count: 8,
            target_heap_size: Some(4 * 4096),
            ..HeapConfig::default()
        })
        .unwrap();
        let ctx = heap.heuristics_context();
        assert_eq!(ctx.capacity, 4 * 4096);
        assert_eq!(ctx.max_capacity, 8 * 4096);
        assert_eq!(ctx.available, 4 * 4096);
    }
}
