//! Soft, weak and phantom reference tests

use std::sync::Arc;
use std::time::Duration;

use shoal_gc::{
    GcCause, GcError, Heap, HeapConfig, HeuristicsKind, ObjRef, RefKind, RegionId, SoftRefPolicy,
};

fn heap(soft_ref_policy: SoftRefPolicy) -> Arc<Heap> {
    Heap::new(HeapConfig {
        region_size: 4096,
        region_count: 32,
        heuristics: HeuristicsKind::Aggressive,
        parallel_gc_threads: Some(2),
        verify: true,
        soft_ref_policy,
        ..HeapConfig::default()
    })
    .unwrap()
}

#[test]
fn test_weak_reference_cleared_and_enqueued() {
    let heap = heap(SoftRefPolicy::default());
    let m = heap.mutator();
    let queue = heap.create_reference_queue();

    let referent = m.alloc(64, 0).unwrap();
    let weak = m.alloc_reference(RefKind::Weak, referent, Some(queue)).unwrap();
    assert_eq!(m.reference_get(weak).unwrap(), referent);
    let weak = m.roots().insert(weak);

    let summary = heap.collect(GcCause::Explicit).unwrap();
    assert_eq!(summary.references.cleared, 1);
    assert_eq!(summary.references.enqueued, 1);
    assert!(m.reference_get(m.roots().get(weak)).unwrap().is_null());

    let polled = m.poll_reference_queue(queue).unwrap();
    assert_eq!(polled, Some(m.roots().get(weak)));
    assert_eq!(m.poll_reference_queue(queue).unwrap(), None);

    let stats = heap.stats();
    assert_eq!(stats.references_cleared, 1);
    assert_eq!(stats.references_enqueued, 1);
}

#[test]
fn test_weak_reference_to_live_object_follows_it() {
    let heap = heap(SoftRefPolicy::default());
    let m = heap.mutator();

    m.alloc(512, 0).unwrap();
    let strong = m.alloc_rooted(64, 0).unwrap();
    m.store_data(m.roots().get(strong), 99).unwrap();
    let weak = m
        .alloc_reference(RefKind::Weak, m.roots().get(strong), None)
        .unwrap();
    let weak = m.roots().insert(weak);

    let summary = heap.collect(GcCause::Explicit).unwrap();
    assert_eq!(summary.references.cleared, 0);
    assert!(summary.bytes_copied > 0);

    let referent = m.reference_get(m.roots().get(weak)).unwrap();
    assert_eq!(referent, m.roots().get(strong));
    assert_eq!(m.load_data(referent).unwrap(), 99);
}

#[test]
fn test_unreachable_reference_is_not_enqueued() {
    let heap = heap(SoftRefPolicy::default());
    let m = heap.mutator();
    let queue = heap.create_reference_queue();
    let referent = m.alloc(64, 0).unwrap();
    m.alloc_reference(RefKind::Weak, referent, Some(queue)).unwrap();

    let summary = heap.collect(GcCause::Explicit).unwrap();
    assert_eq!(summary.references.discovered, 0);
    assert_eq!(m.poll_reference_queue(queue).unwrap(), None);
    assert_eq!(heap.used_bytes(), 0);
}

#[test]
fn test_phantom_get_is_always_null() {
    let heap = heap(SoftRefPolicy::default());
    let m = heap.mutator();
    let queue = heap.create_reference_queue();
    let referent = m.alloc_rooted(64, 0).unwrap();
    let phantom = m
        .alloc_reference(RefKind::Phantom, m.roots().get(referent), Some(queue))
        .unwrap();
    let phantom = m.roots().insert(phantom);
    assert!(m.reference_get(m.roots().get(phantom)).unwrap().is_null());

    heap.collect(GcCause::Explicit).unwrap();
    assert_eq!(m.poll_reference_queue(queue).unwrap(), None);

    m.roots().remove(referent);
    heap.collect(GcCause::Explicit).unwrap();
    assert_eq!(
        m.poll_reference_queue(queue).unwrap(),
        Some(m.roots().get(phantom))
    );
}

#[test]
fn test_soft_references_follow_policy() {
    fn survives(policy: SoftRefPolicy, full: bool) -> bool {
        let heap = heap(policy);
        let m = heap.mutator();
        let referent = m.alloc(64, 0).unwrap();
        let soft = m.alloc_reference(RefKind::Soft, referent, None).unwrap();
        let soft = m.roots().insert(soft);
        if full {
            heap.collect_full(GcCause::Explicit).unwrap();
        } else {
            heap.collect(GcCause::Explicit).unwrap();
        }
        !m.reference_get(m.roots().get(soft)).unwrap().is_null()
    }

    assert!(survives(SoftRefPolicy::ClearOnPressure, false));
    assert!(!survives(SoftRefPolicy::ClearOnPressure, true));
    assert!(!survives(SoftRefPolicy::AlwaysClear, false));
    assert!(survives(SoftRefPolicy::NeverClear, false));
    assert!(survives(SoftRefPolicy::NeverClear, true));
}

#[test]
fn test_cleared_reference_is_not_enqueued() {
    let heap = heap(SoftRefPolicy::default());
    let m = heap.mutator();
    let queue = heap.create_reference_queue();
    let referent = m.alloc(64, 0).unwrap();
    let weak = m.alloc_reference(RefKind::Weak, referent, Some(queue)).unwrap();
    let weak = m.roots().insert(weak);

    m.reference_clear(m.roots().get(weak)).unwrap();
    assert!(m.reference_get(m.roots().get(weak)).unwrap().is_null());
    heap.collect(GcCause::Explicit).unwrap();
    assert_eq!(m.poll_reference_queue(queue).unwrap(), None);
}

#[test]
fn test_remove_waits_for_collection() {
    let heap = heap(SoftRefPolicy::default());
    let m = heap.mutator();
    let queue = heap.create_reference_queue();
    let referent = m.alloc(64, 0).unwrap();
    let weak = m.alloc_reference(RefKind::Weak, referent, Some(queue)).unwrap();
    let weak = m.roots().insert(weak);

    assert_eq!(
        m.remove_reference_queue(queue, Duration::from_millis(10))
            .unwrap(),
        None
    );

    std::thread::scope(|scope| {
        scope.spawn(|| {
            std::thread::sleep(Duration::from_millis(20));
            heap.collect(GcCause::Explicit).unwrap();
        });
        let removed = m
            .remove_reference_queue(queue, Duration::from_secs(10))
            .unwrap();
        assert_eq!(removed, Some(m.roots().get(weak)));
    });
}

#[test]
fn test_reference_errors() {
    let heap = heap(SoftRefPolicy::default());
    let m = heap.mutator();
    let plain = m.alloc(64, 1).unwrap();

    assert!(matches!(
        m.alloc_reference(RefKind::Weak, ObjRef::new(RegionId(7), 128), None),
        Err(GcError::InvalidReference(_))
    ));
    assert!(matches!(
        m.reference_get(plain),
        Err(GcError::WrongObjectKind(_))
    ));

    let other = heap_with_queues(3);
    let foreign = other.create_reference_queue();
    assert!(matches!(
        m.alloc_reference(RefKind::Weak, plain, Some(foreign)),
        Err(GcError::UnknownQueue(3))
    ));
    assert!(matches!(
        m.poll_reference_queue(foreign),
        Err(GcError::UnknownQueue(3))
    ));

    let weak = m.alloc_reference(RefKind::Weak, plain, None).unwrap();
    assert!(matches!(
        m.store_field(weak, 0, plain),
        Err(GcError::WrongObjectKind(_))
    ));
}

fn heap_with_queues(n: usize) -> Arc<Heap> {
    let heap = heap(SoftRefPolicy::default());
    for _ in 0..n {
        heap.create_reference_queue();
    }
    heap
}
