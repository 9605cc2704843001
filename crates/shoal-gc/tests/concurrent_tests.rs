//! Barrier and evacuation tests with mutators running during cycles

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use shoal_gc::{
    ControlThread, CycleKind, FaultSchedule, GcCause, GcResult, Handle, Heap, HeapConfig,
    HeuristicsKind, MarkingMode, Mutator, ObjRef,
};

const LIST_LIMIT: u64 = 24;

fn config(mode: MarkingMode) -> HeapConfig {
    HeapConfig {
        region_size: 4096,
        region_count: 256,
        heuristics: HeuristicsKind::Aggressive,
        mode,
        parallel_gc_threads: Some(2),
        verify: true,
        immediate_threshold_percent: 100,
        ..HeapConfig::default()
    }
}

/// Push a node holding `value` on the front of the list rooted at `head`,
/// then cut the list after `LIST_LIMIT` nodes.
fn push_front(m: &Mutator, head: Handle, value: u64) -> GcResult<()> {
    let node = m.alloc_rooted(32, 1)?;
    // Garbage between the nodes keeps the regions fragmented.
    m.alloc(96, 0)?;
    {
        let s = m.enter();
        let head_ref = s.load_barrier(m.roots().get(head));
        let node_ref = s.load_barrier(m.roots().get(node));
        let first = s.load_field(head_ref, 0)?;
        s.store_data(node_ref, value)?;
        s.store_field(node_ref, 0, first)?;
        s.store_field(head_ref, 0, node_ref)?;

        let mut cur = node_ref;
        for _ in 1..LIST_LIMIT {
            cur = s.load_field(cur, 0)?;
            if cur.is_null() {
                break;
            }
        }
        if !cur.is_null() {
            s.store_field(cur, 0, ObjRef::NULL)?;
        }
    }
    m.roots().remove(node);
    Ok(())
}

/// Check that the list holds `last, last - 1, ...` down to the cut.
fn check_list(m: &Mutator, head: Handle, last: u64) -> GcResult<()> {
    let s = m.enter();
    let mut cur = s.load_field(s.load_barrier(m.roots().get(head)), 0)?;
    let mut expected = last;
    let mut len = 0;
    while !cur.is_null() {
        assert_eq!(s.load_data(cur)?, expected);
        expected = expected.wrapping_sub(1);
        len += 1;
        cur = s.load_field(cur, 0)?;
    }
    assert_eq!(len, LIST_LIMIT.min(last + 1));
    Ok(())
}

fn run_mutators_against_collector(mode: MarkingMode) {
    let heap = Heap::new(config(mode)).unwrap();
    let stop = AtomicBool::new(false);

    std::thread::scope(|scope| {
        let collector = scope.spawn(|| {
            let mut cycles = 0;
            while !stop.load(Ordering::Acquire) {
                heap.collect(GcCause::Explicit).unwrap();
                cycles += 1;
            }
            cycles
        });

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let heap = heap.clone();
                scope.spawn(move || {
                    let m = heap.mutator();
                    let head = m.alloc_rooted(32, 1).unwrap();
                    for i in 0..2000 {
                        push_front(&m, head, i).unwrap();
                        if i % 250 == 0 {
                            check_list(&m, head, i).unwrap();
                        }
                    }
                    check_list(&m, head, 1999).unwrap();
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        stop.store(true, Ordering::Release);
        assert!(collector.join().unwrap() > 0);
    });

    let stats = heap.stats();
    assert!(stats.bytes_copied > 0);
    heap.verify().unwrap();
}

#[test]
fn test_satb_mutators_during_cycles() {
    run_mutators_against_collector(MarkingMode::Satb);
}

#[test]
fn test_incremental_update_mutators_during_cycles() {
    run_mutators_against_collector(MarkingMode::IncrementalUpdate);
}

#[test]
fn test_evacuation_failure_degenerates() {
    let heap = Heap::new(HeapConfig {
        evac_failure_a_lot: Some(FaultSchedule::Every { n: 4 }),
        ..config(MarkingMode::Satb)
    })
    .unwrap();
    let m = heap.mutator();
    let head = m.alloc_rooted(32, 1).unwrap();
    for i in 0..200 {
        push_front(&m, head, i).unwrap();
    }
    let live = (LIST_LIMIT as usize + 1) * 32;

    let summary = heap.collect(GcCause::Explicit).unwrap();
    assert_eq!(summary.kind, CycleKind::Degenerated);
    let stats = heap.stats();
    assert_eq!(stats.cancelled, 1);
    assert!(stats.evacuation_failures > 0);
    assert!(stats.injected_evac_failures > 0);
    assert_eq!(heap.used_bytes(), live);
    check_list(&m, head, 199).unwrap();

    // Objects left in place by the failure move on the next cycle.
    heap.collect(GcCause::Explicit).unwrap();
    check_list(&m, head, 199).unwrap();
}

#[test]
fn test_allocation_pressure_from_many_threads() {
    let heap = Heap::new(HeapConfig {
        region_count: 64,
        heuristics: HeuristicsKind::Static,
        ..config(MarkingMode::Satb)
    })
    .unwrap();

    std::thread::scope(|scope| {
        for t in 0..4u64 {
            let heap = heap.clone();
            scope.spawn(move || {
                let m = heap.mutator();
                let keep = m.alloc_rooted(64, 0).unwrap();
                m.store_data(m.roots().get(keep), t).unwrap();
                for _ in 0..3000 {
                    m.alloc(256, 0).unwrap();
                }
                assert_eq!(m.load_data(m.roots().get(keep)).unwrap(), t);
            });
        }
    });

    assert!(heap.gc_count() > 0);
    assert!(heap.used_bytes() < heap.capacity());
    heap.verify().unwrap();
}

#[test]
fn test_control_thread_keeps_up_with_allocation() {
    let heap = Heap::new(HeapConfig {
        region_count: 64,
        heuristics: HeuristicsKind::Adaptive,
        control_interval_ms: 1,
        ..config(MarkingMode::Satb)
    })
    .unwrap();
    let control = ControlThread::spawn(heap.clone()).unwrap();

    let m = heap.mutator();
    let head = m.alloc_rooted(32, 1).unwrap();
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut last = 0;
    loop {
        push_front(&m, head, last).unwrap();
        if heap.stats().concurrent >= 3 || Instant::now() > deadline {
            break;
        }
        last += 1;
    }
    check_list(&m, head, last).unwrap();
    control.shutdown();
    assert!(heap.stats().concurrent >= 3);
    drop(m);
    heap.verify().unwrap();
}

#[test]
fn test_dropped_mutator_flushes_barrier_buffer() {
    let heap: Arc<Heap> = Heap::new(config(MarkingMode::Satb)).unwrap();
    let keeper = heap.mutator();
    let head = keeper.alloc_rooted(32, 1).unwrap();
    for i in 0..50 {
        push_front(&keeper, head, i).unwrap();
    }
    std::thread::scope(|scope| {
        let heap = heap.clone();
        scope.spawn(move || {
            let m = heap.mutator();
            let h = m.alloc_rooted(32, 1).unwrap();
            m.store_data(m.roots().get(h), 7).unwrap();
        });
    });
    heap.collect(GcCause::Explicit).unwrap();
    check_list(&keeper, head, 49).unwrap();
}
