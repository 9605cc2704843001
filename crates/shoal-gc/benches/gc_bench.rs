use std::hint::black_box;
use std::sync::Arc;

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use shoal_gc::{GcCause, Heap, HeapConfig, HeuristicsKind, Mutator};

fn heap(heuristics: HeuristicsKind) -> Arc<Heap> {
    Heap::new(HeapConfig {
        region_size: 256 * 1024,
        region_count: 256,
        heuristics,
        ..HeapConfig::default()
    })
    .expect("valid bench config")
}

/// A rooted list of `len` nodes with garbage between them.
fn populate(m: &Mutator, len: usize) {
    let head = m.alloc_rooted(32, 1).expect("alloc head");
    for i in 0..len {
        m.alloc(128, 0).expect("alloc garbage");
        let node = m.alloc_rooted(32, 1).expect("alloc node");
        let s = m.enter();
        let head_ref = s.load_barrier(m.roots().get(head));
        let node_ref = s.load_barrier(m.roots().get(node));
        s.store_data(node_ref, i as u64).expect("store data");
        let first = s.load_field(head_ref, 0).expect("load field");
        s.store_field(node_ref, 0, first).expect("store field");
        s.store_field(head_ref, 0, node_ref).expect("store field");
        drop(s);
        m.roots().remove(node);
    }
}

fn bench_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation");

    group.bench_function("tlab_small_objects", |b| {
        let heap = heap(HeuristicsKind::Static);
        let m = heap.mutator();
        b.iter(|| {
            for _ in 0..1_000 {
                black_box(m.alloc(48, 1).expect("alloc"));
            }
        });
    });

    group.bench_function("scoped_small_objects", |b| {
        let heap = heap(HeuristicsKind::Static);
        let m = heap.mutator();
        b.iter(|| loop {
            let s = m.enter();
            let mut done = 0;
            while done < 1_000 && s.try_alloc(48, 1).is_ok() {
                done += 1;
            }
            drop(s);
            if done == 1_000 {
                break;
            }
            heap.collect(GcCause::Explicit).expect("collect");
        });
    });

    group.bench_function("humongous", |b| {
        let heap = heap(HeuristicsKind::Static);
        let m = heap.mutator();
        b.iter(|| black_box(m.alloc(3 * 256 * 1024, 0).expect("alloc")));
    });

    group.finish();
}

fn bench_cycles(c: &mut Criterion) {
    let mut group = c.benchmark_group("cycle");
    group.sample_size(20);

    for (name, heuristics) in [
        ("concurrent_aggressive", HeuristicsKind::Aggressive),
        ("concurrent_static", HeuristicsKind::Static),
    ] {
        group.bench_function(name, |b| {
            b.iter_batched(
                || {
                    let heap = heap(heuristics);
                    let m = heap.mutator();
                    populate(&m, 5_000);
                    (heap, m)
                },
                |(heap, m)| {
                    black_box(heap.collect(GcCause::Explicit).expect("collect"));
                    drop(m);
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.bench_function("full", |b| {
        b.iter_batched(
            || {
                let heap = heap(HeuristicsKind::Static);
                let m = heap.mutator();
                populate(&m, 5_000);
                (heap, m)
            },
            |(heap, m)| {
                black_box(heap.collect_full(GcCause::Explicit).expect("collect"));
                drop(m);
            },
            BatchSize::LargeInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_allocation, bench_cycles);
criterion_main!(benches);
