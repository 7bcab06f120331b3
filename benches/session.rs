use std::rc::Rc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use stratadb::{DataStore, KeyValue, MemoryStore, Session, SharedBytes};

const PRELOAD: u32 = 10_000;

fn key(i: u32) -> SharedBytes {
    // Fixed-width keys ensure stable ordering.
    SharedBytes::from(format!("k{i:08}").into_bytes())
}

fn value(i: u32) -> SharedBytes {
    SharedBytes::from(format!("v{i:08}").into_bytes())
}

fn preloaded_store() -> Rc<MemoryStore> {
    let store = Rc::new(MemoryStore::new());
    for i in 0..PRELOAD {
        store.write(KeyValue::new(key(i), value(i))).expect("write");
    }
    store
}

fn bench_reads(c: &mut Criterion) {
    let store = preloaded_store();
    let root = Session::new(store);
    let tip = root.nest();

    let mut rng = StdRng::seed_from_u64(7);
    let mut order: Vec<u32> = (0..PRELOAD).collect();
    order.shuffle(&mut rng);

    let mut idx = 0usize;
    c.bench_function("read_through_cold_and_hot", |b| {
        b.iter(|| {
            let k = key(order[idx % order.len()]);
            idx += 1;
            tip.read(&k).expect("read")
        })
    });
}

fn bench_write_commit(c: &mut Criterion) {
    let store = preloaded_store();
    let root = Session::new(store);

    c.bench_function("nest_write_commit", |b| {
        b.iter_batched(
            || root.nest(),
            |tip| {
                for i in 0..64u32 {
                    tip.write(KeyValue::new(key(i), value(i + 1))).expect("write");
                }
                tip.commit().expect("commit");
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_iteration(c: &mut Criterion) {
    let store = preloaded_store();
    let root = Session::new(store);
    let tip = root.nest();
    for i in (0..PRELOAD).step_by(100) {
        tip.erase(&key(i)).expect("erase");
    }

    c.bench_function("merged_scan_1k", |b| {
        b.iter(|| {
            let mut iter = tip.begin().expect("begin");
            let mut seen = 0u32;
            while !iter.is_end() && seen < 1_000 {
                seen += 1;
                iter.step_next().expect("step");
            }
            seen
        })
    });
}

criterion_group!(benches, bench_reads, bench_write_commit, bench_iteration);
criterion_main!(benches);
