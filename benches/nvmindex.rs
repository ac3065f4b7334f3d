use std::sync::Arc;

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};

use nvmindex::{
    BTreeStandIn, BytewiseComparator, Index, IndexMeta, IndexOptions, KeyAndMeta, NoopFlush,
    PersistentSkiplist, SkiplistOptions,
};

fn key(i: u32) -> Bytes {
    // Fixed-width keys ensure stable ordering.
    Bytes::from(format!("k{:08}", i))
}

fn value(i: u32) -> Bytes {
    Bytes::from(format!("v{:08}", i))
}

fn seeded_list(n: u32) -> PersistentSkiplist {
    let mut list = PersistentSkiplist::with_rng(
        BytewiseComparator,
        Arc::new(NoopFlush),
        SkiplistOptions::default(),
        StdRng::seed_from_u64(0x5eed),
    );
    for i in 0..n {
        list.insert(key(i), value(i));
    }
    list
}

fn bench_skiplist_insert(c: &mut Criterion) {
    c.bench_function("skiplist_insert_10k", |b| {
        b.iter_batched(
            || {
                let mut rng = StdRng::seed_from_u64(0xdead_beef);
                let keys: Vec<u32> = (0..10_000).map(|_| rng.gen_range(0..100_000)).collect();
                (seeded_list(0), keys)
            },
            |(mut list, keys)| {
                for i in keys {
                    list.insert(key(i), value(i));
                }
                list
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_skiplist_find(c: &mut Criterion) {
    let list = seeded_list(100_000);
    let mut rng = StdRng::seed_from_u64(0x5eed);
    c.bench_function("skiplist_find", |b| {
        b.iter(|| {
            let i: u32 = rng.gen_range(0..100_000);
            list.find(&key(i))
        })
    });
}

fn bench_index_async_drain(c: &mut Criterion) {
    c.bench_function("index_async_drain_10k", |b| {
        b.iter_batched(
            || {
                Index::new(
                    Arc::new(BTreeStandIn::new()),
                    Arc::new(NoopFlush),
                    IndexOptions::default(),
                )
            },
            |idx| {
                for i in 0..10_000u32 {
                    idx.async_insert(KeyAndMeta::insert(i, IndexMeta::new(1, u64::from(i), 8)))
                        .unwrap();
                }
                idx.stop().unwrap();
                idx
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_index_get(c: &mut Criterion) {
    let idx = Index::new(
        Arc::new(BTreeStandIn::new()),
        Arc::new(NoopFlush),
        IndexOptions::default(),
    );
    for i in 0..100_000u32 {
        idx.insert(i, IndexMeta::new(1, u64::from(i), 8));
    }
    let mut rng = StdRng::seed_from_u64(0x5eed);
    c.bench_function("index_get", |b| {
        b.iter(|| {
            let i: u32 = rng.gen_range(0..100_000);
            idx.get(i.to_string().as_bytes())
        })
    });
}

fn benches(c: &mut Criterion) {
    bench_skiplist_insert(c);
    bench_skiplist_find(c);
    bench_index_async_drain(c);
    bench_index_get(c);
}

criterion_group!(group, benches);
criterion_main!(group);
