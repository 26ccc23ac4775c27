use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use lsm_kv::{KvConfig, KvStore};

const N: usize = 1_000;
const VAL_SIZE: usize = 100;

fn write_path(c: &mut Criterion) {
    c.bench_function("set_1k_no_flush", |b| {
        b.iter_batched(
            || KvStore::open(KvConfig::default()).unwrap(),
            |mut store| {
                let value = Bytes::from(vec![b'x'; VAL_SIZE]);
                for i in 0..N {
                    store.set(format!("k{i}"), value.clone(), None).unwrap();
                }
            },
            BatchSize::SmallInput,
        );
    });

    c.bench_function("set_1k_with_flush_and_compaction", |b| {
        b.iter_batched(
            || KvStore::open(KvConfig::default()).unwrap(),
            |mut store| {
                let value = Bytes::from(vec![b'x'; VAL_SIZE]);
                for i in 0..N {
                    store.set(format!("k{i}"), value.clone(), None).unwrap();
                    if i % 100 == 99 {
                        store.flush().unwrap();
                    }
                }
                store.run_compactions().unwrap();
            },
            BatchSize::SmallInput,
        );
    });
}

fn read_path(c: &mut Criterion) {
    c.bench_function("get_1k_memtable_hot", |b| {
        b.iter_batched(
            || {
                let mut store = KvStore::open(KvConfig::default()).unwrap();
                let value = Bytes::from(vec![b'x'; VAL_SIZE]);
                for i in 0..N {
                    store.set(format!("k{i}"), value.clone(), None).unwrap();
                }
                store
            },
            |mut store| {
                for i in 0..N {
                    assert!(store.get(&format!("k{i}")).unwrap().is_some());
                }
            },
            BatchSize::SmallInput,
        );
    });

    c.bench_function("get_1k_across_runs", |b| {
        b.iter_batched(
            || {
                let mut store = KvStore::open(KvConfig::default()).unwrap();
                let value = Bytes::from(vec![b'x'; VAL_SIZE]);
                for i in 0..N {
                    store.set(format!("k{i}"), value.clone(), None).unwrap();
                    if i % 100 == 99 {
                        store.flush().unwrap();
                    }
                }
                store
            },
            |mut store| {
                for i in 0..N {
                    assert!(store.get(&format!("k{i}")).unwrap().is_some());
                }
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, write_path, read_path);
criterion_main!(benches);
