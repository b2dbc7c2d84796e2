use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;

use diskmultimap::{Heap, RawTable, VecStore};

const N: u64 = 100_000;

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_str");
    group.throughput(Throughput::Elements(N));

    group.bench_function(BenchmarkId::new("vec_store", N), |b| {
        b.iter(|| {
            let mut heap = Heap::new(VecStore::with_len(4096)).unwrap();
            let table = RawTable::create(&mut heap, 0).unwrap();
            for i in 0..N {
                table.insert_str(&mut heap, &format!("key{i}")).unwrap();
            }
            black_box(table.len(&heap))
        })
    });

    group.bench_function(BenchmarkId::new("mmap_file", N), |b| {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.map");
        b.iter(|| {
            let mut heap = Heap::create(&path, 4096).unwrap();
            let table = RawTable::create(&mut heap, 0).unwrap();
            for i in 0..N {
                table.insert_str(&mut heap, &format!("key{i}")).unwrap();
            }
            black_box(table.len(&heap))
        })
    });

    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let mut heap = Heap::new(VecStore::with_len(4096)).unwrap();
    let table = RawTable::create(&mut heap, 0).unwrap();
    for i in 0..N {
        table.insert_str(&mut heap, &format!("key{i}")).unwrap();
    }

    let mut rng = rand::rng();
    c.bench_function("lookup_hit", |b| {
        b.iter(|| {
            let i = rng.random_range(0..N);
            black_box(table.lookup(&heap, &format!("key{i}")))
        })
    });
    c.bench_function("lookup_miss", |b| {
        b.iter(|| {
            let i = rng.random_range(0..N);
            black_box(table.lookup(&heap, &format!("absent{i}")))
        })
    });
}

criterion_group!(benches, bench_insert, bench_lookup);
criterion_main!(benches);
