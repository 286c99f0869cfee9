use caskdb::Cask;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use rand::prelude::*;
use tempfile::TempDir;

fn put_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("put_bench");
    group.bench_function("cask", |b| {
        b.iter_batched(
            || {
                let temp_dir = TempDir::new().unwrap();
                (Cask::open(temp_dir.path()).unwrap(), temp_dir)
            },
            |(store, _temp_dir)| {
                for i in 1..(1 << 12) {
                    store.put(format!("key{}", i).as_bytes(), b"value").unwrap();
                }
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

fn get_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_bench");
    for i in &vec![8, 12, 16] {
        group.bench_with_input(format!("cask_{}", i), i, |b, i| {
            let temp_dir = TempDir::new().unwrap();
            let store = Cask::open(temp_dir.path()).unwrap();
            for key_i in 1..(1 << i) {
                store
                    .put(format!("key{}", key_i).as_bytes(), b"value")
                    .unwrap();
            }
            let mut rng = SmallRng::from_seed([0; 32]);
            b.iter(|| {
                store
                    .get(format!("key{}", rng.gen_range(1..1 << i)).as_bytes())
                    .unwrap();
            })
        });
    }
    group.finish();
}

criterion_group!(benches, put_bench, get_bench);
criterion_main!(benches);
