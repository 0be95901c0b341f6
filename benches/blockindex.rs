use blockindex::btree::BPlusTree;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::Rng;

// Utility function for creating a populated index to measure against
fn create_index(entries: u64) -> BPlusTree {
    let mut index = BPlusTree::default();
    for i in 0..entries {
        index.insert(&i.to_be_bytes(), i).expect("populates index");
    }
    index
}

fn index_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    for size in [1024u64, 8192, 65536].iter() {
        let mut index = create_index(*size);
        group.bench_with_input(
            BenchmarkId::new("blockindex insert", size),
            size,
            |b, size| {
                b.iter(|| {
                    let i = rand::thread_rng().gen_range(0..*size * 2);
                    let _ = index.insert(&i.to_be_bytes(), i);
                })
            },
        );
    }
}

fn index_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("search");
    for size in [1024u64, 8192, 65536].iter() {
        let index = create_index(*size);
        group.bench_with_input(
            BenchmarkId::new("blockindex search", size),
            size,
            |b, size| {
                b.iter(|| {
                    let i = rand::thread_rng().gen_range(0..*size);
                    let _ = index.search(&i.to_be_bytes());
                })
            },
        );
    }
}

fn index_remove(c: &mut Criterion) {
    let mut group = c.benchmark_group("remove");
    for size in [1024u64, 8192, 65536].iter() {
        let mut index = create_index(*size);
        group.bench_with_input(
            BenchmarkId::new("blockindex remove", size),
            size,
            |b, size| {
                b.iter(|| {
                    let i = rand::thread_rng().gen_range(0..*size);
                    let _ = index.remove(&i.to_be_bytes(), i);
                })
            },
        );
    }
}

criterion_group!(benches, index_insert, index_search, index_remove);
criterion_main!(benches);
