//! Benchmarks for the per-shard receive buffer pool.
//!
//! Run with: cargo bench -p quicmux --bench buffer_pool

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use quicmux::netio::{BufferPool, BufferPoolConfig};

/// Warm pool: every get is a hit.
fn bench_get_put_cycle(c: &mut Criterion) {
    let pool = BufferPool::from_config(&BufferPoolConfig {
        max_buffers_per_shard: 1024,
        buffer_size: 1500,
    });
    drop((0..64).map(|_| pool.get()).collect::<Vec<_>>());

    c.bench_function("buffer_pool_get_put_cycle", |b| {
        b.iter(|| {
            let buf = pool.get();
            black_box(&buf);
            drop(buf);
        })
    });
}

/// Cold pool: capacity one, so bursts miss and discard.
fn bench_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_pool_burst");

    for burst in [8usize, 64, 256] {
        group.throughput(Throughput::Elements(burst as u64));
        for capacity in [1usize, 1024] {
            let pool = BufferPool::new(capacity, 1500);
            group.bench_with_input(
                BenchmarkId::new(format!("capacity_{}", capacity), burst),
                &burst,
                |b, &burst| {
                    b.iter(|| {
                        let held: Vec<_> = (0..burst).map(|_| pool.get()).collect();
                        black_box(held.len());
                    })
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, bench_get_put_cycle, bench_burst);
criterion_main!(benches);
