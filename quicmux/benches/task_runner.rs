//! Benchmarks for the alarm scheduler hot paths.
//!
//! - Re-arming an already scheduled alarm (`run_alarm` on a scheduled id)
//! - Draining a batch of due alarms (`pop_due` + `finish_tasks`)
//!
//! Run with: cargo bench -p quicmux --bench task_runner

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use quicmux::clock::Timestamp;
use quicmux::scheduler::{AlarmId, SchedulerConfig, TaskRunner};

fn runner_with(alarms: u64) -> TaskRunner {
    let mut runner = TaskRunner::new(&SchedulerConfig::default(), Timestamp::ZERO);
    for raw in 1..=alarms {
        let id = AlarmId::from_raw(raw);
        runner.register_alarm(id);
        runner.run_alarm(id, Timestamp::from_micros((raw * 7919 % 100_000) as i64), Timestamp::ZERO);
    }
    runner
}

/// Every packet in a connection typically pushes its retransmission alarm
/// out; that is a `fix` in the middle of the heap.
fn bench_rearm(c: &mut Criterion) {
    let mut group = c.benchmark_group("task_runner_rearm");

    for size in [100u64, 10_000, 100_000] {
        let mut runner = runner_with(size);
        let mut tick = 0i64;
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                tick += 1;
                let id = AlarmId::from_raw((tick as u64 % size) + 1);
                runner.run_alarm(black_box(id), Timestamp::from_micros(100_000 + tick), Timestamp::ZERO);
            })
        });
    }

    group.finish();
}

fn bench_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("task_runner_drain");

    for size in [100u64, 10_000] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || runner_with(size),
                |mut runner| {
                    let now = Timestamp::from_micros(100_000);
                    let due = runner.pop_due(now);
                    runner.finish_tasks(now);
                    black_box(due.len())
                },
                criterion::BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_rearm, bench_drain);
criterion_main!(benches);
