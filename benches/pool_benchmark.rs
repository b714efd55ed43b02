//! Benchmarks for job execution in-process and on worker pools.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use procjob::task::Task;
use procjob::{Job, JobConfig, builtins};
use serde_json::json;

fn bench_task_execute(c: &mut Criterion) {
    let registry = builtins::registry();
    let task = Task::new(0, "plus_num", json!(41), vec![json!(1)]);

    c.bench_function("task_execute", |b| {
        b.iter(|| black_box(task.execute(black_box(&registry))))
    });
}

fn bench_single_processed(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_processed");

    for size in [10, 100, 1000].iter() {
        let job = Job::new(builtins::registry(), "plus_one").with_items(0..*size as i64);
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let results: Vec<Option<i64>> = job.run_single_processed().unwrap();
                black_box(results)
            });
        });
    }

    group.finish();
}

fn bench_multi_processed(c: &mut Criterion) {
    let mut group = c.benchmark_group("multi_processed");
    // Every iteration spawns and tears down a pool.
    group.sample_size(10);

    for processes in [1, 2, 4].iter() {
        let job = Job::new(builtins::registry(), "plus_one")
            .with_items(0..64i64)
            .with_config(
                JobConfig::default()
                    .with_processes(*processes)
                    .with_worker_program(env!("CARGO_BIN_EXE_procjob")),
            );
        group.bench_with_input(BenchmarkId::new("items_64", processes), processes, |b, _| {
            b.iter(|| {
                let results: Vec<Option<i64>> = job.run_multi_processed().unwrap();
                black_box(results)
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_task_execute,
    bench_single_processed,
    bench_multi_processed
);
criterion_main!(benches);
