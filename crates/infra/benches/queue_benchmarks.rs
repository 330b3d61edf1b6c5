use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::Utc;
use conductor_core::{Job, JobRequest, Priority};
use conductor_infra::breaker::{BreakerConfig, CircuitBreakerRegistry};
use conductor_infra::queue::JobQueue;
use conductor_infra::store::InMemoryStore;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn job(i: usize) -> Job {
    let priority = match i % 3 {
        0 => Priority::High,
        1 => Priority::Normal,
        _ => Priority::Low,
    };
    JobRequest::new("scan-browser", serde_json::json!({ "n": i }))
        .with_priority(priority)
        .into_job(5, Utc::now())
        .unwrap()
}

fn bench_enqueue_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("enqueue_throughput");

    for batch_size in [1usize, 10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("in_memory", batch_size),
            batch_size,
            |b, &size| {
                b.iter(|| {
                    let queue = JobQueue::new(InMemoryStore::arc(), size);
                    rt.block_on(async {
                        for i in 0..size {
                            black_box(queue.enqueue(job(i)).await.unwrap());
                        }
                    });
                });
            },
        );
    }

    group.finish();
}

fn bench_claim_and_complete(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_and_complete");

    for depth in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*depth as u64));
        group.bench_with_input(BenchmarkId::new("drain", depth), depth, |b, &depth| {
            b.iter(|| {
                let queue = JobQueue::new(InMemoryStore::arc(), depth);
                rt.block_on(async {
                    for i in 0..depth {
                        queue.enqueue(job(i)).await.unwrap();
                    }
                    while let Some(mut claimed) = queue.dequeue_next().await.unwrap() {
                        queue.mark_completed(&mut claimed).await.unwrap();
                    }
                });
            });
        });
    }

    group.finish();
}

fn bench_breaker_allow(c: &mut Criterion) {
    let mut group = c.benchmark_group("breaker_allow");
    group.sample_size(1000);

    let registry = CircuitBreakerRegistry::new(BreakerConfig::default());
    for i in 0..32 {
        registry.record_success(&format!("dependency-{i}"));
    }

    group.bench_function("closed", |b| {
        b.iter(|| black_box(registry.allow(black_box("dependency-7"))));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_enqueue_throughput,
    bench_claim_and_complete,
    bench_breaker_allow
);
criterion_main!(benches);
