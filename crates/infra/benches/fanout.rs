use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;

use eventq_broker::InMemoryBroker;
use eventq_core::{Event, QueueConfig};
use eventq_infra::subscriptions::HandlerFuture;
use eventq_infra::{AdapterConfig, EventAdapter, EventHandler, QueueRegistry, SubscriberInfo, build_config};
use serde_json::json;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("tokio runtime")
}

fn subscribers(count: usize) -> Vec<SubscriberInfo> {
    (0..count)
        .map(|i| SubscriberInfo {
            topic: "bench.topic".to_string(),
            subscriber_name: format!("sub-{i}"),
            queue_config: QueueConfig::default(),
        })
        .collect()
}

/// Enqueue cost alone: no workers draining the queues.
fn bench_enqueue_to_all(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("enqueue_to_all");

    for count in [1usize, 4, 16] {
        let registry = QueueRegistry::new(Arc::new(InMemoryBroker::new()), Arc::new(build_config(None)));
        let targets = subscribers(count);
        let event = Event::new("bench.topic", json!({"n": 1}), "bench");

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                rt.block_on(registry.enqueue_to_all(black_box(&event), &targets))
                    .expect("enqueue")
            });
        });
    }
    group.finish();
}

/// Full `emit` through the adapter with live no-op subscribers.
fn bench_emit(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("emit");

    for count in [1usize, 4, 16] {
        let adapter = rt.block_on(async {
            let adapter = EventAdapter::from_existing(Arc::new(InMemoryBroker::new()), &AdapterConfig::default());
            for i in 0..count {
                let handler: EventHandler = Arc::new(|_event: Event| -> HandlerFuture { Box::pin(async { Ok(()) }) });
                adapter
                    .subscribe_with("bench.topic", &format!("sub-{i}"), handler, QueueConfig::default())
                    .await
                    .expect("subscribe");
            }
            adapter
        });

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                let event = Event::new("bench.topic", json!({"n": 1}), "bench");
                rt.block_on(adapter.emit(black_box(event))).expect("emit")
            });
        });

        rt.block_on(adapter.shutdown()).expect("shutdown");
    }
    group.finish();
}

criterion_group!(benches, bench_enqueue_to_all, bench_emit);
criterion_main!(benches);
