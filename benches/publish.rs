//! Performance benchmarks for feedback-hub-core
//!
//! Run with: cargo bench

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use feedback_hub_core::store::memory::InMemoryJobStore;
use feedback_hub_core::store::{JobStore, NewWebhook};
use feedback_hub_core::types::{Event, EventType};
use feedback_hub_core::{Hub, HubConfig};

fn bench_event_construction(c: &mut Criterion) {
    c.bench_function("Event::new", |b| {
        b.iter(|| {
            Event::new(
                EventType::feedback_record_created(),
                serde_json::json!({"rate": 7.35}),
            )
        });
    });
}

fn bench_webhook_payload_serialization(c: &mut Criterion) {
    let event = Event::new(
        EventType::feedback_record_created(),
        serde_json::json!({"rate": 7.35, "currency": "USD/CNY"}),
    );

    c.bench_function("WebhookPayload::from_event + serialize", |b| {
        b.iter(|| {
            let payload = feedback_hub_core::types::WebhookPayload::from_event(&event);
            payload.to_bytes().unwrap()
        });
    });
}

fn bench_signing(c: &mut Criterion) {
    let secret = [0x42u8; 32];
    let body = serde_json::to_vec(&serde_json::json!({"rate": 7.35})).unwrap();

    c.bench_function("WebhookSigner::sign", |b| {
        b.iter(|| {
            feedback_hub_core::crypto::WebhookSigner::sign(&secret, "sub-1-1", 1000, &body)
                .unwrap()
        });
    });
}

fn bench_publisher_enqueue_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("publisher_enqueue_throughput");
    for count in [10, 100, 1000] {
        group.bench_function(format!("{count} events"), |b| {
            b.to_async(&rt).iter(|| async {
                let store = Arc::new(InMemoryJobStore::new());
                let hub = Hub::start(HubConfig::default(), store);
                for i in 0..count {
                    hub.publish(Event::new(
                        EventType::feedback_record_created(),
                        serde_json::json!({"i": i}),
                    ));
                }
                hub.shutdown().await;
            });
        });
    }
    group.finish();
}

fn bench_webhook_provider_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    // Pre-populate a store with many subscribers to the same event type so
    // the benchmark measures the provider's resolve-and-insert path.
    let store = rt.block_on(async {
        let store = Arc::new(InMemoryJobStore::new());
        for _ in 0..200 {
            store
                .insert_webhook(
                    NewWebhook {
                        tenant_scope: None,
                        url: "https://example.test/hook".to_string(),
                        signing_key: vec![0x11; 32],
                        event_types: vec!["feedback_record.created".to_string()],
                    },
                    10_000,
                )
                .await
                .unwrap();
        }
        store
    });

    let provider = feedback_hub_core::provider::webhook::WebhookProvider::new(store, 1000, 8);

    c.bench_function("WebhookProvider::on_event (200 subscribers)", |b| {
        b.to_async(&rt).iter(|| async {
            use feedback_hub_core::provider::Provider;
            let event = Event::new(
                EventType::feedback_record_created(),
                serde_json::json!({"rate": 7.35}),
            )
            .with_timestamp(next_timestamp());
            provider.on_event(&event).await.unwrap();
        });
    });
}

/// Distinct timestamp per iteration so the unique-key constraint never
/// collapses the insert to zero rows and skews the timing.
fn next_timestamp() -> i64 {
    use std::sync::atomic::{AtomicI64, Ordering};
    static COUNTER: AtomicI64 = AtomicI64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

criterion_group!(
    benches,
    bench_event_construction,
    bench_webhook_payload_serialization,
    bench_signing,
    bench_publisher_enqueue_throughput,
    bench_webhook_provider_fan_out,
);
criterion_main!(benches);
