//! Prometheus metrics surface.
//!
//! All metrics live on one process-wide [`prometheus::Registry`]. Wiring the
//! registry into an actual scrape endpoint (axum route, standalone exporter,
//! etc.) is the embedder's job; this module only defines and updates the
//! series. Label values are normalized before being handed to `prometheus` so
//! cardinality stays bounded regardless of what callers pass in.

use once_cell::sync::Lazy;
use prometheus::{CounterVec, HistogramVec, IntGauge, Opts, Registry, TextEncoder};

use crate::types::EventType;

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static EVENTS_DISCARDED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    let counter = CounterVec::new(
        Opts::new(
            "hub_events_discarded_total",
            "Events dropped because the publisher's bounded queue was full",
        ),
        &["event_type"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registers exactly once");
    counter
});

static FAN_OUT_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "hub_message_publisher_fan_out_duration_seconds",
            "Wall-clock time spent invoking all registered providers for one event",
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ]),
        &["event_type"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("metric registers exactly once");
    histogram
});

static EVENT_CHANNEL_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "hub_event_channel_depth",
        "Current occupancy of the publisher's bounded event queue",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("metric registers exactly once");
    gauge
});

static RIVER_QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "hub_river_queue_depth",
        "Rows in the durable job queue in a non-terminal state",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("metric registers exactly once");
    gauge
});

static WEBHOOK_JOBS_ENQUEUED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    let counter = CounterVec::new(
        Opts::new(
            "hub_webhook_jobs_enqueued_total",
            "Dispatch jobs inserted by the webhook provider",
        ),
        &["event_type"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registers exactly once");
    counter
});

static WEBHOOK_PROVIDER_ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    let counter = CounterVec::new(
        Opts::new(
            "hub_webhook_provider_errors_total",
            "Errors or clamps encountered while the webhook provider resolves subscribers and enqueues jobs",
        ),
        &["reason"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registers exactly once");
    counter
});

static WEBHOOK_DELIVERIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    let counter = CounterVec::new(
        Opts::new(
            "hub_webhook_deliveries_total",
            "Webhook delivery attempts by outcome",
        ),
        &["event_type", "status"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registers exactly once");
    counter
});

static WEBHOOK_DELIVERY_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "hub_webhook_delivery_duration_seconds",
            "Wall-clock time spent on a single outbound webhook HTTP request",
        )
        .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["event_type", "status"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("metric registers exactly once");
    histogram
});

static WEBHOOK_DISABLED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    let counter = CounterVec::new(
        Opts::new(
            "hub_webhook_disabled_total",
            "Subscriptions automatically disabled, by reason",
        ),
        &["reason"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registers exactly once");
    counter
});

static WEBHOOK_DISPATCH_ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    let counter = CounterVec::new(
        Opts::new(
            "hub_webhook_dispatch_errors_total",
            "Errors encountered by the dispatch worker outside of outcome classification",
        ),
        &["reason"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registers exactly once");
    counter
});

/// Force every series above to register, so `render()` reflects them even at
/// zero. Call once at startup; harmless (and cheap) to call more than once.
pub fn init() {
    Lazy::force(&EVENTS_DISCARDED_TOTAL);
    Lazy::force(&FAN_OUT_DURATION_SECONDS);
    Lazy::force(&EVENT_CHANNEL_DEPTH);
    Lazy::force(&RIVER_QUEUE_DEPTH);
    Lazy::force(&WEBHOOK_JOBS_ENQUEUED_TOTAL);
    Lazy::force(&WEBHOOK_PROVIDER_ERRORS_TOTAL);
    Lazy::force(&WEBHOOK_DELIVERIES_TOTAL);
    Lazy::force(&WEBHOOK_DELIVERY_DURATION_SECONDS);
    Lazy::force(&WEBHOOK_DISABLED_TOTAL);
    Lazy::force(&WEBHOOK_DISPATCH_ERRORS_TOTAL);
}

/// Bounds the set of `reason` label values so a bug upstream can't create
/// unbounded series: anything not in the enumerated reason set collapses to
/// `"other"`.
fn normalize_reason(reason: &str, known: &[&str]) -> String {
    if known.contains(&reason) {
        reason.to_string()
    } else {
        "other".to_string()
    }
}

pub fn record_event_discarded(event_type: &EventType) {
    EVENTS_DISCARDED_TOTAL
        .with_label_values(&[event_type.metric_label()])
        .inc();
}

pub fn observe_fan_out_duration(event_type: &EventType, seconds: f64) {
    FAN_OUT_DURATION_SECONDS
        .with_label_values(&[event_type.metric_label()])
        .observe(seconds);
}

pub fn set_event_channel_depth(depth: i64) {
    EVENT_CHANNEL_DEPTH.set(depth);
}

pub fn set_river_queue_depth(depth: i64) {
    RIVER_QUEUE_DEPTH.set(depth);
}

pub fn record_webhook_jobs_enqueued(event_type: &EventType, count: u64) {
    WEBHOOK_JOBS_ENQUEUED_TOTAL
        .with_label_values(&[event_type.metric_label()])
        .inc_by(count as f64);
}

pub fn record_provider_error(reason: &str) {
    let reason = normalize_reason(reason, &["list_failed", "enqueue_failed", "fanout_clamped"]);
    WEBHOOK_PROVIDER_ERRORS_TOTAL
        .with_label_values(&[&reason])
        .inc();
}

pub fn record_delivery(event_type: &EventType, status: &str) {
    let status = normalize_reason(status, &["success", "retry", "failed_final"]);
    WEBHOOK_DELIVERIES_TOTAL
        .with_label_values(&[event_type.metric_label(), &status])
        .inc();
}

pub fn observe_delivery_duration(event_type: &EventType, status: &str, seconds: f64) {
    let status = normalize_reason(status, &["success", "retry", "failed_final"]);
    WEBHOOK_DELIVERY_DURATION_SECONDS
        .with_label_values(&[event_type.metric_label(), &status])
        .observe(seconds);
}

pub fn record_disabled(reason: &str) {
    let reason = normalize_reason(reason, &["410_gone", "max_attempts"]);
    WEBHOOK_DISABLED_TOTAL.with_label_values(&[&reason]).inc();
}

pub fn record_dispatch_error(reason: &str) {
    let reason = normalize_reason(reason, &["get_webhook_failed"]);
    WEBHOOK_DISPATCH_ERRORS_TOTAL
        .with_label_values(&[&reason])
        .inc();
}

/// Renders the registry in the Prometheus text exposition format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = String::new();
    encoder
        .encode_utf8(&families, &mut buf)
        .expect("encoding the registry to text never fails");
    buf
}
