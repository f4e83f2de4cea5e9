//! # feedback-hub-core
//!
//! The event fan-out and transactional webhook dispatch core behind the
//! feedback ingestion hub. This crate owns three things:
//!
//! - [`publisher::MessagePublisher`] — a bounded, non-blocking in-process
//!   event queue that fans published events out to registered [`provider::Provider`]s.
//! - [`provider::webhook::WebhookProvider`] — the one shipped provider,
//!   which resolves webhook subscribers for an event and enqueues one
//!   durable dispatch job per subscriber.
//! - [`worker::WebhookDispatchWorker`] — the pool that leases dispatch jobs
//!   from the [`store::JobStore`], signs and POSTs them, and drives the
//!   retry/disable state machine.
//!
//! Everything outside this boundary — HTTP handling, authentication, CRUD
//! endpoints, schema migrations, process lifecycle wrappers — is left to the
//! embedding application. [`Hub`] is the facade that application wires up
//! once at startup.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use feedback_hub_core::{Hub, HubConfig};
//! use feedback_hub_core::store::memory::InMemoryJobStore;
//! use feedback_hub_core::types::{Event, EventType};
//! use std::sync::Arc;
//!
//! # async fn example() -> feedback_hub_core::error::Result<()> {
//! let store = Arc::new(InMemoryJobStore::new());
//! let hub = Hub::start(HubConfig::default(), store);
//!
//! hub.publish(Event::new(
//!     EventType::feedback_record_created(),
//!     serde_json::json!({"id": "fbk_1"}),
//! ));
//!
//! hub.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod metrics;
pub mod provider;
pub mod publisher;
pub mod sender;
pub mod store;
pub mod types;
pub mod worker;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use config::HubConfig;
pub use error::{HubError, Result};
pub use provider::Provider;
pub use publisher::MessagePublisher;
pub use sender::WebhookSender;
pub use store::JobStore;
pub use types::{DisabledReason, Event, EventType, JobState, Outcome};
pub use worker::WebhookDispatchWorker;

/// Top-level facade wiring the publisher, the webhook provider, and the
/// dispatch worker pool against one [`JobStore`].
///
/// `Hub` owns the in-process halves of the pipeline end to end:
/// `publish(event)` → [`MessagePublisher`] → [`provider::webhook::WebhookProvider`]
/// → [`JobStore`] → [`WebhookDispatchWorker`] pool → [`WebhookSender`].
/// Constructing it starts the publisher's dequeue task and the worker pool
/// immediately; [`Hub::shutdown`] stops them in the declared order.
pub struct Hub {
    publisher: MessagePublisher,
    store: Arc<dyn JobStore>,
    worker_shutdown: watch::Sender<bool>,
    worker_handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
    shutdown_timeout: std::time::Duration,
}

impl Hub {
    /// Wires the core against `store` using `config`, starting the
    /// publisher's dequeue loop and the dispatch worker pool immediately.
    ///
    /// Providers are registered once here and never change afterward: the
    /// webhook provider is the only variant currently shipped.
    pub fn start(config: HubConfig, store: Arc<dyn JobStore>) -> Self {
        metrics::init();

        let webhook_provider = Arc::new(provider::webhook::WebhookProvider::new(
            Arc::clone(&store),
            config.webhook.max_fan_out_per_event,
            config.webhook.delivery_max_attempts,
        ));

        let publisher = MessagePublisher::start(
            config.publisher.buffer_size,
            config.publisher.per_event_timeout(),
            vec![webhook_provider as Arc<dyn Provider>],
        );

        let sender = Arc::new(WebhookSender::new());
        let worker = Arc::new(WebhookDispatchWorker::new(
            Arc::clone(&store),
            sender,
            config.webhook.job_lease_ttl(),
            config.webhook.backoff_base_secs,
            config.webhook.backoff_cap_secs,
        ));

        let (worker_shutdown_tx, worker_shutdown_rx) = watch::channel(false);
        let worker_handles = worker.spawn_pool(
            config.webhook.delivery_max_concurrent,
            config.webhook.queue_depth_poll_interval(),
            worker_shutdown_rx,
        );

        Self {
            publisher,
            store,
            worker_shutdown: worker_shutdown_tx,
            worker_handles: std::sync::Mutex::new(worker_handles),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }

    /// Non-blocking publish; see [`MessagePublisher::publish`]. Callers in
    /// the ingress path never observe backpressure from this call.
    pub fn publish(&self, event: Event) {
        self.publisher.publish(event);
    }

    /// A handle to the underlying store, for embedders that also need to
    /// run the CRUD side of the webhooks repository directly.
    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.store)
    }

    /// Graceful shutdown, in order: stop accepting new work at the
    /// publisher (already true once we start draining), drain the
    /// publisher's queue, stop the worker pool, then return. The store
    /// itself is owned by the embedder and is not closed here.
    ///
    /// Bounded by `ShutdownTimeout`; workers that don't finish their
    /// in-flight send within the budget are abandoned and their jobs will
    /// be re-leased once the job's lease expires (at-least-once).
    pub async fn shutdown(&self) {
        self.publisher.shutdown().await;

        let _ = self.worker_shutdown.send(true);
        let handles = {
            let mut guard = self
                .worker_handles
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };

        let join_all = futures::future::join_all(handles);
        if tokio::time::timeout(self.shutdown_timeout, join_all)
            .await
            .is_err()
        {
            tracing::warn!("worker pool did not stop within shutdown timeout; abandoning in-flight jobs");
        }
    }
}
