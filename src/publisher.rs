//! `MessagePublisher` — the bounded in-process event fan-out core.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::metrics;
use crate::provider::Provider;
use crate::types::Event;

/// Non-blocking, drop-on-full event fan-out to a fixed, write-once-at-startup
/// set of [`Provider`]s.
///
/// `Publish` never blocks and never fails the caller: on a full queue the
/// event is dropped and `hub_events_discarded_total` is incremented. Providers are invoked sequentially, in registration
/// order, from the single dequeue task under a per-event deadline.
pub struct MessagePublisher {
    sender: StdMutex<Option<mpsc::Sender<Event>>>,
    depth: Arc<AtomicI64>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl MessagePublisher {
    /// Builds a publisher and starts its single dequeue task immediately.
    /// `providers` are invoked in the order given, for every event, until
    /// [`MessagePublisher::shutdown`] is called.
    pub fn start(
        buffer_size: usize,
        per_event_timeout: std::time::Duration,
        providers: Vec<Arc<dyn Provider>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(buffer_size.max(1));
        let depth = Arc::new(AtomicI64::new(0));

        let worker = tokio::spawn(run_dequeue_loop(rx, providers, per_event_timeout, Arc::clone(&depth)));

        Self {
            sender: StdMutex::new(Some(tx)),
            depth,
            worker: Mutex::new(Some(worker)),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Attempts to enqueue `event`. Never blocks; drops silently (with a
    /// metric bump) if the queue is full or the publisher has shut down.
    pub fn publish(&self, event: Event) {
        let sender = {
            let guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };

        let Some(sender) = sender else {
            metrics::record_event_discarded(&event.event_type);
            return;
        };

        match sender.try_send(event) {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::AcqRel);
                metrics::set_event_channel_depth(self.depth.load(Ordering::Acquire));
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                metrics::record_event_discarded(&event.event_type);
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                metrics::record_event_discarded(&event.event_type);
            }
        }
    }

    /// Closes the input queue, drains whatever is already enqueued (each
    /// honoring its per-event deadline), then returns. Idempotent: a second
    /// call is a no-op. After this returns, `publish` is a no-op.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        // Dropping the last sender closes the channel so the dequeue loop
        // drains whatever is already buffered and exits on `None`.
        {
            let mut guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
            guard.take();
        }

        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run_dequeue_loop(
    mut rx: mpsc::Receiver<Event>,
    providers: Vec<Arc<dyn Provider>>,
    per_event_timeout: std::time::Duration,
    depth: Arc<AtomicI64>,
) {
    while let Some(event) = rx.recv().await {
        depth.fetch_sub(1, Ordering::AcqRel);
        metrics::set_event_channel_depth(depth.load(Ordering::Acquire).max(0));

        let span = tracing::info_span!(
            "message_publisher.fan_out",
            event_type = %event.event_type,
            event_timestamp = event.timestamp,
        );
        let _guard = span.enter();

        let start = Instant::now();
        let outcome = tokio::time::timeout(per_event_timeout, invoke_providers(&providers, &event)).await;
        let elapsed = start.elapsed().as_secs_f64();
        metrics::observe_fan_out_duration(&event.event_type, elapsed);

        if outcome.is_err() {
            tracing::warn!("per-event fan-out deadline exceeded; remaining providers skipped");
        }
        drop(_guard);
    }
}

async fn invoke_providers(providers: &[Arc<dyn Provider>], event: &Event) {
    for provider in providers {
        if let Err(err) = provider.on_event(event).await {
            tracing::error!(provider = provider.name(), error = %err, "provider failed to handle event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingProvider {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Provider for CountingProvider {
        async fn on_event(&self, _event: &Event) -> Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    #[tokio::test]
    async fn publish_invokes_registered_providers() {
        let count = Arc::new(AtomicUsize::new(0));
        let provider = Arc::new(CountingProvider {
            count: count.clone(),
        });
        let publisher = MessagePublisher::start(16, Duration::from_secs(1), vec![provider]);

        publisher.publish(Event::new(
            crate::types::EventType::feedback_record_created(),
            serde_json::json!({}),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn overflow_drops_events_without_erroring_caller() {
        struct BlockingProvider;
        #[async_trait]
        impl Provider for BlockingProvider {
            async fn on_event(&self, _event: &Event) -> Result<()> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }
            fn name(&self) -> &str {
                "blocking"
            }
        }

        let publisher = MessagePublisher::start(2, Duration::from_millis(50), vec![Arc::new(BlockingProvider)]);

        for _ in 0..10 {
            publisher.publish(Event::new(
                crate::types::EventType::feedback_record_created(),
                serde_json::json!({}),
            ));
        }
        // All 10 calls returned without panicking or blocking; that is the
        // entire contract under test.
    }

    #[tokio::test]
    async fn publish_after_shutdown_is_a_no_op() {
        let publisher = MessagePublisher::start(4, Duration::from_secs(1), vec![]);
        publisher.shutdown().await;
        publisher.publish(Event::new(
            crate::types::EventType::feedback_record_created(),
            serde_json::json!({}),
        ));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let publisher = MessagePublisher::start(4, Duration::from_secs(1), vec![]);
        publisher.shutdown().await;
        publisher.shutdown().await;
    }
}
