//! `WebhookDispatchWorker` — leases durable jobs and drives the retry/disable
//! state machine.

use std::sync::Arc;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::metrics;
use crate::sender::WebhookSender;
use crate::store::{FailOutcome, Job, JobStore};
use crate::types::{DisabledReason, EventType, Outcome};

/// Computes the next retry delay with full jitter:
/// `min(cap, base * 2^(attempt-1)) * rand(0.5, 1.5)`.
pub fn backoff_delay(attempt: i32, base_secs: i64, cap_secs: i64) -> chrono::Duration {
    let exponent = (attempt - 1).max(0) as u32;
    let unjittered = base_secs.saturating_mul(1i64.checked_shl(exponent).unwrap_or(i64::MAX).max(1));
    let capped = unjittered.min(cap_secs).max(0);
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    let jittered = (capped as f64 * jitter).round() as i64;
    chrono::Duration::seconds(jittered.max(0))
}

/// Consumes leased dispatch jobs: loads the subscription, signs and POSTs
/// the payload, and feeds the outcome into the retry/disable state machine.
pub struct WebhookDispatchWorker {
    store: Arc<dyn JobStore>,
    sender: Arc<WebhookSender>,
    queue_name: &'static str,
    lease_ttl: chrono::Duration,
    backoff_base_secs: i64,
    backoff_cap_secs: i64,
}

impl WebhookDispatchWorker {
    pub fn new(
        store: Arc<dyn JobStore>,
        sender: Arc<WebhookSender>,
        lease_ttl: chrono::Duration,
        backoff_base_secs: i64,
        backoff_cap_secs: i64,
    ) -> Self {
        Self {
            store,
            sender,
            queue_name: "webhooks",
            lease_ttl,
            backoff_base_secs,
            backoff_cap_secs,
        }
    }

    /// Spawns `concurrency` independent lease-then-execute loops plus a
    /// queue-depth poller, all honoring `shutdown`.
    /// Returns their join handles so the embedder can await a clean stop.
    pub fn spawn_pool(
        self: Arc<Self>,
        concurrency: usize,
        poll_interval: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(concurrency + 1);

        for worker_id in 0..concurrency {
            let this = Arc::clone(&self);
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                this.run_loop(worker_id, &mut shutdown).await;
            }));
        }

        let depth_store = Arc::clone(&self.store);
        let queue_name = self.queue_name;
        handles.push(tokio::spawn(async move {
            run_queue_depth_poller(depth_store, queue_name, poll_interval, &mut shutdown).await;
        }));

        handles
    }

    async fn run_loop(&self, worker_id: usize, shutdown: &mut watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            let leased = self
                .store
                .lease(self.queue_name, 1, self.lease_ttl)
                .await;

            let jobs = match leased {
                Ok(jobs) => jobs,
                Err(err) => {
                    tracing::error!(worker_id, error = %err, "failed to lease dispatch job");
                    metrics::record_dispatch_error("get_webhook_failed");
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(250)) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            for job in jobs {
                if let Err(err) = self.process_job(job).await {
                    tracing::error!(worker_id, error = %err, "error while processing dispatch job");
                }
            }
        }
    }

    /// Runs the retry/disable state machine for a single leased job.
    async fn process_job(&self, job: Job) -> Result<()> {
        let event_type = EventType::new(job.event_type.clone());
        let span = tracing::info_span!(
            "webhook_dispatch_worker.process_job",
            job_id = %job.id,
            subscription_id = %job.subscription_id,
            attempt = job.attempt,
        );
        let _guard = span.enter();

        let subscription = match self.store.get_webhook(job.subscription_id).await {
            Ok(Some(sub)) => sub,
            Ok(None) => {
                tracing::info!("subscription no longer exists, completing job without delivery");
                drop(_guard);
                return self.store.complete(job.id).await;
            }
            Err(err) => {
                metrics::record_dispatch_error("get_webhook_failed");
                tracing::error!(error = %err, "failed to load subscription for dispatch job");
                drop(_guard);
                return Err(err);
            }
        };

        if !subscription.enabled {
            tracing::info!("subscription disabled, completing job without delivery");
            drop(_guard);
            return self.store.complete(job.id).await;
        }

        let body = serde_json::to_vec(&job.args.payload_json)?;
        let is_last_attempt = job.attempt >= job.max_attempts;
        let outcome = self
            .sender
            .send(&subscription, &event_type, &body, is_last_attempt)
            .await?;

        drop(_guard);
        self.apply_outcome(&job, &subscription, outcome).await
    }

    async fn apply_outcome(
        &self,
        job: &Job,
        subscription: &crate::store::Webhook,
        outcome: Outcome,
    ) -> Result<()> {
        match outcome {
            Outcome::Success => {
                self.store.complete(job.id).await?;
                self.store.reset_failures(subscription.id).await?;
                Ok(())
            }
            Outcome::Gone => {
                self.store
                    .discard(job.id, "subscriber returned 410 Gone")
                    .await?;
                self.store
                    .disable_webhook(subscription.id, DisabledReason::Gone410)
                    .await?;
                metrics::record_disabled(DisabledReason::Gone410.as_str());
                Ok(())
            }
            Outcome::RetryableFailure | Outcome::ClientError => {
                let delay = backoff_delay(job.attempt, self.backoff_base_secs, self.backoff_cap_secs);
                let error_message = match outcome {
                    Outcome::RetryableFailure => "delivery failed (retryable)",
                    _ => "delivery rejected with a non-terminal client error",
                };

                self.store.increment_failures(subscription.id).await?;

                match self.store.fail(job.id, error_message, delay).await? {
                    FailOutcome::Retryable => Ok(()),
                    FailOutcome::Exhausted => {
                        self.store
                            .disable_webhook(subscription.id, DisabledReason::MaxAttempts)
                            .await?;
                        metrics::record_disabled(DisabledReason::MaxAttempts.as_str());
                        Ok(())
                    }
                }
            }
        }
    }
}

async fn run_queue_depth_poller(
    store: Arc<dyn JobStore>,
    queue_name: &'static str,
    interval: std::time::Duration,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.queue_depth(queue_name).await {
                    Ok(depth) => metrics::set_river_queue_depth(depth),
                    Err(err) => tracing::warn!(error = %err, "failed to sample queue depth"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_monotonically_bounded_by_cap() {
        for attempt in 1..=12 {
            let delay = backoff_delay(attempt, 1, 3600);
            assert!(delay.num_seconds() <= 3600 + 1);
            assert!(delay.num_seconds() >= 0);
        }
    }

    #[test]
    fn backoff_grows_with_attempt_before_capping() {
        // Use the midpoint of the jitter range by sampling repeatedly; the
        // *ceiling* (pre-jitter max) should strictly grow until the cap.
        let base = 1;
        let cap = 1000;
        let d1 = (2f64.powi(0) * base as f64) as i64;
        let d4 = (2f64.powi(3) * base as f64) as i64;
        assert!(d4 > d1);
        assert!(d4 <= cap);
    }

    #[tokio::test]
    async fn success_completes_job_and_resets_failures() {
        use crate::store::memory::InMemoryJobStore;
        use crate::store::{JobArgs, NewJob, NewWebhook};
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryJobStore::new());
        let webhook = store
            .insert_webhook(
                NewWebhook {
                    tenant_scope: None,
                    url: server.uri(),
                    signing_key: vec![0x11; 32],
                    event_types: vec!["feedback_record.created".to_string()],
                },
                100,
            )
            .await
            .unwrap();

        store
            .insert_many(vec![NewJob {
                queue: "webhooks".to_string(),
                subscription_id: webhook.id,
                event_type: "feedback_record.created".to_string(),
                event_timestamp: 1000,
                args: JobArgs {
                    payload_json: serde_json::json!({"type": "feedback_record.created"}),
                    changed_fields: None,
                },
                unique_key: "k1".to_string(),
                max_attempts: 8,
            }])
            .await
            .unwrap();

        let leased = store
            .lease("webhooks", 1, chrono::Duration::seconds(60))
            .await
            .unwrap();

        let worker = WebhookDispatchWorker::new(
            store.clone(),
            Arc::new(WebhookSender::new()),
            chrono::Duration::seconds(60),
            1,
            3600,
        );
        worker.process_job(leased[0].clone()).await.unwrap();

        assert_eq!(store.queue_depth("webhooks").await.unwrap(), 0);
        let reloaded = store.get_webhook(webhook.id).await.unwrap().unwrap();
        assert_eq!(reloaded.consecutive_failures, 0);
        assert!(reloaded.enabled);
    }

    #[tokio::test]
    async fn gone_disables_subscription() {
        use crate::store::memory::InMemoryJobStore;
        use crate::store::{JobArgs, NewJob, NewWebhook};
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryJobStore::new());
        let webhook = store
            .insert_webhook(
                NewWebhook {
                    tenant_scope: None,
                    url: server.uri(),
                    signing_key: vec![0x11; 32],
                    event_types: vec!["feedback_record.created".to_string()],
                },
                100,
            )
            .await
            .unwrap();

        store
            .insert_many(vec![NewJob {
                queue: "webhooks".to_string(),
                subscription_id: webhook.id,
                event_type: "feedback_record.created".to_string(),
                event_timestamp: 1000,
                args: JobArgs {
                    payload_json: serde_json::json!({}),
                    changed_fields: None,
                },
                unique_key: "k1".to_string(),
                max_attempts: 8,
            }])
            .await
            .unwrap();

        let leased = store
            .lease("webhooks", 1, chrono::Duration::seconds(60))
            .await
            .unwrap();

        let worker = WebhookDispatchWorker::new(
            store.clone(),
            Arc::new(WebhookSender::new()),
            chrono::Duration::seconds(60),
            1,
            3600,
        );
        worker.process_job(leased[0].clone()).await.unwrap();

        let reloaded = store.get_webhook(webhook.id).await.unwrap().unwrap();
        assert!(!reloaded.enabled);
        assert_eq!(reloaded.disabled_reason.as_deref(), Some("410_gone"));
    }

    #[tokio::test]
    async fn retryable_failure_reschedules_until_exhausted() {
        use crate::store::memory::InMemoryJobStore;
        use crate::store::{JobArgs, NewJob, NewWebhook};
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryJobStore::new());
        let webhook = store
            .insert_webhook(
                NewWebhook {
                    tenant_scope: None,
                    url: server.uri(),
                    signing_key: vec![0x11; 32],
                    event_types: vec!["feedback_record.created".to_string()],
                },
                100,
            )
            .await
            .unwrap();

        store
            .insert_many(vec![NewJob {
                queue: "webhooks".to_string(),
                subscription_id: webhook.id,
                event_type: "feedback_record.created".to_string(),
                event_timestamp: 1000,
                args: JobArgs {
                    payload_json: serde_json::json!({}),
                    changed_fields: None,
                },
                unique_key: "k1".to_string(),
                max_attempts: 2,
            }])
            .await
            .unwrap();

        let worker = WebhookDispatchWorker::new(
            store.clone(),
            Arc::new(WebhookSender::new()),
            chrono::Duration::seconds(0),
            0,
            0,
        );

        for _ in 0..2 {
            let leased = store
                .lease("webhooks", 1, chrono::Duration::seconds(0))
                .await
                .unwrap();
            worker.process_job(leased[0].clone()).await.unwrap();
        }

        let reloaded = store.get_webhook(webhook.id).await.unwrap().unwrap();
        assert!(!reloaded.enabled);
        assert_eq!(reloaded.disabled_reason.as_deref(), Some("max_attempts"));
    }

    #[tokio::test]
    async fn only_the_exhausting_attempt_is_recorded_as_failed_final() {
        use crate::store::memory::InMemoryJobStore;
        use crate::store::{JobArgs, NewJob, NewWebhook};
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        // Metrics live on one process-wide registry shared by every test in
        // this binary; a label unused anywhere else keeps the counts below
        // deterministic regardless of what else is running concurrently.
        let event_type = "worker_metrics_label_test.exhausted";

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryJobStore::new());
        let webhook = store
            .insert_webhook(
                NewWebhook {
                    tenant_scope: None,
                    url: server.uri(),
                    signing_key: vec![0x11; 32],
                    event_types: vec![event_type.to_string()],
                },
                100,
            )
            .await
            .unwrap();

        store
            .insert_many(vec![NewJob {
                queue: "webhooks".to_string(),
                subscription_id: webhook.id,
                event_type: event_type.to_string(),
                event_timestamp: 1000,
                args: JobArgs {
                    payload_json: serde_json::json!({}),
                    changed_fields: None,
                },
                unique_key: "worker-metrics-label-test".to_string(),
                max_attempts: 3,
            }])
            .await
            .unwrap();

        let worker = WebhookDispatchWorker::new(
            store.clone(),
            Arc::new(WebhookSender::new()),
            chrono::Duration::seconds(0),
            0,
            0,
        );

        for attempt in 1..=3 {
            let leased = store
                .lease("webhooks", 1, chrono::Duration::seconds(0))
                .await
                .unwrap();
            assert_eq!(leased[0].attempt, attempt);
            worker.process_job(leased[0].clone()).await.unwrap();
        }

        let rendered = crate::metrics::render();
        assert!(rendered.contains(&format!(
            "hub_webhook_deliveries_total{{event_type=\"{event_type}\",status=\"retry\"}} 2"
        )));
        assert!(rendered.contains(&format!(
            "hub_webhook_deliveries_total{{event_type=\"{event_type}\",status=\"failed_final\"}} 1"
        )));
    }
}
