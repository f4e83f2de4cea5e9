//! `WebhookProvider` — turns one published event into N durable dispatch
//! jobs, one per matching subscription.

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::Provider;
use crate::error::Result;
use crate::metrics;
use crate::store::{JobStore, NewJob};
use crate::types::{Event, WebhookPayload};

/// Converts events into enqueued webhook dispatch jobs.
///
/// Holds only a store handle and the two config knobs it needs directly;
/// everything else (signing, sending, retry policy) lives downstream in the
/// worker, which is deliberately a separate concern from fan-out.
pub struct WebhookProvider {
    store: Arc<dyn JobStore>,
    max_fan_out_per_event: usize,
    delivery_max_attempts: i32,
    queue_name: &'static str,
}

impl WebhookProvider {
    pub fn new(
        store: Arc<dyn JobStore>,
        max_fan_out_per_event: usize,
        delivery_max_attempts: i32,
    ) -> Self {
        Self {
            store,
            max_fan_out_per_event,
            delivery_max_attempts,
            queue_name: "webhooks",
        }
    }

    fn payload_hash(body: &[u8]) -> String {
        let digest = Sha256::digest(body);
        hex_encode(&digest)
    }
}

#[async_trait]
impl Provider for WebhookProvider {
    async fn on_event(&self, event: &Event) -> Result<()> {
        let span = tracing::info_span!(
            "webhook_provider.on_event",
            event_type = %event.event_type,
            event_timestamp = event.timestamp,
        );
        let _guard = span.enter();

        let mut subscriptions = match self
            .store
            .list_enabled_for_event(event.event_type.as_str(), event.tenant_scope.as_deref())
            .await
        {
            Ok(subs) => subs,
            Err(err) => {
                metrics::record_provider_error("list_failed");
                tracing::error!(error = %err, "failed to resolve webhook subscribers");
                return Err(err);
            }
        };

        if subscriptions.len() > self.max_fan_out_per_event {
            subscriptions.sort_by_key(|w| w.id);
            subscriptions.truncate(self.max_fan_out_per_event);
            metrics::record_provider_error("fanout_clamped");
            tracing::warn!(
                limit = self.max_fan_out_per_event,
                "fan-out clamped for event"
            );
        }

        if subscriptions.is_empty() {
            drop(_guard);
            return Ok(());
        }

        let payload = WebhookPayload::from_event(event);
        let body = payload.to_bytes()?;
        let hash = Self::payload_hash(&body);

        let jobs: Vec<NewJob> = subscriptions
            .iter()
            .map(|sub| NewJob {
                queue: self.queue_name.to_string(),
                subscription_id: sub.id,
                event_type: event.event_type.as_str().to_string(),
                event_timestamp: event.timestamp,
                args: crate::store::JobArgs {
                    payload_json: serde_json::to_value(&payload).unwrap_or(serde_json::Value::Null),
                    changed_fields: event.changed_fields.clone(),
                },
                unique_key: format!(
                    "{}:{}:{}:{}",
                    sub.id, event.event_type, event.timestamp, hash
                ),
                max_attempts: self.delivery_max_attempts,
            })
            .collect();

        let candidates = jobs.len() as u64;
        match self.store.insert_many(jobs).await {
            Ok(inserted) => {
                metrics::record_webhook_jobs_enqueued(&event.event_type, inserted as u64);
                tracing::info!(
                    candidates,
                    inserted,
                    "webhook dispatch jobs enqueued"
                );
                Ok(())
            }
            Err(err) => {
                metrics::record_provider_error("enqueue_failed");
                tracing::error!(error = %err, "failed to enqueue webhook dispatch jobs");
                Err(err)
            }
        }
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{b:02x}").expect("writing to a String never fails");
    }
    out
}
