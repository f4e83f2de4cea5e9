//! `WebhookSender` — signs and POSTs one delivery attempt, classifying the
//! response into an [`Outcome`].

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use reqwest::Client;

use crate::crypto::{delivery_webhook_id, WebhookSigner};
use crate::error::Result;
use crate::metrics;
use crate::store::Webhook;
use crate::types::{EventType, Outcome};

/// Fixed per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WebhookSender {
    client: Client,
}

impl WebhookSender {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("building the reqwest client with a fixed timeout never fails"),
        }
    }

    /// Signs `body` for `subscription` and POSTs it, returning the
    /// classified [`Outcome`]. Records the delivery duration and count
    /// metrics before returning; `event_type` is for labels only.
    ///
    /// `is_last_attempt` tells the metrics label whether a retryable outcome
    /// here is actually terminal (attempt == max_attempts), so the caller's
    /// retry/disable bookkeeping and the `hub_webhook_deliveries_total`
    /// status label agree on which attempt was the final one.
    pub async fn send(
        &self,
        subscription: &Webhook,
        event_type: &EventType,
        body: &[u8],
        is_last_attempt: bool,
    ) -> Result<Outcome> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let webhook_id = delivery_webhook_id(&subscription.id, nanos);
        let signature = WebhookSigner::sign_header(
            &subscription.signing_key,
            &webhook_id,
            timestamp,
            body,
        )?;

        let span = tracing::info_span!(
            "webhook_sender.send",
            subscription_id = %subscription.id,
            webhook_id = %webhook_id,
        );
        let _guard = span.enter();

        let start = Instant::now();
        let result = self
            .client
            .post(&subscription.url)
            .header("Content-Type", "application/json")
            .header("webhook-id", &webhook_id)
            .header("webhook-timestamp", timestamp.to_string())
            .header("webhook-signature", &signature)
            .body(body.to_vec())
            .send()
            .await;
        let elapsed = start.elapsed().as_secs_f64();

        let outcome = match result {
            Ok(response) => classify_status(response.status().as_u16()),
            Err(err) => {
                tracing::warn!(error = %err, "webhook delivery request failed");
                Outcome::RetryableFailure
            }
        };

        let status_label = outcome.delivery_status_label(is_last_attempt);
        metrics::record_delivery(event_type, status_label);
        metrics::observe_delivery_duration(event_type, status_label, elapsed);

        drop(_guard);
        Ok(outcome)
    }
}

impl Default for WebhookSender {
    fn default() -> Self {
        Self::new()
    }
}

fn classify_status(status: u16) -> Outcome {
    match status {
        200..=299 => Outcome::Success,
        410 => Outcome::Gone,
        429 => Outcome::RetryableFailure,
        500..=599 => Outcome::RetryableFailure,
        400..=499 => Outcome::ClientError,
        _ => Outcome::RetryableFailure,
    }
}
