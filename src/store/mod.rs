//! The relational store: `WebhooksRepository` + `JobQueue`.
//!
//! Both repositories are expressed against a single [`JobStore`] trait so the
//! rest of the core — [`crate::provider::webhook::WebhookProvider`] and
//! [`crate::worker::WebhookDispatchWorker`] — can be exercised in tests
//! against [`memory::InMemoryJobStore`] without a live Postgres instance.
//! [`postgres::DieselPostgresStore`] is the only production implementation.

pub mod memory;
pub mod postgres;
pub mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::WebhookSigner;
use crate::error::{HubError, Result};
use crate::types::{DisabledReason, JobState};

/// A subscription's URL scheme must be `http` or `https`. Shared by every
/// [`JobStore`] implementation's `insert_webhook` so the check can't drift
/// between backends.
pub fn validate_webhook_url(url: &str) -> Result<()> {
    let parsed = url::Url::parse(url).map_err(|e| HubError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(HubError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}

/// A subscription's signing secret must be at least [`WebhookSigner::MIN_SECRET_LEN`]
/// bytes (§3). Shared by every [`JobStore`] implementation's `insert_webhook`
/// so the check can't drift between backends; no subscription id exists yet
/// at insert time, so the error carries an empty one like `WebhookSigner`'s
/// own key-construction failure does.
pub fn validate_signing_key(signing_key: &[u8]) -> Result<()> {
    if signing_key.len() < WebhookSigner::MIN_SECRET_LEN {
        return Err(HubError::InvalidSigningKey {
            subscription_id: String::new(),
            reason: format!(
                "signing key must be at least {} bytes, got {}",
                WebhookSigner::MIN_SECRET_LEN,
                signing_key.len()
            ),
        });
    }
    Ok(())
}

/// A persisted webhook subscription row.
#[derive(Debug, Clone, PartialEq)]
pub struct Webhook {
    pub id: Uuid,
    pub tenant_scope: Option<String>,
    pub url: String,
    pub signing_key: Vec<u8>,
    pub event_types: Vec<String>,
    pub enabled: bool,
    pub consecutive_failures: i32,
    pub disabled_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Webhook {
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.enabled && self.event_types.iter().any(|t| t == event_type)
    }
}

/// Arguments to create a new webhook subscription.
#[derive(Debug, Clone)]
pub struct NewWebhook {
    pub tenant_scope: Option<String>,
    pub url: String,
    pub signing_key: Vec<u8>,
    pub event_types: Vec<String>,
}

/// The serialized event envelope stored in a job's `args_json` column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobArgs {
    pub payload_json: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed_fields: Option<Vec<String>>,
}

/// A durable dispatch job row.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    pub state: JobState,
    pub subscription_id: Uuid,
    pub event_type: String,
    pub event_timestamp: i64,
    pub args: JobArgs,
    pub unique_key: String,
    pub attempt: i32,
    pub max_attempts: i32,
    pub scheduled_at: DateTime<Utc>,
    pub leased_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

/// Arguments to enqueue one dispatch job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue: String,
    pub subscription_id: Uuid,
    pub event_type: String,
    pub event_timestamp: i64,
    pub args: JobArgs,
    pub unique_key: String,
    pub max_attempts: i32,
}

/// What happened to a job after [`JobStore::fail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// `attempt < max_attempts`: rescheduled into `retryable`.
    Retryable,
    /// `attempt == max_attempts`: transitioned into `discarded`.
    Exhausted,
}

/// The relational store behind both the webhooks repository and the
/// durable job queue.
#[async_trait]
pub trait JobStore: Send + Sync {
    // -- WebhooksRepository --------------------------------------------

    /// Inserts a new subscription, enforcing `max_count` for its tenant
    /// scope). Returns [`crate::error::HubError::SubscriptionLimitReached`]
    /// when the tenant is already at capacity.
    async fn insert_webhook(&self, args: NewWebhook, max_count: i64) -> Result<Webhook>;

    async fn get_webhook(&self, id: Uuid) -> Result<Option<Webhook>>;

    /// All enabled subscriptions whose `event_types` contains `event_type`
    /// and whose tenant scope matches (or is unset), ordered by ascending
    /// id so callers can clamp fan-out deterministically.
    async fn list_enabled_for_event(
        &self,
        event_type: &str,
        tenant_scope: Option<&str>,
    ) -> Result<Vec<Webhook>>;

    async fn disable_webhook(&self, id: Uuid, reason: DisabledReason) -> Result<()>;

    async fn reset_failures(&self, id: Uuid) -> Result<()>;

    async fn increment_failures(&self, id: Uuid) -> Result<i32>;

    // -- JobQueue ---------------------------------------------------------

    /// Atomically inserts a batch, skipping rows whose `unique_key` already
    /// exists. Returns the number of rows actually inserted.
    async fn insert_many(&self, jobs: Vec<NewJob>) -> Result<usize>;

    /// Leases up to `n` leasable rows (`available`/`retryable` with
    /// `scheduled_at <= now`, or any row whose previous lease has expired)
    /// and transitions them to `running`.
    async fn lease(&self, queue: &str, n: i64, lease_ttl: chrono::Duration) -> Result<Vec<Job>>;

    async fn complete(&self, job_id: Uuid) -> Result<()>;

    /// Records a failed attempt. Reschedules with `next_delay` if the job
    /// has attempts remaining, otherwise discards it.
    async fn fail(
        &self,
        job_id: Uuid,
        error: &str,
        next_delay: chrono::Duration,
    ) -> Result<FailOutcome>;

    async fn discard(&self, job_id: Uuid, error: &str) -> Result<()>;

    async fn cancel(&self, job_id: Uuid) -> Result<()>;

    /// Count of rows in a non-terminal state, for `hub_river_queue_depth`.
    async fn queue_depth(&self, queue: &str) -> Result<i64>;
}
