//! Diesel + r2d2 backed [`JobStore`].
//!
//! Diesel's connection API is synchronous, so every operation is dispatched
//! onto a blocking thread via `tokio::task::spawn_blocking` and the pooled
//! connection is borrowed only for the duration of that closure.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::pg::expression::array_comparison::ArrayExpressionMethods;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use uuid::Uuid;

use super::schema::{webhook_jobs, webhooks};
use super::{FailOutcome, Job, JobArgs, JobStore, NewJob, NewWebhook, Webhook};
use crate::config::DatabaseConfig;
use crate::error::{HubError, Result};
use crate::types::{DisabledReason, JobState};

type PgPool = Pool<ConnectionManager<PgConnection>>;

#[derive(Debug, Clone, Queryable)]
struct WebhookRow {
    id: Uuid,
    tenant_scope: Option<String>,
    url: String,
    signing_key: Vec<u8>,
    event_types: Vec<String>,
    enabled: bool,
    consecutive_failures: i32,
    disabled_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<WebhookRow> for Webhook {
    fn from(row: WebhookRow) -> Self {
        Webhook {
            id: row.id,
            tenant_scope: row.tenant_scope,
            url: row.url,
            signing_key: row.signing_key,
            event_types: row.event_types,
            enabled: row.enabled,
            consecutive_failures: row.consecutive_failures,
            disabled_reason: row.disabled_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = webhooks)]
struct InsertWebhookRow<'a> {
    id: Uuid,
    tenant_scope: Option<&'a str>,
    url: &'a str,
    signing_key: &'a [u8],
    event_types: &'a [String],
    enabled: bool,
    consecutive_failures: i32,
}

#[derive(Debug, Clone, Queryable)]
struct JobRow {
    id: Uuid,
    queue: String,
    state: String,
    subscription_id: Uuid,
    event_type: String,
    event_timestamp: i64,
    args_json: serde_json::Value,
    unique_key: String,
    attempt: i32,
    max_attempts: i32,
    scheduled_at: DateTime<Utc>,
    leased_until: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    finalized_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = HubError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            id: row.id,
            queue: row.queue,
            state: parse_job_state(&row.state)?,
            subscription_id: row.subscription_id,
            event_type: row.event_type,
            event_timestamp: row.event_timestamp,
            args: serde_json::from_value(row.args_json)?,
            unique_key: row.unique_key,
            attempt: row.attempt,
            max_attempts: row.max_attempts,
            scheduled_at: row.scheduled_at,
            leased_until: row.leased_until,
            last_error: row.last_error,
            created_at: row.created_at,
            finalized_at: row.finalized_at,
        })
    }
}

fn parse_job_state(raw: &str) -> Result<JobState> {
    match raw {
        "available" => Ok(JobState::Available),
        "scheduled" => Ok(JobState::Scheduled),
        "running" => Ok(JobState::Running),
        "retryable" => Ok(JobState::Retryable),
        "completed" => Ok(JobState::Completed),
        "cancelled" => Ok(JobState::Cancelled),
        "discarded" => Ok(JobState::Discarded),
        other => Err(HubError::Config(format!("unknown job state '{other}' in store"))),
    }
}

#[derive(Insertable)]
#[diesel(table_name = webhook_jobs)]
struct InsertJobRow {
    id: Uuid,
    queue: String,
    state: String,
    subscription_id: Uuid,
    event_type: String,
    event_timestamp: i64,
    args_json: serde_json::Value,
    unique_key: String,
    attempt: i32,
    max_attempts: i32,
    scheduled_at: DateTime<Utc>,
}

/// The relational store behind both the webhooks repository and the durable
/// job queue, backed by a pooled Postgres connection.
pub struct DieselPostgresStore {
    pool: Arc<PgPool>,
}

impl DieselPostgresStore {
    /// Builds a connection pool from `config` and wraps it as a store.
    pub fn connect(config: &DatabaseConfig) -> Result<Self> {
        let manager = ConnectionManager::<PgConnection>::new(&config.url);
        let pool = Pool::builder()
            .max_size(config.max_connections)
            .build(manager)
            .map_err(|e| HubError::Config(format!("failed to build connection pool: {e}")))?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    async fn run_blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = Arc::clone(&self.pool);
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(HubError::from)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| HubError::Config(format!("blocking store task panicked: {e}")))?
    }
}

#[async_trait]
impl JobStore for DieselPostgresStore {
    async fn insert_webhook(&self, args: NewWebhook, max_count: i64) -> Result<Webhook> {
        super::validate_webhook_url(&args.url)?;
        super::validate_signing_key(&args.signing_key)?;
        self.run_blocking(move |conn| {
            conn.transaction(|conn| {
                if let Some(tenant) = &args.tenant_scope {
                    let count: i64 = webhooks::table
                        .filter(webhooks::tenant_scope.eq(tenant))
                        .count()
                        .get_result(conn)?;
                    if count >= max_count {
                        return Err(HubError::SubscriptionLimitReached {
                            tenant_scope: tenant.clone(),
                            max: max_count,
                        });
                    }
                }

                let row = InsertWebhookRow {
                    id: Uuid::new_v4(),
                    tenant_scope: args.tenant_scope.as_deref(),
                    url: &args.url,
                    signing_key: &args.signing_key,
                    event_types: &args.event_types,
                    enabled: true,
                    consecutive_failures: 0,
                };

                let inserted: WebhookRow = diesel::insert_into(webhooks::table)
                    .values(&row)
                    .get_result(conn)?;
                Ok(inserted.into())
            })
        })
        .await
    }

    async fn get_webhook(&self, id: Uuid) -> Result<Option<Webhook>> {
        self.run_blocking(move |conn| {
            let row: Option<WebhookRow> = webhooks::table
                .find(id)
                .first(conn)
                .optional()?;
            Ok(row.map(Webhook::from))
        })
        .await
    }

    async fn list_enabled_for_event(
        &self,
        event_type: &str,
        tenant_scope: Option<&str>,
    ) -> Result<Vec<Webhook>> {
        let event_type = event_type.to_string();
        let tenant_scope = tenant_scope.map(|s| s.to_string());
        self.run_blocking(move |conn| {
            let mut query = webhooks::table
                .filter(webhooks::enabled.eq(true))
                .filter(webhooks::event_types.contains(vec![event_type.clone()]))
                .into_boxed();
            query = match &tenant_scope {
                Some(scope) => query.filter(webhooks::tenant_scope.eq(scope)),
                None => query,
            };
            let rows: Vec<WebhookRow> = query.order(webhooks::id.asc()).load(conn)?;
            Ok(rows.into_iter().map(Webhook::from).collect())
        })
        .await
    }

    async fn disable_webhook(&self, id: Uuid, reason: DisabledReason) -> Result<()> {
        self.run_blocking(move |conn| {
            diesel::update(webhooks::table.find(id))
                .set((
                    webhooks::enabled.eq(false),
                    webhooks::disabled_reason.eq(reason.as_str()),
                    webhooks::updated_at.eq(diesel::dsl::now),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn reset_failures(&self, id: Uuid) -> Result<()> {
        self.run_blocking(move |conn| {
            diesel::update(webhooks::table.find(id))
                .set((
                    webhooks::consecutive_failures.eq(0),
                    webhooks::updated_at.eq(diesel::dsl::now),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn increment_failures(&self, id: Uuid) -> Result<i32> {
        self.run_blocking(move |conn| {
            conn.transaction(|conn| {
                diesel::update(webhooks::table.find(id))
                    .set((
                        webhooks::consecutive_failures.eq(webhooks::consecutive_failures + 1),
                        webhooks::updated_at.eq(diesel::dsl::now),
                    ))
                    .execute(conn)?;
                let count: i32 = webhooks::table
                    .find(id)
                    .select(webhooks::consecutive_failures)
                    .first(conn)
                    .optional()?
                    .ok_or_else(|| HubError::JobNotFound(id.to_string()))?;
                Ok(count)
            })
        })
        .await
    }

    async fn insert_many(&self, jobs: Vec<NewJob>) -> Result<usize> {
        self.run_blocking(move |conn| {
            let now = Utc::now();
            let rows: Vec<InsertJobRow> = jobs
                .into_iter()
                .map(|j| -> Result<InsertJobRow> {
                    Ok(InsertJobRow {
                        id: Uuid::new_v4(),
                        queue: j.queue,
                        state: JobState::Available.as_str().to_string(),
                        subscription_id: j.subscription_id,
                        event_type: j.event_type,
                        event_timestamp: j.event_timestamp,
                        args_json: serde_json::to_value(&j.args)?,
                        unique_key: j.unique_key,
                        attempt: 0,
                        max_attempts: j.max_attempts,
                        scheduled_at: now,
                    })
                })
                .collect::<Result<_>>()?;

            let inserted = diesel::insert_into(webhook_jobs::table)
                .values(&rows)
                .on_conflict(webhook_jobs::unique_key)
                .do_nothing()
                .execute(conn)?;
            Ok(inserted)
        })
        .await
    }

    async fn lease(&self, queue: &str, n: i64, lease_ttl: chrono::Duration) -> Result<Vec<Job>> {
        let queue = queue.to_string();
        self.run_blocking(move |conn| {
            conn.transaction(|conn| {
                let now = Utc::now();
                let leased_until = now + lease_ttl;

                let candidate_ids: Vec<Uuid> = webhook_jobs::table
                    .filter(webhook_jobs::queue.eq(&queue))
                    .filter(webhook_jobs::scheduled_at.le(now))
                    .filter(
                        webhook_jobs::state
                            .eq(JobState::Available.as_str())
                            .or(webhook_jobs::state.eq(JobState::Retryable.as_str()))
                            .or(webhook_jobs::state
                                .eq(JobState::Running.as_str())
                                .and(webhook_jobs::leased_until.le(now))),
                    )
                    .order((webhook_jobs::scheduled_at.asc(), webhook_jobs::id.asc()))
                    .limit(n)
                    .select(webhook_jobs::id)
                    .for_update()
                    .skip_locked()
                    .load(conn)?;

                if candidate_ids.is_empty() {
                    return Ok(Vec::new());
                }

                diesel::update(webhook_jobs::table.filter(webhook_jobs::id.eq_any(&candidate_ids)))
                    .set((
                        webhook_jobs::state.eq(JobState::Running.as_str()),
                        webhook_jobs::attempt.eq(webhook_jobs::attempt + 1),
                        webhook_jobs::leased_until.eq(leased_until),
                    ))
                    .execute(conn)?;

                let rows: Vec<JobRow> = webhook_jobs::table
                    .filter(webhook_jobs::id.eq_any(&candidate_ids))
                    .load(conn)?;
                rows.into_iter().map(Job::try_from).collect()
            })
        })
        .await
    }

    async fn complete(&self, job_id: Uuid) -> Result<()> {
        self.run_blocking(move |conn| {
            let affected = diesel::update(webhook_jobs::table.find(job_id))
                .set((
                    webhook_jobs::state.eq(JobState::Completed.as_str()),
                    webhook_jobs::finalized_at.eq(diesel::dsl::now),
                ))
                .execute(conn)?;
            if affected == 0 {
                return Err(HubError::JobNotFound(job_id.to_string()));
            }
            Ok(())
        })
        .await
    }

    async fn fail(
        &self,
        job_id: Uuid,
        error: &str,
        next_delay: chrono::Duration,
    ) -> Result<FailOutcome> {
        let error = error.to_string();
        self.run_blocking(move |conn| {
            conn.transaction(|conn| {
                let row: JobRow = webhook_jobs::table
                    .find(job_id)
                    .first(conn)
                    .optional()?
                    .ok_or_else(|| HubError::JobNotFound(job_id.to_string()))?;

                if row.attempt >= row.max_attempts {
                    diesel::update(webhook_jobs::table.find(job_id))
                        .set((
                            webhook_jobs::state.eq(JobState::Discarded.as_str()),
                            webhook_jobs::last_error.eq(&error),
                            webhook_jobs::finalized_at.eq(diesel::dsl::now),
                        ))
                        .execute(conn)?;
                    Ok(FailOutcome::Exhausted)
                } else {
                    diesel::update(webhook_jobs::table.find(job_id))
                        .set((
                            webhook_jobs::state.eq(JobState::Retryable.as_str()),
                            webhook_jobs::last_error.eq(&error),
                            webhook_jobs::scheduled_at.eq(Utc::now() + next_delay),
                            webhook_jobs::leased_until.eq(None::<DateTime<Utc>>),
                        ))
                        .execute(conn)?;
                    Ok(FailOutcome::Retryable)
                }
            })
        })
        .await
    }

    async fn discard(&self, job_id: Uuid, error: &str) -> Result<()> {
        let error = error.to_string();
        self.run_blocking(move |conn| {
            let affected = diesel::update(webhook_jobs::table.find(job_id))
                .set((
                    webhook_jobs::state.eq(JobState::Discarded.as_str()),
                    webhook_jobs::last_error.eq(&error),
                    webhook_jobs::finalized_at.eq(diesel::dsl::now),
                ))
                .execute(conn)?;
            if affected == 0 {
                return Err(HubError::JobNotFound(job_id.to_string()));
            }
            Ok(())
        })
        .await
    }

    async fn cancel(&self, job_id: Uuid) -> Result<()> {
        self.run_blocking(move |conn| {
            let affected = diesel::update(webhook_jobs::table.find(job_id))
                .set((
                    webhook_jobs::state.eq(JobState::Cancelled.as_str()),
                    webhook_jobs::finalized_at.eq(diesel::dsl::now),
                ))
                .execute(conn)?;
            if affected == 0 {
                return Err(HubError::JobNotFound(job_id.to_string()));
            }
            Ok(())
        })
        .await
    }

    async fn queue_depth(&self, queue: &str) -> Result<i64> {
        let queue = queue.to_string();
        self.run_blocking(move |conn| {
            let count = webhook_jobs::table
                .filter(webhook_jobs::queue.eq(&queue))
                .filter(
                    webhook_jobs::state
                        .ne(JobState::Completed.as_str())
                        .and(webhook_jobs::state.ne(JobState::Cancelled.as_str()))
                        .and(webhook_jobs::state.ne(JobState::Discarded.as_str())),
                )
                .count()
                .get_result(conn)?;
            Ok(count)
        })
        .await
    }
}
