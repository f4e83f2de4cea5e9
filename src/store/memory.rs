//! In-memory [`JobStore`] fake for unit and integration tests. Not used in
//! production — [`super::postgres::DieselPostgresStore`] is the only real
//! backend.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{FailOutcome, Job, JobStore, NewJob, NewWebhook, Webhook};
use crate::error::{HubError, Result};
use crate::types::{DisabledReason, JobState};

#[derive(Default)]
struct Inner {
    webhooks: HashMap<Uuid, Webhook>,
    jobs: HashMap<Uuid, Job>,
    unique_keys: HashMap<String, Uuid>,
}

/// Thread-safe in-memory store. Cheap enough to construct fresh per test.
#[derive(Default)]
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_webhook(&self, args: NewWebhook, max_count: i64) -> Result<Webhook> {
        super::validate_webhook_url(&args.url)?;
        super::validate_signing_key(&args.signing_key)?;
        let mut inner = self.lock();
        if let Some(tenant) = &args.tenant_scope {
            let count = inner
                .webhooks
                .values()
                .filter(|w| w.tenant_scope.as_deref() == Some(tenant.as_str()))
                .count() as i64;
            if count >= max_count {
                return Err(HubError::SubscriptionLimitReached {
                    tenant_scope: tenant.clone(),
                    max: max_count,
                });
            }
        }
        let now = Utc::now();
        let webhook = Webhook {
            id: Uuid::new_v4(),
            tenant_scope: args.tenant_scope,
            url: args.url,
            signing_key: args.signing_key,
            event_types: args.event_types,
            enabled: true,
            consecutive_failures: 0,
            disabled_reason: None,
            created_at: now,
            updated_at: now,
        };
        inner.webhooks.insert(webhook.id, webhook.clone());
        Ok(webhook)
    }

    async fn get_webhook(&self, id: Uuid) -> Result<Option<Webhook>> {
        Ok(self.lock().webhooks.get(&id).cloned())
    }

    async fn list_enabled_for_event(
        &self,
        event_type: &str,
        tenant_scope: Option<&str>,
    ) -> Result<Vec<Webhook>> {
        let inner = self.lock();
        let mut matches: Vec<Webhook> = inner
            .webhooks
            .values()
            .filter(|w| w.subscribes_to(event_type))
            .filter(|w| match tenant_scope {
                Some(scope) => w.tenant_scope.as_deref() == Some(scope),
                None => true,
            })
            .cloned()
            .collect();
        matches.sort_by_key(|w| w.id);
        Ok(matches)
    }

    async fn disable_webhook(&self, id: Uuid, reason: DisabledReason) -> Result<()> {
        let mut inner = self.lock();
        if let Some(webhook) = inner.webhooks.get_mut(&id) {
            webhook.enabled = false;
            webhook.disabled_reason = Some(reason.as_str().to_string());
            webhook.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn reset_failures(&self, id: Uuid) -> Result<()> {
        let mut inner = self.lock();
        if let Some(webhook) = inner.webhooks.get_mut(&id) {
            webhook.consecutive_failures = 0;
            webhook.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn increment_failures(&self, id: Uuid) -> Result<i32> {
        let mut inner = self.lock();
        let webhook = inner
            .webhooks
            .get_mut(&id)
            .ok_or_else(|| HubError::JobNotFound(id.to_string()))?;
        webhook.consecutive_failures += 1;
        webhook.updated_at = Utc::now();
        Ok(webhook.consecutive_failures)
    }

    async fn insert_many(&self, jobs: Vec<NewJob>) -> Result<usize> {
        let mut inner = self.lock();
        let mut inserted = 0usize;
        for new_job in jobs {
            if inner.unique_keys.contains_key(&new_job.unique_key) {
                continue;
            }
            let now = Utc::now();
            let job = Job {
                id: Uuid::new_v4(),
                queue: new_job.queue,
                state: JobState::Available,
                subscription_id: new_job.subscription_id,
                event_type: new_job.event_type,
                event_timestamp: new_job.event_timestamp,
                args: new_job.args,
                unique_key: new_job.unique_key.clone(),
                attempt: 0,
                max_attempts: new_job.max_attempts,
                scheduled_at: now,
                leased_until: None,
                last_error: None,
                created_at: now,
                finalized_at: None,
            };
            inner.unique_keys.insert(new_job.unique_key, job.id);
            inner.jobs.insert(job.id, job);
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn lease(&self, queue: &str, n: i64, lease_ttl: chrono::Duration) -> Result<Vec<Job>> {
        let mut inner = self.lock();
        let now = Utc::now();
        let mut candidates: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|j| j.queue == queue)
            .filter(|j| j.state.is_leasable() || (j.state == JobState::Running && j.leased_until.is_some_and(|t| t <= now)))
            .filter(|j| j.scheduled_at <= now)
            .map(|j| (j.scheduled_at, j.id))
            .collect::<Vec<_>>()
            .into_iter()
            .map(|(_, id)| id)
            .collect();
        // order by (scheduled_at, id)
        candidates.sort_by_key(|id| {
            let j = &inner.jobs[id];
            (j.scheduled_at, j.id)
        });
        candidates.truncate(n.max(0) as usize);

        let mut leased = Vec::with_capacity(candidates.len());
        for id in candidates {
            let job = inner.jobs.get_mut(&id).expect("candidate exists");
            job.state = JobState::Running;
            job.attempt += 1;
            job.leased_until = Some(now + lease_ttl);
            leased.push(job.clone());
        }
        Ok(leased)
    }

    async fn complete(&self, job_id: Uuid) -> Result<()> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| HubError::JobNotFound(job_id.to_string()))?;
        job.state = JobState::Completed;
        job.finalized_at = Some(Utc::now());
        Ok(())
    }

    async fn fail(
        &self,
        job_id: Uuid,
        error: &str,
        next_delay: chrono::Duration,
    ) -> Result<FailOutcome> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| HubError::JobNotFound(job_id.to_string()))?;
        job.last_error = Some(error.to_string());
        if job.attempt >= job.max_attempts {
            job.state = JobState::Discarded;
            job.finalized_at = Some(Utc::now());
            Ok(FailOutcome::Exhausted)
        } else {
            job.state = JobState::Retryable;
            job.scheduled_at = Utc::now() + next_delay;
            job.leased_until = None;
            Ok(FailOutcome::Retryable)
        }
    }

    async fn discard(&self, job_id: Uuid, error: &str) -> Result<()> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| HubError::JobNotFound(job_id.to_string()))?;
        job.state = JobState::Discarded;
        job.last_error = Some(error.to_string());
        job.finalized_at = Some(Utc::now());
        Ok(())
    }

    async fn cancel(&self, job_id: Uuid) -> Result<()> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| HubError::JobNotFound(job_id.to_string()))?;
        job.state = JobState::Cancelled;
        job.finalized_at = Some(Utc::now());
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> Result<i64> {
        let inner = self.lock();
        let count = inner
            .jobs
            .values()
            .filter(|j| j.queue == queue && !j.state.is_terminal())
            .count();
        Ok(count as i64)
    }
}
