//! Core value types: events, event types, outcomes, and disable reasons.

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A closed-enumeration tag of the form `{resource}.{action}`.
///
/// Unknown values still round-trip (so upstream code introducing a new
/// resource/action doesn't need to touch this crate), but are normalized to
/// `"unknown"` wherever they appear as a metric label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The well-known set of `feedback_record.*` and `webhook.*` event types
    /// the hub ships with out of the box. Callers may still construct
    /// arbitrary `EventType`s; this is a convenience, not an enforced closed
    /// set at the type level.
    pub fn feedback_record_created() -> Self {
        Self::new("feedback_record.created")
    }
    pub fn feedback_record_updated() -> Self {
        Self::new("feedback_record.updated")
    }
    pub fn feedback_record_deleted() -> Self {
        Self::new("feedback_record.deleted")
    }
    pub fn webhook_created() -> Self {
        Self::new("webhook.created")
    }
    pub fn webhook_updated() -> Self {
        Self::new("webhook.updated")
    }
    pub fn webhook_deleted() -> Self {
        Self::new("webhook.deleted")
    }

    /// The closed set of event types recognized for metric labeling. Anything
    /// outside this set collapses to `"unknown"` so a caller-supplied or
    /// future event type can never grow label cardinality.
    const KNOWN_EVENT_TYPES: &'static [&'static str] = &[
        "feedback_record.created",
        "feedback_record.updated",
        "feedback_record.deleted",
        "webhook.created",
        "webhook.updated",
        "webhook.deleted",
    ];

    /// The label value to use on metrics; bounds cardinality by collapsing
    /// anything outside the closed enumeration to `"unknown"`.
    pub fn metric_label(&self) -> &str {
        if Self::KNOWN_EVENT_TYPES.contains(&self.0.as_str()) {
            &self.0
        } else {
            "unknown"
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// An immutable domain event as seen by the publisher and its providers.
///
/// `timestamp` is wall-clock seconds since the epoch, not a monotonic clock
/// reading: it is what gets echoed back into the webhook payload and the
/// dispatch job's uniqueness key.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub timestamp: i64,
    pub data: Value,
    pub changed_fields: Option<Vec<String>>,
    /// Optional tenant scope the event belongs to; `None` for tenant-less
    /// event types. Used to filter candidate subscriptions by tenant.
    pub tenant_scope: Option<String>,
}

impl Event {
    pub fn new(event_type: impl Into<EventType>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: now_seconds(),
            data,
            changed_fields: None,
            tenant_scope: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_changed_fields(mut self, fields: Vec<String>) -> Self {
        self.changed_fields = Some(fields);
        self
    }

    pub fn with_tenant_scope(mut self, tenant_scope: impl Into<String>) -> Self {
        self.tenant_scope = Some(tenant_scope.into());
        self
    }

    pub fn timestamp_rfc3339(&self) -> String {
        timestamp_to_rfc3339(self.timestamp)
    }
}

pub fn now_seconds() -> i64 {
    Utc::now().timestamp()
}

pub fn timestamp_to_rfc3339(seconds: i64) -> String {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// The JSON body POSTed to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed_fields: Option<Vec<String>>,
}

impl WebhookPayload {
    pub fn from_event(event: &Event) -> Self {
        Self {
            event_type: event.event_type.as_str().to_string(),
            timestamp: event.timestamp_rfc3339(),
            data: event.data.clone(),
            changed_fields: event.changed_fields.clone(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Why a subscription stopped receiving deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisabledReason {
    #[serde(rename = "410_gone")]
    Gone410,
    MaxAttempts,
}

impl DisabledReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisabledReason::Gone410 => "410_gone",
            DisabledReason::MaxAttempts => "max_attempts",
        }
    }
}

impl std::fmt::Display for DisabledReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a dispatch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Available,
    Scheduled,
    Running,
    Retryable,
    Completed,
    Cancelled,
    Discarded,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Available => "available",
            JobState::Scheduled => "scheduled",
            JobState::Running => "running",
            JobState::Retryable => "retryable",
            JobState::Completed => "completed",
            JobState::Cancelled => "cancelled",
            JobState::Discarded => "discarded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Cancelled | JobState::Discarded
        )
    }

    pub fn is_leasable(&self) -> bool {
        matches!(self, JobState::Available | JobState::Retryable)
    }
}

/// The outcome of a single `WebhookSender::send` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Gone,
    RetryableFailure,
    ClientError,
}

impl Outcome {
    /// Whether this outcome should drive the job back into a retry state
    /// (subject to `attempt < max_attempts`), as opposed to being terminal
    /// regardless of remaining attempts.
    pub fn is_retryable_in_principle(&self) -> bool {
        matches!(self, Outcome::RetryableFailure | Outcome::ClientError)
    }

    /// The label used on `hub_webhook_deliveries_total`/`..._duration_seconds`.
    pub fn delivery_status_label(&self, is_final_failure: bool) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Gone => "failed_final",
            Outcome::RetryableFailure | Outcome::ClientError => {
                if is_final_failure {
                    "failed_final"
                } else {
                    "retry"
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_round_trips_through_serde() {
        let et = EventType::feedback_record_created();
        let json = serde_json::to_string(&et).unwrap();
        assert_eq!(json, "\"feedback_record.created\"");
        let back: EventType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, et);
    }

    #[test]
    fn metric_label_normalizes_unknown_event_types() {
        assert_eq!(EventType::new("").metric_label(), "unknown");
        assert_eq!(EventType::new("order.shipped").metric_label(), "unknown");
        let huge = EventType::new("x".repeat(200));
        assert_eq!(huge.metric_label(), "unknown");
    }

    #[test]
    fn metric_label_passes_through_known_event_types() {
        assert_eq!(
            EventType::feedback_record_created().metric_label(),
            "feedback_record.created"
        );
        assert_eq!(
            EventType::webhook_deleted().metric_label(),
            "webhook.deleted"
        );
    }

    #[test]
    fn timestamp_to_rfc3339_formats_unix_seconds_as_utc() {
        // timestamp=1000 -> "1970-01-01T00:16:40Z"
        assert_eq!(timestamp_to_rfc3339(1000), "1970-01-01T00:16:40Z");
    }

    #[test]
    fn webhook_payload_from_event_has_expected_shape() {
        let event = Event::new(
            EventType::feedback_record_created(),
            serde_json::json!({"id": "abc"}),
        )
        .with_timestamp(1000);

        let payload = WebhookPayload::from_event(&event);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "feedback_record.created");
        assert_eq!(json["timestamp"], "1970-01-01T00:16:40Z");
        assert_eq!(json["data"]["id"], "abc");
        assert!(json.get("changed_fields").is_none());
    }

    #[test]
    fn webhook_payload_includes_changed_fields_when_present() {
        let event = Event::new(EventType::feedback_record_updated(), serde_json::json!({}))
            .with_changed_fields(vec!["status".to_string()]);
        let payload = WebhookPayload::from_event(&event);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["changed_fields"], serde_json::json!(["status"]));
    }

    #[test]
    fn disabled_reason_serializes_to_stable_strings() {
        assert_eq!(DisabledReason::Gone410.as_str(), "410_gone");
        assert_eq!(DisabledReason::MaxAttempts.as_str(), "max_attempts");
    }

    #[test]
    fn job_state_classifications() {
        assert!(JobState::Available.is_leasable());
        assert!(JobState::Retryable.is_leasable());
        assert!(!JobState::Running.is_leasable());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Discarded.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }

    #[test]
    fn outcome_status_labels() {
        assert_eq!(Outcome::Success.delivery_status_label(false), "success");
        assert_eq!(Outcome::Gone.delivery_status_label(false), "failed_final");
        assert_eq!(
            Outcome::RetryableFailure.delivery_status_label(false),
            "retry"
        );
        assert_eq!(
            Outcome::RetryableFailure.delivery_status_label(true),
            "failed_final"
        );
        assert_eq!(Outcome::ClientError.delivery_status_label(false), "retry");
    }
}
