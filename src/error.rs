//! Error types for feedback-hub-core

use thiserror::Error;

/// Errors that can occur in the event fan-out and webhook dispatch core
#[derive(Debug, Error)]
pub enum HubError {
    /// The relational store could not complete an operation
    #[error("store error: {0}")]
    Store(#[from] diesel::result::Error),

    /// The connection pool could not hand out a connection
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Webhook payload or config could not be serialized/deserialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The outbound HTTP client failed to complete the request
    #[error("delivery request error: {0}")]
    Delivery(#[from] reqwest::Error),

    /// A subscription's signing secret is malformed (too short, not valid UTF-8/bytes)
    #[error("invalid signing key for subscription {subscription_id}: {reason}")]
    InvalidSigningKey {
        subscription_id: String,
        reason: String,
    },

    /// A subscription's configured URL has an unsupported scheme
    #[error("invalid webhook url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// A tenant has reached its configured maximum subscription count
    #[error("tenant '{tenant_scope}' has reached its subscription limit ({max})")]
    SubscriptionLimitReached { tenant_scope: String, max: i64 },

    /// Fan-out or enqueue failed inside the provider
    #[error("webhook provider error ({reason}): {detail}")]
    Provider { reason: &'static str, detail: String },

    /// The job referenced by an operation does not exist or is not in the expected state
    #[error("job not found or not leasable: {0}")]
    JobNotFound(String),

    /// Configuration could not be loaded or failed validation
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for hub operations
pub type Result<T> = std::result::Result<T, HubError>;
