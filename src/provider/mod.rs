//! Providers — the single capability fan-out targets implement.
//!
//! A provider is invoked once per event, sequentially with every other
//! registered provider, from the [`crate::publisher::MessagePublisher`]'s
//! single dequeue loop. There is currently one variant, [`webhook::WebhookProvider`];
//! the trait exists so the publisher doesn't need to know about webhooks
//! specifically.

pub mod webhook;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::Event;

/// A fan-out target. `on_event` is invoked for every published event in
/// registration order; a returned error is logged by the publisher and does
/// not stop the pipeline or the remaining providers for that event.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn on_event(&self, event: &Event) -> Result<()>;

    /// Used in log fields; defaults to the type name-ish identifier callers
    /// pass at registration.
    fn name(&self) -> &str;
}
