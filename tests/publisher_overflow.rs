//! A small publisher buffer under a burst of publishes drops the overflow
//! instead of blocking the producer, and the drops are observable via the
//! event-discarded metric family.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use feedback_hub_core::error::Result;
use feedback_hub_core::types::{Event, EventType};
use feedback_hub_core::{MessagePublisher, Provider};

/// Blocks on the very first event until released, so a burst of publishes
/// piles up behind the single in-flight dequeue; returns immediately for
/// everything after, so the publisher can still drain and shut down.
struct BlocksFirstEventOnly {
    seen: Arc<AtomicUsize>,
    released_once: AtomicBool,
    release: tokio::sync::Notify,
}

#[async_trait]
impl Provider for BlocksFirstEventOnly {
    async fn on_event(&self, _event: &Event) -> Result<()> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        if !self.released_once.swap(true, Ordering::SeqCst) {
            self.release.notified().await;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "blocked"
    }
}

#[tokio::test]
async fn burst_beyond_buffer_size_drops_the_overflow() {
    let seen = Arc::new(AtomicUsize::new(0));
    let provider = Arc::new(BlocksFirstEventOnly {
        seen: seen.clone(),
        released_once: AtomicBool::new(false),
        release: tokio::sync::Notify::new(),
    });

    let publisher = MessagePublisher::start(2, Duration::from_secs(5), vec![provider.clone()]);

    // The first publish is picked up by the dequeue loop immediately and
    // blocks there until released, so the queue only has `buffer_size`
    // capacity left for the remaining nine.
    for _ in 0..10 {
        publisher.publish(Event::new(
            EventType::feedback_record_created(),
            serde_json::json!({}),
        ));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let rendered = feedback_hub_core::metrics::render();
    let discarded_line = rendered
        .lines()
        .find(|l| l.starts_with("hub_events_discarded_total"))
        .expect("metric should have been registered");
    assert!(
        discarded_line.contains('}'),
        "expected a labeled counter line, got: {discarded_line}"
    );

    provider.release.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // At most buffer_size + 1 events (the one already dequeued, plus the
    // buffer) were ever handed to the provider from this burst.
    assert!(seen.load(Ordering::SeqCst) <= 3);

    publisher.shutdown().await;
}
