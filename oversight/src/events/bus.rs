//! Pub/sub event bus over a Tokio broadcast channel.
//!
//! Publishing never fails when there are no receivers; slow subscribers
//! that lag past the channel capacity lose the oldest events (broadcast
//! semantics), which is acceptable for progress telemetry.

use tokio::sync::broadcast;
use tracing::debug;

use super::types::OpsEvent;
use std::sync::Arc;

const CHANNEL_CAPACITY: usize = 256;

pub type SharedEventBus = Arc<EventBus>;

pub struct EventBus {
    sender: broadcast::Sender<OpsEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish to all current subscribers.
    pub fn publish(&self, event: OpsEvent) {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(receivers) => debug!(event_type, receivers, "event published"),
            Err(_) => debug!(event_type, "event published (no receivers)"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OpsEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(OpsEvent::TaskStarted {
            task_id: "t-1".into(),
            title: "install nginx".into(),
            dry_run: false,
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "task_started");
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(OpsEvent::TaskFailed {
            task_id: "t".into(),
            reason: "planning failed".into(),
            timestamp: Utc::now(),
        });
    }

    #[tokio::test]
    async fn each_subscriber_sees_every_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(OpsEvent::StepCompleted {
            task_id: "t".into(),
            step_id: "s".into(),
            timestamp: Utc::now(),
        });

        assert_eq!(a.recv().await.unwrap().event_type(), "step_completed");
        assert_eq!(b.recv().await.unwrap().event_type(), "step_completed");
    }
}
