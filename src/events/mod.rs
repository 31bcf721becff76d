//! Event system for call lifecycle notifications
//!
//! This module provides an event bus for broadcasting call lifecycle events
//! to UI layers and other subscribers.

pub mod types;

pub use types::CallEvent;

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Event bus for broadcasting call lifecycle events
///
/// Uses tokio's broadcast channel to distribute events to multiple
/// subscribers. Events are delivered to all active subscribers; with no
/// subscribers, publishing is a silent no-op (fire-and-forget).
///
/// # Example
///
/// ```no_run
/// use converge::events::{CallEvent, EventBus};
/// use converge::signaling::CallId;
///
/// let bus = EventBus::new();
///
/// let mut rx = bus.subscribe();
/// tokio::spawn(async move {
///     while let Ok(event) = rx.recv().await {
///         println!("lifecycle event: {:?}", event);
///     }
/// });
///
/// bus.publish(CallEvent::CallStarted {
///     call_id: CallId::generate(),
/// });
/// ```
pub struct EventBus {
    tx: broadcast::Sender<CallEvent>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: CallEvent) {
        // If no subscribers, send returns Err which is normal
        let _ = self.tx.send(event);
    }

    /// Subscribe to events
    ///
    /// Returns a receiver for all future events. The receiver uses a ring
    /// buffer, so a subscriber that falls too far behind receives a
    /// `Lagged` error and misses some events.
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.tx.subscribe()
    }

    /// Current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
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
    use crate::signaling::CallId;

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 2);

        let id = CallId::generate();
        bus.publish(CallEvent::CallStarted { call_id: id });

        assert!(matches!(
            rx1.recv().await.unwrap(),
            CallEvent::CallStarted { .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            CallEvent::CallStarted { .. }
        ));
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(CallEvent::error("internal", "no one listening"));
    }

    #[test]
    fn error_event_serializes_with_kebab_case_tag() {
        let json = serde_json::to_value(CallEvent::error("media-unavailable", "denied")).unwrap();
        assert_eq!(json["event"], "error");
        assert_eq!(json["kind"], "media-unavailable");

        let json =
            serde_json::to_value(CallEvent::CallReadyToShare {
                call_id: CallId::parse("x").unwrap(),
            })
            .unwrap();
        assert_eq!(json["event"], "call-ready-to-share");
        assert_eq!(json["callId"], "x");
    }
}
