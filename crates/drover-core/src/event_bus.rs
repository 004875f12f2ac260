//! Broadcast bus for the observability surface.
//!
//! The core publishes two event families:
//!
//! - `session:state:{id}` — a session snapshot after every state change
//!   (create, activate, rename, busy transitions, close).
//! - `prompt:done:{id}` — one record per completed prompt with byte count,
//!   elapsed time and outcome.
//!
//! Consumers (chat layer, metrics, web UI) subscribe once and filter by
//! topic; no reporter format is mandated beyond the JSON payloads.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events buffered per subscriber before slow consumers start lagging.
const BUS_CAPACITY: usize = 1024;

/// One published event: a topic plus its JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub topic: String,
    pub payload: serde_json::Value,
}

impl BusEvent {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

pub fn session_topic(session_id: &str) -> String {
    format!("session:state:{session_id}")
}

pub fn outcome_topic(session_id: &str) -> String {
    format!("prompt:done:{session_id}")
}

/// Fan-out broadcast bus over a tokio broadcast channel. Publishing never
/// blocks; events published with no subscribers are dropped.
pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Publish a serializable payload under a topic. Returns the number of
    /// subscribers reached.
    pub fn publish<T: Serialize>(&self, topic: &str, payload: &T) -> usize {
        let value = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("event payload failed to serialize: {e}");
                return 0;
            }
        };
        self.sender.send(BusEvent::new(topic, value)).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
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

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn topics_are_namespaced_by_session() {
        assert_eq!(session_topic("abc"), "session:state:abc");
        assert_eq!(outcome_topic("abc"), "prompt:done:abc");
    }

    #[test]
    fn publish_without_subscribers_is_dropped() {
        let bus = EventBus::new();
        assert_eq!(bus.publish("t", &json!({})), 0);
    }

    #[test]
    fn publish_counts_subscribers() {
        let bus = EventBus::new();
        let _a = bus.subscribe();
        let _b = bus.subscribe();
        assert_eq!(bus.publish("t", &json!({"n": 1})), 2);
    }

    #[tokio::test]
    async fn subscriber_receives_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(&session_topic("s1"), &json!({"busy": true}));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.topic, "session:state:s1");
        assert_eq!(event.payload["busy"], true);
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        for n in 0..3 {
            bus.publish("t", &json!({ "n": n }));
        }
        for n in 0..3 {
            assert_eq!(rx.recv().await.unwrap().payload["n"], n);
        }
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let bus = EventBus::new();
        let mut early = bus.subscribe();
        bus.publish("first", &json!({}));

        let mut late = bus.subscribe();
        bus.publish("second", &json!({}));

        assert_eq!(early.recv().await.unwrap().topic, "first");
        assert_eq!(early.recv().await.unwrap().topic, "second");
        assert_eq!(late.recv().await.unwrap().topic, "second");
    }
}
