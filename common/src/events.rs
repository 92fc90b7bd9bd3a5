use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Event types emitted by the decision engines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RecommendationGenerated,
    AttemptRecorded,
    BayesianUpdated,
    MlModelTrained,
    MlModelDeployed,
    GuardrailTriggered,
    PolicyUpdated,
    PlanGenerated,
    PlanApplied,
    ActionApplied,
    Rollback,
}

/// A single event on the bus.
///
/// Events are advisory: nothing in the decision path depends on a subscriber
/// having seen one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub kind: EventKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub data: HashMap<String, Value>,
}

impl Event {
    pub fn new(kind: EventKind, message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
            timestamp,
            data: HashMap::new(),
        }
    }

    /// Attach a data field; non-serializable values are dropped silently.
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.data.insert(key.to_string(), v);
        }
        self
    }
}

/// Fire-and-forget broadcast channel of typed events.
///
/// Publishing never fails: with zero subscribers the event is simply dropped.
/// Slow subscribers miss events (broadcast lag) rather than blocking
/// publishers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new(8);
        bus.publish(Event::new(EventKind::PlanGenerated, "plan", Utc::now()));
        // Nothing to assert beyond "did not panic"; the send result is ignored.
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        let ev = Event::new(EventKind::ActionApplied, "pause applied", Utc::now())
            .with("worker_id", "w-1")
            .with("action", "pause");
        bus.publish(ev);

        let got = rx.recv().await.expect("event delivered");
        assert_eq!(got.kind, EventKind::ActionApplied);
        assert_eq!(got.data.get("worker_id").unwrap(), "w-1");
    }

    #[test]
    fn kind_serializes_snake_case() {
        let s = serde_json::to_string(&EventKind::MlModelDeployed).unwrap();
        assert_eq!(s, "\"ml_model_deployed\"");
    }
}
