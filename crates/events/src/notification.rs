use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::messages::PipelineEvent;

/// Envelope for a published event.
///
/// This is the body of every queue message fanned out by the bus:
/// - `topic` records where it was published, so a consumer can reject
///   messages routed to the wrong queue.
/// - `message` is the event payload, decoded by the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    message_id: Uuid,
    topic: String,
    published_at: DateTime<Utc>,
    message: JsonValue,
}

impl Notification {
    pub fn new(topic: impl Into<String>, message: JsonValue) -> Self {
        Self {
            message_id: Uuid::now_v7(),
            topic: topic.into(),
            published_at: Utc::now(),
            message,
        }
    }

    /// Build an envelope for a typed event on its own topic.
    pub fn for_event<E: PipelineEvent>(event: &E) -> Result<Self, serde_json::Error> {
        Ok(Self::new(E::TOPIC, serde_json::to_value(event)?))
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    pub fn message(&self) -> &JsonValue {
        &self.message
    }

    /// Decode the payload as a specific event type.
    pub fn decode<E: DeserializeOwned>(&self) -> Result<E, serde_json::Error> {
        E::deserialize(&self.message)
    }

    /// Serialize into a queue message body.
    pub fn to_body(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_body(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{TierUpgraded, topics};
    use annoflow_core::UserId;

    #[test]
    fn body_round_trip_keeps_topic_and_payload() {
        let ev = TierUpgraded {
            user_id: UserId::parse("U1").unwrap(),
        };
        let n = Notification::for_event(&ev).unwrap();
        assert_eq!(n.topic(), topics::TIER_UPGRADES);

        let back = Notification::from_body(&n.to_body().unwrap()).unwrap();
        assert_eq!(back.message_id(), n.message_id());
        assert_eq!(back.decode::<TierUpgraded>().unwrap(), ev);
    }
}
