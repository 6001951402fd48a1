//! Notification bus (topic → queue fan-out).
//!
//! Publishing a notification delivers one copy of it to every queue subscribed
//! to its topic. Delivery is at-least-once: a publish that fails half-way may
//! be retried, and subscribers see a duplicate. Consumers must be idempotent.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::messages::PipelineEvent;
use crate::notification::Notification;
use crate::queue::{MessageQueue, QueueError};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// No queue is subscribed to the topic (a wiring fault).
    #[error("no subscribers for topic {0}")]
    UnknownTopic(String),

    #[error("delivery to queue {queue} failed: {source}")]
    Delivery {
        queue: String,
        #[source]
        source: QueueError,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("bus unavailable: {0}")]
    Unavailable(String),
}

pub trait NotificationBus: Send + Sync {
    /// Publish an already-built envelope on its topic; returns its message id.
    fn publish(&self, notification: &Notification) -> Result<Uuid, BusError>;
}

impl<B> NotificationBus for Arc<B>
where
    B: NotificationBus + ?Sized,
{
    fn publish(&self, notification: &Notification) -> Result<Uuid, BusError> {
        (**self).publish(notification)
    }
}

/// Typed publishing on top of any bus.
pub trait NotificationBusExt: NotificationBus {
    fn publish_event<E: PipelineEvent>(&self, event: &E) -> Result<Uuid, BusError> {
        let notification = Notification::for_event(event)?;
        self.publish(&notification)
    }
}

impl<B: NotificationBus + ?Sized> NotificationBusExt for B {}

/// Bus that copies every notification into each queue subscribed to its topic.
#[derive(Default)]
pub struct FanoutBus {
    routes: RwLock<HashMap<String, Vec<Arc<dyn MessageQueue>>>>,
}

impl FanoutBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a queue to a topic. Subscribing the same queue twice is a no-op.
    pub fn subscribe(&self, topic: impl Into<String>, queue: Arc<dyn MessageQueue>) {
        let topic = topic.into();
        let Ok(mut routes) = self.routes.write() else {
            tracing::error!(topic = %topic, "bus routing table poisoned; subscription dropped");
            return;
        };
        let queues = routes.entry(topic.clone()).or_default();
        if queues.iter().any(|q| q.name() == queue.name()) {
            return;
        }
        tracing::debug!(topic = %topic, queue = queue.name(), "queue subscribed");
        queues.push(queue);
    }

    /// Names of the queues subscribed to `topic`.
    pub fn subscribers(&self, topic: &str) -> Vec<String> {
        self.routes
            .read()
            .map(|routes| {
                routes
                    .get(topic)
                    .map(|qs| qs.iter().map(|q| q.name().to_string()).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for FanoutBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics: Vec<String> = self
            .routes
            .read()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("FanoutBus").field("topics", &topics).finish()
    }
}

impl NotificationBus for FanoutBus {
    fn publish(&self, notification: &Notification) -> Result<Uuid, BusError> {
        let queues = {
            let routes = self
                .routes
                .read()
                .map_err(|_| BusError::Unavailable("routing table poisoned".to_string()))?;
            match routes.get(notification.topic()) {
                Some(qs) if !qs.is_empty() => qs.clone(),
                _ => return Err(BusError::UnknownTopic(notification.topic().to_string())),
            }
        };

        let body = notification.to_body()?;
        for queue in &queues {
            queue.send(body.clone()).map_err(|source| BusError::Delivery {
                queue: queue.name().to_string(),
                source,
            })?;
        }

        tracing::debug!(
            topic = notification.topic(),
            message_id = %notification.message_id(),
            fanout = queues.len(),
            "notification published"
        );
        Ok(notification.message_id())
    }
}
