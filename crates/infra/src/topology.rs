//! Queue layout and topic subscriptions.
//!
//! Every topic has one work queue of the same name and a `<name>-dlq`
//! dead-letter queue. The bus fans each topic out to its work queue.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use annoflow_events::{FanoutBus, InMemoryQueue, MessageQueue, topics};

/// Work queue consumed for `topic`.
pub fn queue_for(topic: &str) -> String {
    topic.to_string()
}

pub fn dead_letter_name(queue: &str) -> String {
    format!("{queue}-dlq")
}

pub struct Topology {
    bus: Arc<FanoutBus>,
    queues: HashMap<String, Arc<dyn MessageQueue>>,
    dead_letters: HashMap<String, Arc<dyn MessageQueue>>,
}

impl Topology {
    /// Open every work and dead-letter queue with `open` and subscribe the
    /// work queues to their topics.
    pub fn build<E, F>(mut open: F) -> Result<Self, E>
    where
        F: FnMut(&str) -> Result<Arc<dyn MessageQueue>, E>,
    {
        let bus = Arc::new(FanoutBus::new());
        let mut queues = HashMap::new();
        let mut dead_letters = HashMap::new();

        for topic in topics::ALL {
            let name = queue_for(topic);
            let queue = open(&name)?;
            let dlq = open(&dead_letter_name(&name))?;
            bus.subscribe(topic, queue.clone());
            queues.insert(name.clone(), queue);
            dead_letters.insert(name, dlq);
        }

        tracing::debug!(queues = queues.len(), "topology built");
        Ok(Self {
            bus,
            queues,
            dead_letters,
        })
    }

    pub fn in_memory(visibility_timeout: Duration) -> Self {
        let built = Self::build::<Infallible, _>(|name| {
            let queue: Arc<dyn MessageQueue> = InMemoryQueue::arc(name, visibility_timeout);
            Ok(queue)
        });
        match built {
            Ok(topology) => topology,
            Err(never) => match never {},
        }
    }

    pub fn bus(&self) -> Arc<FanoutBus> {
        self.bus.clone()
    }

    /// Work queue for `topic`.
    pub fn queue(&self, topic: &str) -> Option<Arc<dyn MessageQueue>> {
        self.queues.get(&queue_for(topic)).cloned()
    }

    /// Dead-letter queue paired with the work queue for `topic`.
    pub fn dead_letters(&self, topic: &str) -> Option<Arc<dyn MessageQueue>> {
        self.dead_letters.get(&queue_for(topic)).cloned()
    }
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.queues.keys().collect();
        names.sort();
        f.debug_struct("Topology").field("queues", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use annoflow_core::UserId;
    use annoflow_events::{NotificationBusExt, TierUpgraded};

    use super::*;

    #[test]
    fn every_topic_has_a_work_queue_and_a_dead_letter_queue() {
        let t = Topology::in_memory(Duration::from_secs(30));
        for topic in topics::ALL {
            assert_eq!(t.queue(topic).unwrap().name(), topic);
            assert_eq!(t.dead_letters(topic).unwrap().name(), format!("{topic}-dlq"));
            assert_eq!(t.bus().subscribers(topic), vec![topic.to_string()]);
        }
    }

    #[test]
    fn published_events_land_in_the_topic_queue() {
        let t = Topology::in_memory(Duration::from_secs(30));
        t.bus()
            .publish_event(&TierUpgraded {
                user_id: UserId::parse("U1").unwrap(),
            })
            .unwrap();

        let q = t.queue(topics::TIER_UPGRADES).unwrap();
        assert_eq!(q.receive(10, Duration::ZERO).unwrap().len(), 1);
        let other = t.queue(topics::JOB_REQUESTS).unwrap();
        assert!(other.receive(10, Duration::ZERO).unwrap().is_empty());
    }
}
