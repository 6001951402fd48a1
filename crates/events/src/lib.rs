//! `annoflow-events`: messaging mechanics for the pipeline.
//!
//! - Event payloads and their topics (`messages`)
//! - The envelope every queued message carries (`notification`)
//! - At-least-once queues with visibility timeouts (`queue`)
//! - Topic fan-out onto queues (`bus`)
//! - Delayed delivery (`delay`)
//!
//! Backends talking to real services live in `annoflow-infra`.

pub mod bus;
pub mod delay;
pub mod messages;
pub mod notification;
pub mod queue;

pub use bus::{BusError, FanoutBus, NotificationBus, NotificationBusExt};
pub use delay::{DelayError, DelayedScheduler, DelayedSchedulerExt, InMemoryDelayScheduler};
pub use messages::{
    ArchiveEligible, JobCompleted, JobRequested, PipelineEvent, RetrievalCompleted, RetrievalStatus,
    TierUpgraded, topics,
};
pub use notification::Notification;
pub use queue::{InMemoryQueue, MessageQueue, QueueError, QueueMessage};
