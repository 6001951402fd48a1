//! Delayed delivery of notifications.
//!
//! A scheduler holds notifications until their due time. Something (the delay
//! pump) periodically calls [`DelayedScheduler::promote_due`] and publishes the
//! returned notifications. `promote_due` claims each entry exactly once, even
//! with several pumps running against the same backend.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::messages::PipelineEvent;
use crate::notification::Notification;

#[derive(Debug, thiserror::Error)]
pub enum DelayError {
    #[error("scheduler unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("delay out of range: {0:?}")]
    OutOfRange(Duration),
}

pub trait DelayedScheduler: Send + Sync {
    /// Hold `notification` until `due_at`.
    fn schedule(&self, notification: Notification, due_at: DateTime<Utc>) -> Result<(), DelayError>;

    /// Claim and return up to `limit` entries whose due time is `<= now`.
    fn promote_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Notification>, DelayError>;
}

impl<S> DelayedScheduler for Arc<S>
where
    S: DelayedScheduler + ?Sized,
{
    fn schedule(&self, notification: Notification, due_at: DateTime<Utc>) -> Result<(), DelayError> {
        (**self).schedule(notification, due_at)
    }

    fn promote_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Notification>, DelayError> {
        (**self).promote_due(now, limit)
    }
}

pub trait DelayedSchedulerExt: DelayedScheduler {
    /// Schedule a typed event on its topic, `delay` from now.
    fn schedule_event<E: PipelineEvent>(&self, event: &E, delay: Duration) -> Result<DateTime<Utc>, DelayError> {
        let notification = Notification::for_event(event)?;
        let delay = chrono::Duration::from_std(delay).map_err(|_| DelayError::OutOfRange(delay))?;
        let due_at = Utc::now() + delay;
        self.schedule(notification, due_at)?;
        Ok(due_at)
    }
}

impl<S: DelayedScheduler + ?Sized> DelayedSchedulerExt for S {}

/// In-memory scheduler for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDelayScheduler {
    entries: Mutex<Vec<(DateTime<Utc>, Notification)>>,
}

impl InMemoryDelayScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries not yet promoted.
    pub fn pending(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Due time of the earliest pending entry.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.entries
            .lock()
            .ok()
            .and_then(|e| e.iter().map(|(due, _)| *due).min())
    }
}

impl DelayedScheduler for InMemoryDelayScheduler {
    fn schedule(&self, notification: Notification, due_at: DateTime<Utc>) -> Result<(), DelayError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| DelayError::Unavailable("scheduler lock poisoned".to_string()))?;
        entries.push((due_at, notification));
        Ok(())
    }

    fn promote_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Notification>, DelayError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| DelayError::Unavailable("scheduler lock poisoned".to_string()))?;

        entries.sort_by_key(|(due, _)| *due);
        let due = entries.iter().take_while(|(at, _)| *at <= now).count().min(limit);
        Ok(entries.drain(..due).map(|(_, n)| n).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ArchiveEligible, topics};
    use annoflow_core::{JobId, UserId};

    fn eligible(job: &str) -> ArchiveEligible {
        ArchiveEligible {
            job_id: JobId::parse(job).unwrap(),
            user_id: UserId::parse("U1").unwrap(),
        }
    }

    #[test]
    fn entries_are_held_until_due() {
        let s = InMemoryDelayScheduler::new();
        let due_at = s.schedule_event(&eligible("J1"), Duration::from_secs(300)).unwrap();

        assert!(s.promote_due(Utc::now(), 10).unwrap().is_empty());
        assert_eq!(s.pending(), 1);

        let promoted = s.promote_due(due_at, 10).unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].topic(), topics::ARCHIVE_ELIGIBILITY);
        assert_eq!(promoted[0].decode::<ArchiveEligible>().unwrap(), eligible("J1"));

        // Claimed exactly once.
        assert!(s.promote_due(due_at, 10).unwrap().is_empty());
    }

    #[test]
    fn promotion_is_ordered_and_limited() {
        let s = InMemoryDelayScheduler::new();
        let now = Utc::now();
        for (job, secs) in [("J3", 3), ("J1", 1), ("J2", 2)] {
            let n = Notification::for_event(&eligible(job)).unwrap();
            s.schedule(n, now + chrono::Duration::seconds(secs)).unwrap();
        }

        let later = now + chrono::Duration::seconds(10);
        let first = s.promote_due(later, 2).unwrap();
        let jobs: Vec<String> = first
            .iter()
            .map(|n| n.decode::<ArchiveEligible>().unwrap().job_id.to_string())
            .collect();
        assert_eq!(jobs, vec!["J1", "J2"]);
        assert_eq!(s.promote_due(later, 2).unwrap().len(), 1);
    }
}
