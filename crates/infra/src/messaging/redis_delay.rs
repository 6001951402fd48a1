//! Redis sorted-set delay scheduler.
//!
//! Entries are members of one sorted set scored by due time (epoch ms).
//! Promotion reads the due range and claims each member with `ZREM`; only the
//! caller whose `ZREM` removed the member publishes it, so concurrent pumps
//! never double-promote.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use annoflow_events::{DelayError, DelayedScheduler, Notification};

const DEFAULT_KEY: &str = "annoflow:delayed";

#[derive(Debug, Clone)]
pub struct RedisDelayScheduler {
    client: Arc<redis::Client>,
    key: String,
}

impl RedisDelayScheduler {
    pub fn new(client: Arc<redis::Client>) -> Self {
        Self {
            client,
            key: DEFAULT_KEY.to_string(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    fn connection(&self) -> Result<redis::Connection, DelayError> {
        self.client
            .get_connection()
            .map_err(|e| DelayError::Unavailable(format!("redis connection: {e}")))
    }
}

impl DelayedScheduler for RedisDelayScheduler {
    fn schedule(&self, notification: Notification, due_at: DateTime<Utc>) -> Result<(), DelayError> {
        let body = notification.to_body()?;
        let mut conn = self.connection()?;
        let _: i64 = redis::cmd("ZADD")
            .arg(&self.key)
            .arg(due_at.timestamp_millis())
            .arg(body)
            .query(&mut conn)
            .map_err(|e| DelayError::Unavailable(format!("ZADD failed: {e}")))?;
        Ok(())
    }

    fn promote_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Notification>, DelayError> {
        let mut conn = self.connection()?;
        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.key)
            .arg("-inf")
            .arg(now.timestamp_millis())
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query(&mut conn)
            .map_err(|e| DelayError::Unavailable(format!("ZRANGEBYSCORE failed: {e}")))?;

        let mut promoted = Vec::with_capacity(members.len());
        for member in members {
            let removed: i64 = redis::cmd("ZREM")
                .arg(&self.key)
                .arg(&member)
                .query(&mut conn)
                .map_err(|e| DelayError::Unavailable(format!("ZREM failed: {e}")))?;
            if removed == 0 {
                // Another pump claimed it.
                continue;
            }
            match Notification::from_body(&member) {
                Ok(n) => promoted.push(n),
                Err(e) => warn!(key = %self.key, error = %e, "dropping undecodable delayed entry"),
            }
        }
        Ok(promoted)
    }
}
