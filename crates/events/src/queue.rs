//! Message queue abstraction (at-least-once, visibility-timeout based).
//!
//! ## Delivery contract
//!
//! - A received message is hidden from other consumers for the queue's
//!   visibility window.
//! - It must be acknowledged (deleted) with its receipt handle before the window
//!   expires; otherwise it reappears and its `receive_count` grows.
//! - A receipt handle is only valid for the delivery that produced it. Acking
//!   with a stale handle fails with [`QueueError::UnknownReceipt`].
//! - No ordering is guaranteed. Consumers must be idempotent.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use uuid::Uuid;

/// A message as handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    /// Number of times this message has been delivered, including this one.
    pub receive_count: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("unknown or expired receipt handle: {0}")]
    UnknownReceipt(String),

    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("queue protocol error: {0}")]
    Protocol(String),
}

pub trait MessageQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Enqueue a message body; returns the message id.
    fn send(&self, body: String) -> Result<String, QueueError>;

    /// Receive up to `max_messages`, blocking for at most `wait` when empty.
    fn receive(&self, max_messages: usize, wait: Duration) -> Result<Vec<QueueMessage>, QueueError>;

    /// Acknowledge (delete) a received message.
    fn ack(&self, receipt_handle: &str) -> Result<(), QueueError>;
}

impl<Q> MessageQueue for Arc<Q>
where
    Q: MessageQueue + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn send(&self, body: String) -> Result<String, QueueError> {
        (**self).send(body)
    }

    fn receive(&self, max_messages: usize, wait: Duration) -> Result<Vec<QueueMessage>, QueueError> {
        (**self).receive(max_messages, wait)
    }

    fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        (**self).ack(receipt_handle)
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: String,
    receive_count: u32,
}

#[derive(Debug)]
struct InFlight {
    message: StoredMessage,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    visible: VecDeque<StoredMessage>,
    in_flight: HashMap<String, InFlight>,
}

impl QueueState {
    /// Move every in-flight message whose window expired back to the queue.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some(f) = self.in_flight.remove(&receipt) {
                self.visible.push_back(f.message);
            }
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.in_flight.values().map(|f| f.visible_at).min()
    }
}

/// In-process queue for tests/dev.
///
/// - Blocking long-poll via a condition variable
/// - Real visibility timeouts (use small windows in tests)
#[derive(Debug)]
pub struct InMemoryQueue {
    name: String,
    visibility_timeout: Duration,
    state: Mutex<QueueState>,
    available: Condvar,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>, visibility_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            visibility_timeout,
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
        }
    }

    pub fn arc(name: impl Into<String>, visibility_timeout: Duration) -> Arc<Self> {
        Arc::new(Self::new(name, visibility_timeout))
    }

    /// `(visible, in_flight)` message counts.
    pub fn depth(&self) -> (usize, usize) {
        match self.state.lock() {
            Ok(mut s) => {
                s.reclaim_expired(Instant::now());
                (s.visible.len(), s.in_flight.len())
            }
            Err(_) => (0, 0),
        }
    }

    fn poisoned(&self) -> QueueError {
        QueueError::Unavailable(format!("queue {} lock poisoned", self.name))
    }
}

impl MessageQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, body: String) -> Result<String, QueueError> {
        let message_id = Uuid::now_v7().to_string();
        let mut state = self.state.lock().map_err(|_| self.poisoned())?;
        state.visible.push_back(StoredMessage {
            message_id: message_id.clone(),
            body,
            receive_count: 0,
        });
        drop(state);
        self.available.notify_one();
        Ok(message_id)
    }

    fn receive(&self, max_messages: usize, wait: Duration) -> Result<Vec<QueueMessage>, QueueError> {
        let deadline = Instant::now() + wait;
        let mut state = self.state.lock().map_err(|_| self.poisoned())?;

        loop {
            let now = Instant::now();
            state.reclaim_expired(now);

            if !state.visible.is_empty() {
                let mut out = Vec::new();
                while out.len() < max_messages.max(1) {
                    let Some(mut message) = state.visible.pop_front() else {
                        break;
                    };
                    message.receive_count += 1;
                    let receipt_handle = Uuid::now_v7().to_string();
                    out.push(QueueMessage {
                        message_id: message.message_id.clone(),
                        receipt_handle: receipt_handle.clone(),
                        body: message.body.clone(),
                        receive_count: message.receive_count,
                    });
                    state.in_flight.insert(
                        receipt_handle,
                        InFlight {
                            message,
                            visible_at: now + self.visibility_timeout,
                        },
                    );
                }
                return Ok(out);
            }

            if now >= deadline {
                return Ok(Vec::new());
            }

            // Wake on a send, on the next visibility expiry, or at the deadline.
            let mut wake_at = deadline;
            if let Some(expiry) = state.next_expiry() {
                wake_at = wake_at.min(expiry);
            }
            let timeout = wake_at.saturating_duration_since(now);
            let (guard, _) = self
                .available
                .wait_timeout(state, timeout)
                .map_err(|_| self.poisoned())?;
            state = guard;
        }
    }

    fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().map_err(|_| self.poisoned())?;
        match state.in_flight.get(receipt_handle) {
            Some(f) if f.visible_at > Instant::now() => {
                state.in_flight.remove(receipt_handle);
                Ok(())
            }
            _ => Err(QueueError::UnknownReceipt(receipt_handle.to_string())),
        }
    }
}
