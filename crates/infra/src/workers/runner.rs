//! Queue worker runner: poll → decode → handle → ack.
//!
//! ## Dispositions
//!
//! | Handler result | Queue action |
//! |----------------|--------------|
//! | `Ok(Outcome::Done)` / `Ok(Outcome::Skipped)` | ack |
//! | `Err(WorkerError::Permanent)`, undecodable body, wrong topic | copy to dead-letter queue, ack |
//! | any other `Err` | no ack; redelivered after the visibility window |
//! | `receive_count > max_receives` | dead-letter without handling, `on_dead_letter` hook |
//!
//! Handlers must be idempotent: the queue delivers at least once.

use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use annoflow_events::{BusError, DelayError, MessageQueue, Notification, QueueError, QueueMessage};

use crate::accounts::ProfileError;
use crate::metadata::StoreError;
use crate::storage::{ColdError, HotStoreError};
use crate::task::TaskError;

use super::WorkerHandle;

/// Successful handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// Nothing to do: a benign precondition did not hold (duplicate or late delivery).
    Skipped(String),
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Retry later (dependency unavailable, record not visible yet, job owned elsewhere).
    #[error("transient: {0}")]
    Transient(String),

    /// Retrying cannot help; dead-letter immediately.
    #[error("permanent: {0}")]
    Permanent(String),

    /// The processing task failed; retried until the receive cap.
    #[error("task failed: {0}")]
    Task(#[from] TaskError),
}

impl WorkerError {
    pub fn transient(msg: impl Into<String>) -> Self {
        WorkerError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        WorkerError::Permanent(msg.into())
    }
}

macro_rules! transient_from {
    ($($t:ty),* $(,)?) => {
        $(
            impl From<$t> for WorkerError {
                fn from(err: $t) -> Self {
                    WorkerError::Transient(err.to_string())
                }
            }
        )*
    };
}

transient_from!(StoreError, HotStoreError, ColdError, BusError, DelayError, ProfileError);

/// One pipeline component's message logic.
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Topic this handler consumes.
    fn topic(&self) -> &str;

    fn handle(&self, notification: &Notification) -> Result<Outcome, WorkerError>;

    /// Called when a message is dead-lettered (receive cap, permanent error).
    fn on_dead_letter(&self, _notification: Option<&Notification>, _reason: &str) {}
}

impl<H> MessageHandler for Arc<H>
where
    H: MessageHandler + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn topic(&self) -> &str {
        (**self).topic()
    }

    fn handle(&self, notification: &Notification) -> Result<Outcome, WorkerError> {
        (**self).handle(notification)
    }

    fn on_dead_letter(&self, notification: Option<&Notification>, reason: &str) {
        (**self).on_dead_letter(notification, reason)
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Messages per receive call.
    pub batch_size: usize,
    /// Long-poll wait per receive call.
    pub wait: Duration,
    /// Deliveries allowed before a message is dead-lettered.
    pub max_receives: u32,
    /// Pause after a failed receive.
    pub error_backoff: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            wait: Duration::from_secs(20),
            max_receives: 5,
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Runtime counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub received: u64,
    pub done: u64,
    pub skipped: u64,
    /// Left unacked for redelivery.
    pub retried: u64,
    pub dead_lettered: u64,
    pub ack_failures: u64,
    pub uptime_secs: u64,
}

/// What happened to one received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Acked(Outcome),
    Retry(String),
    DeadLettered(String),
}

/// Drives one queue with one handler.
pub struct QueueWorker<H> {
    queue: Arc<dyn MessageQueue>,
    dead_letters: Option<Arc<dyn MessageQueue>>,
    handler: H,
    config: RunnerConfig,
    stats: Arc<Mutex<WorkerStats>>,
}

impl<H: MessageHandler + 'static> QueueWorker<H> {
    pub fn new(queue: Arc<dyn MessageQueue>, handler: H, config: RunnerConfig) -> Self {
        Self {
            queue,
            dead_letters: None,
            handler,
            config,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn with_dead_letters(mut self, dlq: Arc<dyn MessageQueue>) -> Self {
        self.dead_letters = Some(dlq);
        self
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Receive one batch and process it (for tests or synchronous use).
    pub fn poll_once(&self) -> Result<Vec<Disposition>, QueueError> {
        self.poll(self.config.wait)
    }

    fn poll(&self, wait: Duration) -> Result<Vec<Disposition>, QueueError> {
        let messages = self.queue.receive(self.config.batch_size, wait)?;
        Ok(messages.into_iter().map(|m| self.process(m)).collect())
    }

    /// Process one delivery and settle it with the queue.
    pub fn process(&self, message: QueueMessage) -> Disposition {
        self.bump(|s| s.received += 1);
        let queue = self.queue.name().to_string();

        let notification = match Notification::from_body(&message.body) {
            Ok(n) => n,
            Err(e) => {
                let reason = format!("undecodable message body: {e}");
                return self.dead_letter(&message, None, reason);
            }
        };

        if message.receive_count > self.config.max_receives {
            let reason = format!(
                "receive count {} exceeds limit {}",
                message.receive_count, self.config.max_receives
            );
            return self.dead_letter(&message, Some(&notification), reason);
        }

        if notification.topic() != self.handler.topic() {
            let reason = format!(
                "topic {} routed to {} handler",
                notification.topic(),
                self.handler.name()
            );
            return self.dead_letter(&message, Some(&notification), reason);
        }

        debug!(
            worker = self.handler.name(),
            queue = %queue,
            message_id = %notification.message_id(),
            receive_count = message.receive_count,
            "handling message"
        );

        match self.handler.handle(&notification) {
            Ok(outcome) => {
                if let Outcome::Skipped(reason) = &outcome {
                    info!(
                        worker = self.handler.name(),
                        message_id = %notification.message_id(),
                        reason = %reason,
                        "message skipped"
                    );
                    self.bump(|s| s.skipped += 1);
                } else {
                    self.bump(|s| s.done += 1);
                }
                self.ack(&message);
                Disposition::Acked(outcome)
            }
            Err(WorkerError::Permanent(reason)) => self.dead_letter(&message, Some(&notification), reason),
            Err(err) => {
                warn!(
                    worker = self.handler.name(),
                    queue = %queue,
                    message_id = %notification.message_id(),
                    receive_count = message.receive_count,
                    error = %err,
                    "message left for redelivery"
                );
                self.bump(|s| s.retried += 1);
                Disposition::Retry(err.to_string())
            }
        }
    }

    fn dead_letter(&self, message: &QueueMessage, notification: Option<&Notification>, reason: String) -> Disposition {
        if let Some(dlq) = &self.dead_letters {
            if let Err(e) = dlq.send(message.body.clone()) {
                // Keep the message; it comes back and we try again.
                error!(
                    worker = self.handler.name(),
                    dlq = dlq.name(),
                    error = %e,
                    "failed to move message to dead-letter queue"
                );
                self.bump(|s| s.retried += 1);
                return Disposition::Retry(format!("dead-letter failed: {e}"));
            }
        }

        error!(
            worker = self.handler.name(),
            queue = self.queue.name(),
            message_id = %message.message_id,
            receive_count = message.receive_count,
            reason = %reason,
            "message dead-lettered"
        );
        self.handler.on_dead_letter(notification, &reason);
        self.bump(|s| s.dead_lettered += 1);
        self.ack(message);
        Disposition::DeadLettered(reason)
    }

    fn ack(&self, message: &QueueMessage) {
        if let Err(e) = self.queue.ack(&message.receipt_handle) {
            // Already redelivered elsewhere; that delivery will be handled idempotently.
            warn!(
                worker = self.handler.name(),
                queue = self.queue.name(),
                message_id = %message.message_id,
                error = %e,
                "ack failed"
            );
            self.bump(|s| s.ack_failures += 1);
        }
    }

    fn bump(&self, f: impl FnOnce(&mut WorkerStats)) {
        if let Ok(mut s) = self.stats.lock() {
            f(&mut s);
        }
    }

    /// Spawn the worker on a named background thread.
    ///
    /// Shutdown is checked between receive calls, which long-poll for at most
    /// `shutdown_check` at a time.
    pub fn spawn(self, shutdown_check: Duration) -> std::io::Result<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = self.stats.clone();
        let name = format!("{}-worker", self.handler.name());

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(self, shutdown_rx, shutdown_check))?;

        Ok(WorkerHandle::new(name, shutdown_tx, join, stats))
    }
}

fn worker_loop<H: MessageHandler + 'static>(
    worker: QueueWorker<H>,
    shutdown_rx: mpsc::Receiver<()>,
    shutdown_check: Duration,
) {
    let name = worker.handler.name().to_string();
    info!(worker = %name, queue = worker.queue.name(), "queue worker started");
    let started = Instant::now();
    let wait = worker.config.wait.min(shutdown_check);

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }
        worker.bump(|s| s.uptime_secs = started.elapsed().as_secs());

        if let Err(e) = worker.poll(wait) {
            error!(worker = %name, queue = worker.queue.name(), error = %e, "receive failed");
            thread::sleep(worker.config.error_backoff);
        }
    }

    info!(worker = %name, "queue worker stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use annoflow_events::InMemoryQueue;

    use super::*;

    struct Scripted {
        result: fn() -> Result<Outcome, WorkerError>,
        calls: AtomicUsize,
        dead: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(result: fn() -> Result<Outcome, WorkerError>) -> Arc<Self> {
            Arc::new(Self {
                result,
                calls: AtomicUsize::new(0),
                dead: Mutex::new(Vec::new()),
            })
        }
    }

    impl MessageHandler for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn topic(&self) -> &str {
            "t"
        }

        fn handle(&self, _n: &Notification) -> Result<Outcome, WorkerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }

        fn on_dead_letter(&self, _n: Option<&Notification>, reason: &str) {
            self.dead.lock().unwrap().push(reason.to_string());
        }
    }

    struct Fixture {
        queue: Arc<InMemoryQueue>,
        dlq: Arc<InMemoryQueue>,
    }

    fn fixture(visibility: Duration) -> Fixture {
        Fixture {
            queue: InMemoryQueue::arc("q", visibility),
            dlq: InMemoryQueue::arc("q-dlq", Duration::from_secs(30)),
        }
    }

    fn config(max_receives: u32) -> RunnerConfig {
        RunnerConfig {
            batch_size: 10,
            wait: Duration::from_millis(200),
            max_receives,
            error_backoff: Duration::from_millis(10),
        }
    }

    fn send(q: &InMemoryQueue, topic: &str) {
        let n = Notification::new(topic, serde_json::json!({"x": 1}));
        q.send(n.to_body().unwrap()).unwrap();
    }

    fn worker(f: &Fixture, h: Arc<Scripted>, max_receives: u32) -> QueueWorker<Arc<Scripted>> {
        QueueWorker::new(f.queue.clone(), h, config(max_receives)).with_dead_letters(f.dlq.clone())
    }

    #[test]
    fn done_and_skipped_are_acked() {
        let f = fixture(Duration::from_secs(30));
        let h = Scripted::new(|| Ok(Outcome::Skipped("already done".into())));
        let w = worker(&f, h.clone(), 5);
        send(&f.queue, "t");

        let d = w.poll_once().unwrap();
        assert_eq!(d, vec![Disposition::Acked(Outcome::Skipped("already done".into()))]);
        assert_eq!(f.queue.depth(), (0, 0));
        assert_eq!(w.stats().skipped, 1);
    }

    #[test]
    fn transient_errors_leave_message_for_redelivery() {
        let f = fixture(Duration::from_millis(20));
        let h = Scripted::new(|| Err(WorkerError::transient("db down")));
        let w = worker(&f, h.clone(), 5);
        send(&f.queue, "t");

        assert!(matches!(w.poll_once().unwrap()[..], [Disposition::Retry(_)]));
        assert_eq!(f.queue.depth(), (0, 1));

        // Reappears after the window with a higher receive count.
        let again = f.queue.receive(1, Duration::from_millis(500)).unwrap();
        assert_eq!(again[0].receive_count, 2);
    }

    #[test]
    fn permanent_errors_go_to_dead_letter_queue() {
        let f = fixture(Duration::from_secs(30));
        let h = Scripted::new(|| Err(WorkerError::permanent("bad payload")));
        let w = worker(&f, h.clone(), 5);
        send(&f.queue, "t");

        assert_eq!(
            w.poll_once().unwrap(),
            vec![Disposition::DeadLettered("bad payload".into())]
        );
        assert_eq!(f.queue.depth(), (0, 0));
        assert_eq!(f.dlq.depth(), (1, 0));
        assert_eq!(h.dead.lock().unwrap().len(), 1);
    }

    #[test]
    fn receive_cap_dead_letters_without_handling() {
        let f = fixture(Duration::from_millis(10));
        let h = Scripted::new(|| Err(WorkerError::transient("still failing")));
        let w = worker(&f, h.clone(), 2);
        send(&f.queue, "t");

        let mut last = Vec::new();
        for _ in 0..3 {
            last = w.poll_once().unwrap();
        }
        assert!(matches!(last[..], [Disposition::DeadLettered(_)]));
        assert_eq!(h.calls.load(Ordering::SeqCst), 2);
        assert_eq!(f.dlq.depth(), (1, 0));
        assert_eq!(f.queue.depth(), (0, 0));
    }

    #[test]
    fn garbage_and_misrouted_messages_are_dead_lettered() {
        let f = fixture(Duration::from_secs(30));
        let h = Scripted::new(|| Ok(Outcome::Done));
        let w = worker(&f, h.clone(), 5);
        f.queue.send("not json".into()).unwrap();
        send(&f.queue, "other-topic");

        let d = w.poll_once().unwrap();
        assert_eq!(d.len(), 2);
        assert!(d.iter().all(|x| matches!(x, Disposition::DeadLettered(_))));
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.dlq.depth(), (2, 0));
    }

    #[test]
    fn spawned_worker_drains_queue_and_stops() {
        let f = fixture(Duration::from_secs(30));
        let h = Scripted::new(|| Ok(Outcome::Done));
        for _ in 0..3 {
            send(&f.queue, "t");
        }

        let handle = worker(&f, h.clone(), 5)
            .spawn(Duration::from_millis(50))
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().done < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let stats = handle.shutdown();
        assert_eq!(stats.done, 3);
        assert_eq!(f.queue.depth(), (0, 0));
    }
}
