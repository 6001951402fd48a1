//! Delay pump: publishes delayed notifications once they fall due.

use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use annoflow_events::{DelayError, DelayedScheduler, NotificationBus};

use super::WorkerHandle;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PumpStats {
    pub published: u64,
    /// Publishes that failed and were put back for a later attempt.
    pub rescheduled: u64,
    /// Claimed notifications that could neither be published nor put back.
    pub dropped: u64,
    pub scheduler_errors: u64,
}

pub struct DelayPump {
    scheduler: Arc<dyn DelayedScheduler>,
    bus: Arc<dyn NotificationBus>,
    batch_size: usize,
    interval: Duration,
    retry_delay: Duration,
    stats: Arc<Mutex<PumpStats>>,
}

impl DelayPump {
    pub fn new(scheduler: Arc<dyn DelayedScheduler>, bus: Arc<dyn NotificationBus>) -> Self {
        Self {
            scheduler,
            bus,
            batch_size: 100,
            interval: Duration::from_secs(1),
            retry_delay: Duration::from_secs(10),
            stats: Arc::new(Mutex::new(PumpStats::default())),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn stats(&self) -> PumpStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Promote and publish one batch of due notifications; returns how many were promoted.
    pub fn pump_once(&self) -> Result<usize, DelayError> {
        let due = self.scheduler.promote_due(Utc::now(), self.batch_size)?;
        let promoted = due.len();

        for notification in due {
            match self.bus.publish(&notification) {
                Ok(_) => {
                    debug!(topic = notification.topic(), message_id = %notification.message_id(), "delayed notification published");
                    self.bump(|s| s.published += 1);
                }
                Err(e) => {
                    warn!(
                        topic = notification.topic(),
                        message_id = %notification.message_id(),
                        error = %e,
                        "publish of delayed notification failed; rescheduling"
                    );
                    let retry_at = Utc::now()
                        + chrono::Duration::from_std(self.retry_delay).unwrap_or_else(|_| chrono::Duration::seconds(10));
                    let message_id = notification.message_id();
                    let topic = notification.topic().to_string();
                    match self.scheduler.schedule(notification, retry_at) {
                        Ok(()) => self.bump(|s| s.rescheduled += 1),
                        Err(e) => {
                            error!(
                                topic = %topic,
                                message_id = %message_id,
                                error = %e,
                                "delayed notification dropped: reschedule failed"
                            );
                            self.bump(|s| {
                                s.dropped += 1;
                                s.scheduler_errors += 1;
                            });
                        }
                    }
                }
            }
        }
        Ok(promoted)
    }

    fn bump(&self, f: impl FnOnce(&mut PumpStats)) {
        if let Ok(mut s) = self.stats.lock() {
            f(&mut s);
        }
    }

    /// Spawn the pump on a background thread.
    pub fn spawn(self) -> std::io::Result<WorkerHandle<PumpStats>> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = self.stats.clone();
        let name = "delay-pump".to_string();

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || pump_loop(self, shutdown_rx))?;

        Ok(WorkerHandle::new(name, shutdown_tx, join, stats))
    }
}

fn pump_loop(pump: DelayPump, shutdown_rx: mpsc::Receiver<()>) {
    info!(interval_ms = pump.interval.as_millis() as u64, "delay pump started");

    loop {
        let wait = match pump.pump_once() {
            // A full batch means more may be due already.
            Ok(n) if n >= pump.batch_size => Duration::ZERO,
            Ok(_) => pump.interval,
            Err(e) => {
                error!(error = %e, "delay pump failed");
                pump.bump(|s| s.scheduler_errors += 1);
                pump.interval
            }
        };

        match shutdown_rx.recv_timeout(wait) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
        }
    }

    info!("delay pump stopped");
}
