//! Background workers.
//!
//! Every pipeline component is a [`runner::MessageHandler`] driven by a
//! [`runner::QueueWorker`] on its own thread. The delay pump is the one
//! worker that does not consume a queue.

use std::sync::{Arc, Mutex, mpsc};
use std::thread;

pub mod annotator;
pub mod archiver;
pub mod delay_pump;
pub mod restorer;
pub mod runner;
pub mod thaw;

pub use annotator::{AnnotationWorker, AnnotatorConfig};
pub use archiver::Archiver;
pub use delay_pump::{DelayPump, PumpStats};
pub use restorer::Restorer;
pub use runner::{MessageHandler, Outcome, QueueWorker, RunnerConfig, WorkerError, WorkerStats};
pub use thaw::ThawInitiator;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle<S = WorkerStats> {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<S>>,
}

impl<S: Clone + Default> WorkerHandle<S> {
    pub(crate) fn new(
        name: String,
        shutdown: mpsc::Sender<()>,
        join: thread::JoinHandle<()>,
        stats: Arc<Mutex<S>>,
    ) -> Self {
        Self {
            name,
            shutdown,
            join: Some(join),
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current counters.
    pub fn stats(&self) -> S {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// The worker finishes the message it is handling first.
    pub fn shutdown(mut self) -> S {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                tracing::error!(worker = %self.name, "worker thread panicked");
            }
        }
        self.stats()
    }
}
