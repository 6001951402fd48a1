//! Infrastructure layer: stores, object tiers, queues, workers and wiring.

pub mod accounts;
pub mod config;
pub mod messaging;
pub mod metadata;
pub mod monitor;
pub mod pipeline;
pub mod storage;
pub mod submission;
pub mod task;
pub mod topology;
pub mod workers;

pub use config::{ConfigError, PipelineConfig};
pub use pipeline::{Component, Pipeline, PipelineError, RunningComponent};

#[cfg(test)]
mod integration_tests;
