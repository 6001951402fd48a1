pub mod run;
pub mod stuck;
pub mod submit;
pub mod upgrade;

use anyhow::Context as _;
use tokio::runtime::Runtime;

use annoflow_infra::{Pipeline, PipelineConfig};

pub(crate) fn connect(config: PipelineConfig, runtime: &Runtime) -> anyhow::Result<Pipeline> {
    if config.database_url.is_none() {
        tracing::warn!("ANNOFLOW_DATABASE_URL not set; using process-local in-memory stores");
    }
    Pipeline::connect(config, runtime.handle().clone()).context("failed to connect pipeline backends")
}
