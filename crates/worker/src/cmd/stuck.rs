use std::time::Duration;

use chrono::Utc;
use tokio::runtime::Runtime;

use annoflow_infra::PipelineConfig;
use annoflow_infra::monitor::{find_stuck_jobs, job_stats};

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Minimum age, in seconds, of an unfinished job to report
    #[arg(long, default_value_t = 3600)]
    older_than_secs: u64,
}

pub fn run(args: Args, config: PipelineConfig, runtime: &Runtime) -> anyhow::Result<()> {
    let pipeline = super::connect(config, runtime)?;
    let stuck = find_stuck_jobs(
        pipeline.metadata.as_ref(),
        Duration::from_secs(args.older_than_secs),
        Utc::now(),
    )?;
    let stats = job_stats(pipeline.metadata.as_ref())?;

    let report = serde_json::json!({
        "stats": stats,
        "stuck": stuck,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
