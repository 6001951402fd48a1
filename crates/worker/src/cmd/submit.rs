use std::path::PathBuf;

use anyhow::Context as _;
use bytes::Bytes;
use tokio::runtime::Runtime;

use annoflow_core::{JobId, UserId};
use annoflow_infra::PipelineConfig;
use annoflow_infra::submission::{SubmitRequest, stage_input, submit_job};

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Owner of the job
    #[arg(long)]
    user: String,

    /// Address the completion notice goes to
    #[arg(long)]
    email: String,

    /// Local input file
    #[arg(long)]
    file: PathBuf,

    /// Job id; generated when omitted
    #[arg(long)]
    job_id: Option<String>,
}

pub fn run(args: Args, config: PipelineConfig, runtime: &Runtime) -> anyhow::Result<()> {
    let user_id = UserId::parse(args.user)?;
    let job_id = match args.job_id {
        Some(id) => JobId::parse(id)?,
        None => JobId::generate(),
    };
    let file_name = args
        .file
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .with_context(|| format!("{} has no usable file name", args.file.display()))?;
    let data = std::fs::read(&args.file).with_context(|| format!("failed to read {}", args.file.display()))?;

    let pipeline = super::connect(config, runtime)?;
    let input = stage_input(
        pipeline.hot.as_ref(),
        &pipeline.config.inputs_bucket,
        &pipeline.config.key_prefix,
        &user_id,
        &job_id,
        &file_name,
        Bytes::from(data),
    )?;

    let job = submit_job(
        pipeline.metadata.as_ref(),
        &pipeline.bus(),
        SubmitRequest {
            job_id,
            user_id,
            owner_email: args.email,
            input_file_name: file_name,
            input,
        },
    )?;

    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}
