use tokio::runtime::Runtime;

use annoflow_core::UserId;
use annoflow_infra::PipelineConfig;
use annoflow_infra::accounts::upgrade_to_premium;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// User to upgrade
    #[arg(long)]
    user: String,
}

pub fn run(args: Args, config: PipelineConfig, runtime: &Runtime) -> anyhow::Result<()> {
    let user_id = UserId::parse(args.user)?;
    let pipeline = super::connect(config, runtime)?;
    let profile = upgrade_to_premium(pipeline.profiles.as_ref(), &pipeline.bus(), &user_id)?;
    println!("{}", serde_json::to_string_pretty(&profile)?);
    Ok(())
}
