use std::collections::HashSet;

use anyhow::Context as _;
use tokio::runtime::Runtime;

use annoflow_infra::{Component, PipelineConfig, RunningComponent};

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Components to run (comma separated or repeated); all when omitted
    #[arg(value_delimiter = ',')]
    components: Vec<String>,
}

fn selected(args: &Args) -> anyhow::Result<Vec<Component>> {
    if args.components.is_empty() {
        return Ok(Component::ALL.to_vec());
    }
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for name in &args.components {
        let component: Component = name.trim().parse()?;
        if seen.insert(component) {
            out.push(component);
        }
    }
    Ok(out)
}

pub fn run(args: Args, config: PipelineConfig, runtime: &Runtime) -> anyhow::Result<()> {
    let components = selected(&args)?;
    let pipeline = super::connect(config, runtime)?;

    let mut running: Vec<RunningComponent> = Vec::with_capacity(components.len());
    for component in components {
        match pipeline.spawn(component) {
            Ok(r) => running.push(r),
            Err(e) => {
                for r in running {
                    r.shutdown();
                }
                return Err(e).with_context(|| format!("failed to start {component}"));
            }
        }
    }

    tracing::info!(components = running.len(), "running; press Ctrl-C to stop");
    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("shutdown requested");

    for r in running {
        r.shutdown();
    }
    Ok(())
}
