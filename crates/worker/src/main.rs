use clap::Parser as _;

mod cmd;

fn main() {
    annoflow_observability::init();

    if let Err(err) = run() {
        tracing::error!("annoflow-worker failed: {err:#}");
        std::process::exit(1);
    }
}

/// Job lifecycle and storage-tiering pipeline.
#[derive(Debug, clap::Parser)]
#[command(name = "annoflow-worker")]
#[command(about = "Runs annoflow pipeline components and operator commands")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Run one or more pipeline components until Ctrl-C
    ///
    /// Components: annotator, archiver, thaw, restorer, delay-pump.
    /// With none given, all of them run in this process.
    Run(cmd::run::Args),

    /// Upload an input file and submit a job for it
    Submit(cmd::submit::Args),

    /// Move a user to the premium tier and trigger the thaw
    Upgrade(cmd::upgrade::Args),

    /// List jobs stuck in PENDING or RUNNING, with per-status counts
    Stuck(cmd::stuck::Args),
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = annoflow_infra::PipelineConfig::from_env()?;

    // Store clients block on this runtime from plain threads, so `main`
    // stays synchronous.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("annoflow-io")
        .build()?;

    match cli.command {
        Commands::Run(args) => cmd::run::run(args, config, &runtime),
        Commands::Submit(args) => cmd::submit::run(args, config, &runtime),
        Commands::Upgrade(args) => cmd::upgrade::run(args, config, &runtime),
        Commands::Stuck(args) => cmd::stuck::run(args, config, &runtime),
    }
}
