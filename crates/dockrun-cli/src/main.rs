//! dockrun build worker.

use clap::{Parser, Subcommand};
use dockrun_config::RunnerConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "dockrun")]
#[command(about = "Queue-driven container build worker", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "DOCKRUN_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume build jobs from the queue and keep the registry heartbeat alive
    Serve {
        #[command(flatten)]
        config: RunnerConfig,
    },
    /// Run a single job file against the local Docker daemon
    Run {
        /// Path to a job JSON file
        job: PathBuf,

        #[command(flatten)]
        config: RunnerConfig,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Serve { config } => {
            commands::serve::serve(config).await?;
        }
        Commands::Run { job, config } => {
            let success = commands::run::run_job(&job, config).await?;
            if !success {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
