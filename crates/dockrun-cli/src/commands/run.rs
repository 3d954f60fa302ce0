//! Local single-job execution command.

use anyhow::{Context, Result};
use async_trait::async_trait;
use dockrun_config::RunnerConfig;
use dockrun_core::{BuildJob, Error, Event, EventSink};
use dockrun_executor::DockerRuntime;
use dockrun_scheduler::{BuildPipeline, RunOutcome};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

use super::pipeline_settings;

/// Prints each event as a JSON line on stdout.
struct StdoutSink;

#[async_trait]
impl EventSink for StdoutSink {
    async fn publish(&self, event: Event) -> dockrun_core::Result<()> {
        let line = serde_json::to_string(&event).map_err(|e| Error::InvalidInput(e.to_string()))?;
        println!("{}", line);
        Ok(())
    }
}

fn load_job(path: &Path) -> Result<BuildJob> {
    let content = std::fs::read(path)
        .with_context(|| format!("Failed to read job file: {}", path.display()))?;
    BuildJob::from_slice(&content)
        .with_context(|| format!("Failed to parse job file: {}", path.display()))
}

/// Run one job against the local Docker daemon. Returns whether it succeeded.
pub async fn run_job(path: &Path, config: RunnerConfig) -> Result<bool> {
    let job = load_job(path)?;

    let runtime = DockerRuntime::connect().context("Failed to connect to Docker")?;
    let pipeline = BuildPipeline::new(
        Arc::new(runtime),
        Arc::new(StdoutSink),
        pipeline_settings(&config),
    );

    let result = pipeline.run(&job).await;
    match &result.outcome {
        RunOutcome::Succeeded => info!(run_id = %result.run_id, "Job succeeded"),
        RunOutcome::Failed { stage, reason } => {
            error!(run_id = %result.run_id, stage = %stage, reason = %reason, "Job failed")
        }
    }

    Ok(result.outcome.is_success())
}
