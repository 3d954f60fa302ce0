//! Queue worker command.

use anyhow::{Context, Result};
use dockrun_config::RunnerConfig;
use dockrun_executor::DockerRuntime;
use dockrun_scheduler::queue;
use dockrun_scheduler::{
    AmqpEventPublisher, AmqpJobSource, BuildPipeline, ConsulRegistry, Heartbeat, Worker,
};
use std::sync::Arc;
use tracing::{info, warn};

use super::pipeline_settings;

/// Consume jobs until the broker closes the consumer or Ctrl-C is pressed.
pub async fn serve(config: RunnerConfig) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    info!(?config, "Starting dockrun worker");

    let runtime = DockerRuntime::connect().context("Failed to connect to Docker")?;
    runtime
        .ping()
        .await
        .context("Docker daemon is not responding")?;

    let connection = queue::connect(&config.amqp_url())
        .await
        .context("Failed to connect to RabbitMQ")?;
    let events = AmqpEventPublisher::open(&connection, &config.event_queue, config.durable_queues)
        .await
        .context("Failed to open event queue")?;
    let source = AmqpJobSource::open(&connection, &config.job_queue, config.durable_queues)
        .await
        .context("Failed to open job queue")?;

    let pipeline = Arc::new(BuildPipeline::new(
        Arc::new(runtime),
        Arc::new(events),
        pipeline_settings(&config),
    ));

    let registry = ConsulRegistry::new(config.registry_url()?, config.registry_token())
        .context("Failed to create registry client")?;
    let heartbeat = Heartbeat::new(registry, &config.service_name, config.heartbeat_ttl())
        .context("Invalid heartbeat settings")?
        .start()
        .await;

    let worker = Worker::new(source, pipeline);
    info!(queue = %config.job_queue, "Waiting for messages. To exit press CTRL+C");

    let consumer_closed = tokio::select! {
        _ = worker.run() => true,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutting down");
            false
        }
    };

    heartbeat.stop().await;
    if let Err(e) = connection.close(200, "shutdown").await {
        warn!(error = %e, "Failed to close broker connection");
    }

    if consumer_closed {
        anyhow::bail!("job consumer closed by broker");
    }
    Ok(())
}
