//! Worker that pulls build jobs from the queue one at a time.

use async_trait::async_trait;
use dockrun_core::{BuildJob, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// A message taken from the job queue.
#[async_trait]
pub trait Delivery: Send {
    fn body(&self) -> &[u8];

    /// Acknowledge the message so the broker does not redeliver it.
    async fn ack(&mut self) -> Result<()>;
}

/// Inbound job messages.
#[async_trait]
pub trait JobSource: Send {
    /// Wait for the next message. `None` once the source is closed.
    async fn next(&mut self) -> Option<Result<Box<dyn Delivery>>>;
}

/// Processes one decoded job to completion.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: BuildJob);
}

/// A worker that consumes and runs build jobs.
///
/// Messages are acknowledged before the job runs, so a job is processed at
/// most once even if the worker dies mid-build. The next message is not
/// pulled until the current job has finished, cleanup included.
pub struct Worker<S> {
    source: S,
    handler: Arc<dyn JobHandler>,
    error_backoff: Duration,
}

impl<S: JobSource> Worker<S> {
    pub fn new(source: S, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            source,
            handler,
            error_backoff: Duration::from_secs(1),
        }
    }

    /// Wait this long after the source reports an error.
    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Run the worker loop until the source closes.
    pub async fn run(mut self) {
        info!("Waiting for jobs");

        while let Some(next) = self.source.next().await {
            match next {
                Ok(delivery) => self.process(delivery).await,
                Err(e) => {
                    warn!(error = %e, "Failed to receive job message");
                    sleep(self.error_backoff).await;
                }
            }
        }

        info!("Job source closed");
    }

    async fn process(&self, mut delivery: Box<dyn Delivery>) {
        let decoded = BuildJob::from_slice(delivery.body());

        if let Err(e) = delivery.ack().await {
            error!(error = %e, "Failed to acknowledge job message, skipping");
            return;
        }

        match decoded {
            Ok(job) => {
                info!(
                    project_id = %job.project_id,
                    build_id = %job.build_id,
                    commands = job.commands.len(),
                    "Received job"
                );
                self.handler.handle(job).await;
            }
            Err(e) => {
                warn!(error = %e, size = delivery.body().len(), "Dropping malformed job message");
            }
        }
    }
}
