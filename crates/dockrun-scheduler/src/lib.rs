//! Job processing for the dockrun build worker.
//!
//! A [`Worker`] pulls build jobs from a [`JobSource`] one at a time and
//! hands each to the [`BuildPipeline`], which archives the project, builds
//! an image, runs the job's commands in a container and publishes one event
//! per stage. A [`Heartbeat`] keeps the worker registered with the service
//! registry independently of job processing.

pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod worker;

pub use pipeline::{
    BuildContext, BuildPipeline, PipelineResult, PipelineSettings, RunOutcome, Stage,
};
pub use queue::{AmqpEventPublisher, AmqpJobSource};
pub use registry::{ConsulRegistry, Heartbeat, HeartbeatHandle, Registry, ServiceRegistration};
pub use worker::{Delivery, JobHandler, JobSource, Worker};
