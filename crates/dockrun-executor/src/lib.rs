//! Build backends for the dockrun worker.
//!
//! - [`archive`]: packs a project directory into a tar build context
//! - [`docker`]: the local Docker daemon as a [`ContainerRuntime`]

pub mod archive;
pub mod docker;

pub use archive::create_archive;
pub use docker::DockerRuntime;
pub use dockrun_core::runtime::{BuildOutput, ContainerRuntime, ExecOutput};
