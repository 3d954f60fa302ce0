//! Error types for dockrun.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("workspace error: {0}")]
    Workspace(String),

    #[error("archive error: {0}")]
    ArchiveIo(String),

    #[error("connection error: {0}")]
    Connect(String),

    #[error("build failed: {reason}")]
    BuildFailed { reason: String },

    #[error("failed to create container: {0}")]
    ContainerCreate(String),

    /// The container exists but could not be started. The id is kept so the
    /// caller can still remove it.
    #[error("failed to start container {container_id}: {message}")]
    ContainerStart {
        container_id: String,
        message: String,
    },

    #[error("failed to attach command: {0}")]
    ExecAttach(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("registry error: {0}")]
    Registry(String),
}

pub type Result<T> = std::result::Result<T, Error>;
