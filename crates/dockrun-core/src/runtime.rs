//! Container runtime trait and build/exec result types.
//!
//! The runtime is an external collaborator: the pipeline only needs build,
//! create, exec and remove primitives from it.

use async_trait::async_trait;
use bytes::Bytes;

use crate::Result;

/// One classified line of a streamed image build log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildLine {
    /// Opaque progress output, kept as-is.
    Progress(String),
    /// The runtime reported a build failure.
    Error(String),
    /// The resulting image identifier, possibly digest-prefixed.
    Image(String),
}

/// Final outcome of an image build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Image(String),
    Failed(String),
}

/// Result of draining a build log. The log is kept on failure too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutput {
    pub outcome: BuildOutcome,
    pub log: String,
}

impl BuildOutput {
    /// Fold classified build lines into a final outcome.
    ///
    /// An error line wins over any identifier seen in the same stream. A
    /// stream with neither is treated as a failure.
    pub fn from_lines(lines: impl IntoIterator<Item = BuildLine>) -> Self {
        let mut log = String::new();
        let mut image = None;
        let mut error = None;

        for line in lines {
            match line {
                BuildLine::Progress(text) => log.push_str(&text),
                BuildLine::Error(reason) => {
                    log.push_str(&reason);
                    if !reason.ends_with('\n') {
                        log.push('\n');
                    }
                    error = Some(reason);
                }
                BuildLine::Image(id) => image = Some(strip_digest(&id).to_string()),
            }
        }

        let outcome = match (error, image) {
            (Some(reason), _) => BuildOutcome::Failed(reason),
            (None, Some(id)) if !id.is_empty() => BuildOutcome::Image(id),
            (None, _) => BuildOutcome::Failed("build produced no image identifier".to_string()),
        };

        Self { outcome, log }
    }
}

/// Strip a digest scheme tag such as `sha256:` from an identifier.
pub fn strip_digest(id: &str) -> &str {
    match id.split_once(':') {
        Some((_, rest)) => rest,
        None => id,
    }
}

/// Exit status and combined output of a command run in a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

/// Build, create, exec and remove primitives of a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Submit `archive` as a build context and drain the build log.
    ///
    /// Returns `Err(Error::Connect)` only when the runtime could not be
    /// reached. Build failures reported by the runtime are a
    /// [`BuildOutcome::Failed`] inside `Ok`.
    async fn build_image(&self, archive: Bytes, dockerfile: &str) -> Result<BuildOutput>;

    /// Create a container from `image` that stays up until removed, and
    /// start it. Returns the container id.
    async fn create_container(&self, image: &str, name: &str) -> Result<String>;

    /// Run one command to completion inside `container`.
    ///
    /// A non-zero exit code is a normal result, not an error.
    async fn exec(&self, container: &str, argv: &[String]) -> Result<ExecOutput>;

    /// Force-remove a container. Removing an unknown or empty id succeeds.
    async fn remove_container(&self, container: &str) -> Result<()>;

    /// Force-remove an image.
    async fn remove_image(&self, image: &str) -> Result<()>;
}
