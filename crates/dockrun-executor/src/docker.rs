//! Local Docker runtime backend.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, RemoveImageOptions};
use bollard::models::{BuildInfo, ExecInspectResponse};
use bytes::Bytes;
use dockrun_core::runtime::{BuildLine, BuildOutput, ContainerRuntime, ExecOutput};
use dockrun_core::{Error, Result};
use futures::{Stream, StreamExt};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Keeps a container alive until it is removed.
const IDLE_COMMAND: [&str; 3] = ["tail", "-f", "/dev/null"];

/// The daemon can report an exec as running for a moment after its output
/// stream has closed.
const EXEC_INSPECT_ATTEMPTS: u32 = 50;
const EXEC_INSPECT_DELAY: Duration = Duration::from_millis(100);

/// The local Docker daemon as a container runtime.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon using the environment defaults.
    pub fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Connect(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Check that the daemon answers.
    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| Error::Connect(e.to_string()))
    }

    fn build_options(dockerfile: &str) -> BuildImageOptions<String> {
        BuildImageOptions {
            dockerfile: dockerfile.to_string(),
            q: false,
            rm: true,
            forcerm: true,
            pull: true,
            ..Default::default()
        }
    }

    fn container_config(image: &str) -> Config<String> {
        Config {
            image: Some(image.to_string()),
            cmd: Some(IDLE_COMMAND.iter().map(|s| s.to_string()).collect()),
            tty: Some(false),
            ..Default::default()
        }
    }
}

/// Sort one build log record into progress, error or identifier.
fn classify(info: BuildInfo) -> BuildLine {
    if let Some(error) = info.error {
        return BuildLine::Error(error);
    }
    if let Some(message) = info.error_detail.and_then(|detail| detail.message) {
        return BuildLine::Error(message);
    }
    if let Some(id) = info.aux.and_then(|aux| aux.id) {
        return BuildLine::Image(id);
    }
    match (info.stream, info.status) {
        (Some(stream), _) => BuildLine::Progress(stream),
        (None, Some(status)) => BuildLine::Progress(format!("{}\n", status)),
        (None, None) => BuildLine::Progress(String::new()),
    }
}

/// Removal of something that is already gone counts as success.
fn is_already_gone(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404 | 409,
            ..
        }
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn build_image(&self, archive: Bytes, dockerfile: &str) -> Result<BuildOutput> {
        info!(dockerfile, size = archive.len(), "Building image");

        let mut stream = std::pin::pin!(self.docker.build_image(
            Self::build_options(dockerfile),
            None,
            Some(archive),
        ));

        let mut lines = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(record) => {
                    let line = classify(record);
                    if let BuildLine::Progress(ref text) = line {
                        debug!(line = %text.trim_end(), "Build progress");
                    }
                    lines.push(line);
                }
                Err(DockerError::DockerStreamError { error }) => {
                    lines.push(BuildLine::Error(error));
                }
                Err(DockerError::DockerResponseServerError {
                    status_code,
                    message,
                }) => {
                    lines.push(BuildLine::Error(format!(
                        "runtime rejected build ({}): {}",
                        status_code, message
                    )));
                    break;
                }
                Err(e) => return Err(Error::Connect(e.to_string())),
            }
        }

        Ok(BuildOutput::from_lines(lines))
    }

    async fn create_container(&self, image: &str, name: &str) -> Result<String> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        info!(container = %name, image, "Creating container");
        let created = self
            .docker
            .create_container(Some(options), Self::container_config(image))
            .await
            .map_err(|e| Error::ContainerCreate(e.to_string()))?;

        for warning in &created.warnings {
            warn!(container = %name, warning = %warning, "Container create warning");
        }

        info!(container = %name, id = %created.id, "Starting container");
        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::ContainerStart {
                container_id: created.id.clone(),
                message: e.to_string(),
            })?;

        Ok(created.id)
    }

    async fn exec(&self, container: &str, argv: &[String]) -> Result<ExecOutput> {
        let options = CreateExecOptions {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(argv.to_vec()),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(container, options)
            .await
            .map_err(|e| Error::ExecAttach(e.to_string()))?;

        let output = match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| Error::ExecAttach(e.to_string()))?
        {
            StartExecResults::Attached { output, .. } => drain_output(output).await?,
            StartExecResults::Detached => {
                return Err(Error::ExecAttach("exec started detached".to_string()));
            }
        };

        let exec_id = exec.id.as_str();
        let exit_code = wait_for_exit(|| async move {
            self.docker
                .inspect_exec(exec_id)
                .await
                .map_err(|e| Error::ExecAttach(e.to_string()))
        })
        .await?;

        debug!(container, exit_code, "Command finished");
        Ok(ExecOutput { exit_code, output })
    }

    async fn remove_container(&self, container: &str) -> Result<()> {
        if container.is_empty() {
            return Ok(());
        }

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.docker.remove_container(container, Some(options)).await {
            Ok(()) => {
                info!(container, "Container removed");
                Ok(())
            }
            Err(e) if is_already_gone(&e) => {
                debug!(container, "Container already removed");
                Ok(())
            }
            Err(e) => Err(Error::Connect(format!(
                "failed to remove container {}: {}",
                container, e
            ))),
        }
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        if image.is_empty() {
            return Ok(());
        }

        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };

        match self.docker.remove_image(image, Some(options), None).await {
            Ok(_) => {
                info!(image, "Image removed");
                Ok(())
            }
            Err(e) if is_already_gone(&e) => Ok(()),
            Err(e) => Err(Error::Connect(format!(
                "failed to remove image {}: {}",
                image, e
            ))),
        }
    }
}

/// Collect combined exec output. Frames can split a multibyte character, so
/// the bytes are decoded once at the end.
async fn drain_output<S>(mut stream: S) -> Result<String>
where
    S: Stream<Item = std::result::Result<LogOutput, DockerError>> + Unpin,
{
    let mut bytes = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::ExecAttach(e.to_string()))?;
        bytes.extend_from_slice(&chunk.into_bytes());
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn finished_exit_code(inspect: &ExecInspectResponse) -> Option<i64> {
    if inspect.running == Some(true) {
        return None;
    }
    inspect.exit_code
}

/// Inspect until the exec reports an exit code.
async fn wait_for_exit<F, Fut>(mut inspect: F) -> Result<i64>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<ExecInspectResponse>>,
{
    for attempt in 1..=EXEC_INSPECT_ATTEMPTS {
        if let Some(code) = finished_exit_code(&inspect().await?) {
            return Ok(code);
        }
        if attempt < EXEC_INSPECT_ATTEMPTS {
            sleep(EXEC_INSPECT_DELAY).await;
        }
    }
    Err(Error::ExecAttach("exec finished without an exit code".to_string()))
}
