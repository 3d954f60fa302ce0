//! Runner settings.

use crate::{ConfigError, ConfigResult};
use clap::Args;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Settings for the build worker, read from flags or the environment.
#[derive(Clone, Args)]
pub struct RunnerConfig {
    /// Message broker host
    #[arg(long, env = "RABBIT_HOST", default_value = "localhost")]
    pub rabbit_host: String,

    /// Message broker user
    #[arg(long, env = "RABBIT_USER", default_value = "docker")]
    pub rabbit_user: String,

    /// Message broker password
    #[arg(long, env = "RABBIT_PASSWORD", default_value = "docker", hide_env_values = true)]
    pub rabbit_password: String,

    /// Message broker port
    #[arg(long, env = "RABBIT_PORT", default_value_t = 5672)]
    pub rabbit_port: u16,

    /// Queue build jobs are consumed from
    #[arg(long, env = "RABBIT_RUNNER_QUEUE", default_value = "commands")]
    pub job_queue: String,

    /// Queue build events are published to
    #[arg(long, env = "RABBIT_EVENT_QUEUE", default_value = "events")]
    pub event_queue: String,

    /// Declare both queues as durable
    #[arg(long, env = "RABBIT_DURABLE")]
    pub durable_queues: bool,

    /// Root directory holding project sources
    #[arg(long, env = "FOLDER_PROJECTS", default_value = ".")]
    pub folder_projects: PathBuf,

    /// Root directory for per-run workspaces
    #[arg(long, env = "FOLDER_TAR", default_value = ".")]
    pub folder_tar: PathBuf,

    /// Service registry address
    #[arg(long, env = "CONSUL_ADDRESS", default_value = "127.0.0.1:8500")]
    pub consul_address: String,

    /// Service registry ACL token
    #[arg(long, env = "CONSUL_TOKEN", default_value = "", hide_env_values = true)]
    pub consul_token: String,

    /// Name the worker registers under
    #[arg(long, env = "RUNNER_SERVICE_NAME", default_value = "docker-runner")]
    pub service_name: String,

    /// Liveness check TTL in seconds; the heartbeat fires every half TTL
    #[arg(long, env = "RUNNER_HEARTBEAT_TTL", default_value_t = 15)]
    pub heartbeat_ttl_secs: u64,

    /// Per-command timeout in seconds, 0 to disable
    #[arg(long, env = "RUNNER_COMMAND_TIMEOUT", default_value_t = 3600)]
    pub command_timeout_secs: u64,

    /// Remove the built image when a run finishes
    #[arg(long, env = "RUNNER_REMOVE_IMAGES")]
    pub remove_images: bool,
}

impl RunnerConfig {
    /// Check values clap cannot check on its own.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.rabbit_port == 0 {
            return Err(invalid("rabbit_port", "must be non-zero"));
        }
        if self.job_queue.trim().is_empty() {
            return Err(invalid("job_queue", "must not be empty"));
        }
        if self.event_queue.trim().is_empty() {
            return Err(invalid("event_queue", "must not be empty"));
        }
        if self.service_name.trim().is_empty() {
            return Err(invalid("service_name", "must not be empty"));
        }
        if self.heartbeat_ttl_secs < 2 {
            return Err(invalid("heartbeat_ttl_secs", "must be at least 2 seconds"));
        }
        self.registry_url()?;
        Ok(())
    }

    /// AMQP connection URL with percent-encoded credentials.
    pub fn amqp_url(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/%2f",
            urlencoding::encode(&self.rabbit_user),
            urlencoding::encode(&self.rabbit_password),
            self.rabbit_host,
            self.rabbit_port
        )
    }

    /// Registry base URL. A bare `host:port` gets an `http://` scheme.
    pub fn registry_url(&self) -> ConfigResult<Url> {
        let address = self.consul_address.trim();
        if address.contains("://") {
            Ok(Url::parse(address)?)
        } else {
            Ok(Url::parse(&format!("http://{}", address))?)
        }
    }

    /// Registry token, if one is configured.
    pub fn registry_token(&self) -> Option<String> {
        if self.consul_token.is_empty() {
            None
        } else {
            Some(self.consul_token.clone())
        }
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        if self.command_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.command_timeout_secs))
        }
    }
}

impl fmt::Debug for RunnerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerConfig")
            .field("rabbit_host", &self.rabbit_host)
            .field("rabbit_user", &self.rabbit_user)
            .field("rabbit_password", &"<redacted>")
            .field("rabbit_port", &self.rabbit_port)
            .field("job_queue", &self.job_queue)
            .field("event_queue", &self.event_queue)
            .field("durable_queues", &self.durable_queues)
            .field("folder_projects", &self.folder_projects)
            .field("folder_tar", &self.folder_tar)
            .field("consul_address", &self.consul_address)
            .field("service_name", &self.service_name)
            .field("heartbeat_ttl_secs", &self.heartbeat_ttl_secs)
            .field("command_timeout_secs", &self.command_timeout_secs)
            .field("remove_images", &self.remove_images)
            .finish_non_exhaustive()
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}
