//! Service registry registration and TTL heartbeat.
//!
//! The worker registers itself with a TTL check and then reports `pass`
//! every half TTL. A failed report is logged and retried on the next tick;
//! if reports keep failing the registry marks the worker critical, which is
//! how a dead worker is detected.

use async_trait::async_trait;
use dockrun_core::{Error, Result};
use reqwest::{Client, RequestBuilder};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};
use url::Url;

/// A service definition with a TTL health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub check: TtlCheck,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TtlCheck {
    #[serde(rename = "TTL")]
    pub ttl: String,
}

impl ServiceRegistration {
    pub fn new(name: &str, ttl: Duration) -> Self {
        Self {
            id: name.to_string(),
            name: name.to_string(),
            check: TtlCheck {
                ttl: format_ttl(ttl),
            },
        }
    }

    /// Id of the check the registry creates for this service.
    pub fn check_id(&self) -> String {
        format!("service:{}", self.id)
    }
}

/// Render a TTL as a Consul duration, keeping sub-second precision.
fn format_ttl(ttl: Duration) -> String {
    if ttl.subsec_millis() == 0 {
        format!("{}s", ttl.as_secs())
    } else {
        format!("{}ms", ttl.as_millis())
    }
}

/// Operations the heartbeat needs from a service registry.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn register(&self, service: &ServiceRegistration) -> Result<()>;

    /// Mark a TTL check as passing.
    async fn pass(&self, check_id: &str) -> Result<()>;

    async fn deregister(&self, service_id: &str) -> Result<()>;
}

/// Consul agent HTTP API client.
pub struct ConsulRegistry {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl ConsulRegistry {
    pub fn new(mut base: Url, token: Option<String>) -> Result<Self> {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::Registry(e.to_string()))?;

        Ok(Self {
            client,
            base,
            token,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| Error::Registry(format!("invalid registry path {}: {}", path, e)))
    }

    fn put(&self, url: Url) -> RequestBuilder {
        let request = self.client.put(url);
        match &self.token {
            Some(token) => request.header("X-Consul-Token", token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<()> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::Connect(e.to_string()))?;
        response
            .error_for_status()
            .map_err(|e| Error::Registry(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Registry for ConsulRegistry {
    async fn register(&self, service: &ServiceRegistration) -> Result<()> {
        let url = self.endpoint("v1/agent/service/register")?;
        self.send(self.put(url).json(service)).await
    }

    async fn pass(&self, check_id: &str) -> Result<()> {
        let url = self.endpoint(&format!("v1/agent/check/pass/{}", check_id))?;
        self.send(self.put(url)).await
    }

    async fn deregister(&self, service_id: &str) -> Result<()> {
        let url = self.endpoint(&format!("v1/agent/service/deregister/{}", service_id))?;
        self.send(self.put(url)).await
    }
}

/// Keeps the worker's registration alive.
pub struct Heartbeat<R> {
    registry: Arc<R>,
    service: ServiceRegistration,
    period: Duration,
}

/// Shortest TTL the heartbeat accepts.
pub const MIN_TTL: Duration = Duration::from_secs(1);

impl<R: Registry + 'static> Heartbeat<R> {
    /// Fails with `InvalidInput` when `ttl` is below [`MIN_TTL`].
    pub fn new(registry: R, service_name: &str, ttl: Duration) -> Result<Self> {
        if ttl < MIN_TTL {
            return Err(Error::InvalidInput(format!(
                "heartbeat ttl must be at least {:?}, got {:?}",
                MIN_TTL, ttl
            )));
        }

        Ok(Self {
            registry: Arc::new(registry),
            service: ServiceRegistration::new(service_name, ttl),
            period: ttl / 2,
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Register the service and spawn the ticker.
    ///
    /// A failed registration is logged and retried on each tick.
    pub async fn start(self) -> HeartbeatHandle<R> {
        let registered = match self.registry.register(&self.service).await {
            Ok(()) => {
                info!(service = %self.service.id, ttl = %self.service.check.ttl, "Registered service");
                true
            }
            Err(e) => {
                error!(service = %self.service.id, error = %e, "Failed to register service");
                false
            }
        };

        let service_id = self.service.id.clone();
        let task = tokio::spawn(tick(
            self.registry.clone(),
            self.service,
            self.period,
            registered,
        ));

        HeartbeatHandle {
            task,
            registry: self.registry,
            service_id,
        }
    }
}

async fn tick<R: Registry>(
    registry: Arc<R>,
    service: ServiceRegistration,
    period: Duration,
    mut registered: bool,
) {
    let check_id = service.check_id();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        if !registered {
            match registry.register(&service).await {
                Ok(()) => {
                    info!(service = %service.id, "Registered service");
                    registered = true;
                }
                Err(e) => {
                    warn!(service = %service.id, error = %e, "Failed to register service");
                    continue;
                }
            }
        }

        match registry.pass(&check_id).await {
            Ok(()) => debug!(check = %check_id, "Heartbeat sent"),
            Err(e) => warn!(check = %check_id, error = %e, "Failed to send heartbeat"),
        }
    }
}

/// Running heartbeat task.
pub struct HeartbeatHandle<R: Registry> {
    task: JoinHandle<()>,
    registry: Arc<R>,
    service_id: String,
}

impl<R: Registry> HeartbeatHandle<R> {
    /// Stop ticking and remove the service from the registry.
    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;

        match self.registry.deregister(&self.service_id).await {
            Ok(()) => info!(service = %self.service_id, "Deregistered service"),
            Err(e) => warn!(service = %self.service_id, error = %e, "Failed to deregister service"),
        }
    }
}
