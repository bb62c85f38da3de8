pub mod cache;
pub mod cluster;
pub mod exec;
#[cfg(any(test, feature = "fake"))]
pub mod fake;
pub mod fleet;
pub mod gce;
pub mod hetzner;
pub mod machine;
pub mod retry;
pub mod types;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use types::{ExecOutput, MachineAddress, MachineSpec};

pub use cluster::{ClusterFormer, ClusterSpec, ClusterState, FormedCluster};
pub use fleet::Fleet;
pub use retry::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("gce provider error: {0}")]
    Gce(#[from] gce_api::Error),

    #[error("hetzner api error: {0}")]
    HetznerApi(String),

    #[error("docker-machine error: {0}")]
    MachineDriver(String),

    #[error("machine not found: {0}")]
    NotFound(String),

    #[error("remote exec on {machine} failed: {reason}")]
    RemoteExec { machine: String, reason: String },

    #[error("{op} for {target} timed out after {secs}s")]
    Timeout {
        op: &'static str,
        target: String,
        secs: u64,
    },

    #[error("failed to provision {machine} after {attempts} attempt(s): {source}")]
    Provision {
        machine: String,
        attempts: u32,
        source: Box<Error>,
    },

    #[error("mesh init on {machine} failed: {reason}")]
    MeshInit { machine: String, reason: String },

    #[error("worker {machine} could not join the mesh: {reason}")]
    Join { machine: String, reason: String },

    #[error("cluster formation failed during {phase}: {source}")]
    ClusterFormation {
        phase: ClusterState,
        source: Box<Error>,
    },

    #[error("missing env var: {0}")]
    MissingEnv(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Markers of transient failures in free-form provider messages.
const TRANSIENT_MARKERS: &[&str] = &[
    "rate_limit",
    "rate limit",
    "too many requests",
    "timeout",
    "timed out",
    "connection",
    "unavailable",
    "reset",
    "broken pipe",
    "temporarily",
    "already exists",
    "resource_pool_exhausted",
    "locked",
];

/// Markers of configuration or account problems that a retry cannot fix.
const FATAL_MARKERS: &[&str] = &[
    "quota",
    "limit_exceeded",
    "permission",
    "forbidden",
    "unauthorized",
    "invalid",
    "not found",
    "notfound",
    "unknown",
];

/// Classify a free-form error message. Transient markers win over fatal ones,
/// unmatched messages are treated as transient.
fn message_is_retryable(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| msg.contains(m)) {
        return true;
    }
    !FATAL_MARKERS.iter().any(|m| msg.contains(m))
}

impl Error {
    /// Whether retrying the failed cloud operation can succeed.
    ///
    /// Quota, permission and invalid-request failures are fatal; network
    /// errors, throttling and server-side errors are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Gce(gce_api::Error::Request(_)) => true,
            Self::Gce(gce_api::Error::Operation { message, .. }) => message_is_retryable(message),
            Self::Gce(e @ gce_api::Error::Api { .. }) => match e.status() {
                Some(s) => s.as_u16() == 409 || s.as_u16() == 429 || s.is_server_error(),
                None => true,
            },
            Self::HetznerApi(msg) | Self::MachineDriver(msg) => message_is_retryable(msg),
            Self::RemoteExec { reason, .. } => message_is_retryable(reason),
            Self::Timeout { .. } => true,
            Self::Io(e) => e.kind() != std::io::ErrorKind::NotFound,
            Self::NotFound(_)
            | Self::Provision { .. }
            | Self::MeshInit { .. }
            | Self::Join { .. }
            | Self::ClusterFormation { .. }
            | Self::MissingEnv(_)
            | Self::UnknownProvider(_) => false,
        }
    }
}

/// Known cloud backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderName {
    Gce,
    Hetzner,
    DockerMachine,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gce => "gce",
            Self::Hetzner => "hetzner",
            Self::DockerMachine => "docker-machine",
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gce" => Ok(Self::Gce),
            "hetzner" => Ok(Self::Hetzner),
            "docker-machine" => Ok(Self::DockerMachine),
            other => Err(Error::UnknownProvider(other.to_string())),
        }
    }
}

/// Backend-agnostic interface for managing test-network machines.
///
/// Each backend (Compute Engine, Hetzner, docker-machine) implements this trait
/// and owns its own configuration, loaded from environment variables at
/// construction. Retry, address caching and prefix filtering live in [`Fleet`].
#[async_trait]
pub trait CloudProvider: Send + Sync + 'static {
    /// Create a machine and wait until it can run containers.
    async fn create_machine(&self, spec: &MachineSpec) -> Result<MachineAddress>;

    /// Delete a machine by name. Removing an absent machine is not an error.
    async fn remove_machine(&self, name: &str) -> Result<()>;

    /// Look up zone and addresses of a machine.
    async fn describe_machine(&self, name: &str) -> Result<MachineAddress>;

    /// Run a shell command on the machine over the backend's remote channel.
    async fn remote_exec(&self, target: &MachineAddress, command: &str) -> Result<ExecOutput>;

    /// Names of running machines that belong to `deployment`. Backends may
    /// over-match; callers filter by prefix.
    async fn list_machines(&self, deployment: &str) -> Result<Vec<String>>;

    /// Provider identifier.
    fn name(&self) -> ProviderName;
}

/// Registry of all configured cloud providers.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderName, Arc<dyn CloudProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own name, replacing any previous one.
    pub fn insert(&mut self, provider: Arc<dyn CloudProvider>) {
        self.providers.insert(provider.name(), provider);
    }

    /// Look up a provider by name.
    pub fn get(&self, name: ProviderName) -> Option<&Arc<dyn CloudProvider>> {
        self.providers.get(&name)
    }

    /// List the names of all available providers.
    pub fn available(&self) -> Vec<ProviderName> {
        self.providers.keys().copied().collect()
    }

    /// Returns `true` if no provider is configured.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Build all providers whose required env vars are present.
///
/// Providers with missing configuration are skipped with a debug log.
/// Returns an error only if no providers could be constructed at all.
pub fn build_providers() -> Result<ProviderRegistry> {
    dotenvy::dotenv().ok();

    let mut registry = ProviderRegistry::new();

    match gce::GceProvider::from_env() {
        Ok(p) => {
            tracing::info!("registered Compute Engine provider");
            registry.insert(Arc::new(p));
        }
        Err(e) => tracing::debug!("skipping Compute Engine provider: {e}"),
    }

    match hetzner::HetznerProvider::from_env() {
        Ok(p) => {
            tracing::info!("registered Hetzner Cloud provider");
            registry.insert(Arc::new(p));
        }
        Err(e) => tracing::debug!("skipping Hetzner provider: {e}"),
    }

    match machine::DockerMachineProvider::from_env() {
        Ok(p) => {
            tracing::info!("registered docker-machine provider");
            registry.insert(Arc::new(p));
        }
        Err(e) => tracing::debug!("skipping docker-machine provider: {e}"),
    }

    if registry.is_empty() {
        return Err(Error::MissingEnv(
            "no cloud providers configured (set GCE_ACCESS_TOKEN, HETZNER_API_TOKEN, and/or DOCKER_MACHINE_DRIVER)".into(),
        ));
    }

    Ok(registry)
}
