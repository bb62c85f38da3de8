//! Drives one experiment from config to a running network.
//!
//! Cloud runs go through every stage in order; local runs skip the machine
//! stages and hand the manifest to `docker compose`. The first failing stage
//! aborts the run and is recorded in `deployment.json` next to the manifest.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tn_infra::cluster::DEFAULT_CREATE_CONCURRENCY;
use tn_infra::exec::shell_quote;
use tn_infra::types::ExecOutput;
use tn_infra::{ClusterFormer, ClusterSpec, Fleet, ProviderName, ProviderRegistry, RetryPolicy};
use tn_topology::{
    ExperimentConfig, ManifestEmitter, NodePorts, RelationshipMap, Topology, TopologyGenerator,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::local::LocalEngine;

pub const RECORD_FILE: &str = "deployment.json";

/// In-mesh image registry, published on every node through the routing mesh.
pub const REGISTRY_ADDR: &str = "127.0.0.1:5000";

const REGISTRY_SERVICE: &str = "docker service create --detach --name registry \
     --publish published=5000,target=5000 registry:2";
const REMOTE_DIR: &str = "/var/tmp/testnet";
const MANIFEST_EOF: &str = "TESTNET_MANIFEST_EOF";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Topology,
    Manifest,
    ClusterFormation,
    RegistryBootstrap,
    ImageDistribution,
    StackDeploy,
    TearDown,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Topology => "topology",
            Self::Manifest => "manifest",
            Self::ClusterFormation => "cluster_formation",
            Self::RegistryBootstrap => "registry_bootstrap",
            Self::ImageDistribution => "image_distribution",
            Self::StackDeploy => "stack_deploy",
            Self::TearDown => "tear_down",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Cause {
    #[error(transparent)]
    Topology(#[from] tn_topology::Error),

    #[error(transparent)]
    Infra(#[from] tn_infra::Error),

    #[error("provider {0} is not configured")]
    ProviderUnavailable(ProviderName),

    #[error("deployment {0} is already in progress")]
    Busy(String),

    #[error("deployment {0} is running, tear it down first")]
    AlreadyDeployed(String),

    #[error("no deployment named {0}")]
    UnknownDeployment(String),

    #[error("deployment record {path}: {reason}")]
    Record { path: PathBuf, reason: String },
}

#[derive(Debug, thiserror::Error)]
#[error("{stage} failed: {source}")]
pub struct DeployError {
    pub stage: Stage,
    #[source]
    pub source: Cause,
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T, DeployError>;
}

impl<T, E: Into<Cause>> AtStage<T> for Result<T, E> {
    fn at(self, stage: Stage) -> Result<T, DeployError> {
        self.map_err(|e| DeployError {
            stage,
            source: e.into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeploymentStatus {
    Deploying,
    Deployed,
    Failed { stage: Stage, error: String },
    TornDown,
}

/// What collaborators need to reach a deployment. Persisted as
/// `deployment.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentHandle {
    pub name: String,
    pub run_id: Uuid,
    pub status: DeploymentStatus,
    pub local: bool,
    pub provider: Option<ProviderName>,
    /// Manager address every published port is reachable on.
    pub base_address: Option<String>,
    pub manifest_path: PathBuf,
    pub seed: u64,
    pub services: BTreeMap<String, NodePorts>,
    pub relationships: RelationshipMap,
    #[serde(default)]
    pub machines: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExperimentHandle {
    fn new(run_id: Uuid, topology: &Topology, manifest_path: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            name: topology.name.clone(),
            run_id,
            status: DeploymentStatus::Deploying,
            local: topology.local,
            provider: None,
            base_address: None,
            manifest_path,
            seed: topology.seed,
            services: topology.port_map(),
            relationships: topology.relationships.clone(),
            machines: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

fn lock(active: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    active.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks a deployment name busy until dropped.
struct RunGuard {
    active: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.name);
    }
}

fn is_deployment_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

pub struct DeploymentDriver {
    providers: ProviderRegistry,
    local: Arc<dyn LocalEngine>,
    output_dir: PathBuf,
    concurrency: usize,
    retry: RetryPolicy,
    active: Arc<Mutex<HashSet<String>>>,
}

impl DeploymentDriver {
    pub fn new(
        providers: ProviderRegistry,
        local: Arc<dyn LocalEngine>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            providers,
            local,
            output_dir: output_dir.into(),
            concurrency: DEFAULT_CREATE_CONCURRENCY,
            retry: RetryPolicy::default(),
            active: Arc::default(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn is_active(&self, name: &str) -> bool {
        lock(&self.active).contains(name)
    }

    fn claim(&self, name: &str) -> Result<RunGuard, Cause> {
        if !lock(&self.active).insert(name.to_string()) {
            return Err(Cause::Busy(name.to_string()));
        }
        Ok(RunGuard {
            active: self.active.clone(),
            name: name.to_string(),
        })
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.output_dir.join(name).join(RECORD_FILE)
    }

    /// Read the record of `name`, if one was ever written.
    pub fn load(&self, name: &str) -> Result<Option<ExperimentHandle>, Cause> {
        if !is_deployment_name(name) {
            return Ok(None);
        }

        let path = self.record_path(name);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Cause::Record {
                    path,
                    reason: e.to_string(),
                });
            }
        };

        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| Cause::Record {
                path,
                reason: e.to_string(),
            })
    }

    /// Every recorded deployment, sorted by name.
    pub fn list(&self) -> Result<Vec<ExperimentHandle>, Cause> {
        let entries = match std::fs::read_dir(&self.output_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Cause::Record {
                    path: self.output_dir.clone(),
                    reason: e.to_string(),
                });
            }
        };

        let mut handles = Vec::new();
        for entry in entries.flatten() {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match self.load(&name) {
                Ok(Some(handle)) => handles.push(handle),
                Ok(None) => {}
                Err(e) => warn!(deployment = %name, error = %e, "skipping unreadable deployment record"),
            }
        }
        handles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(handles)
    }

    fn save(&self, handle: &mut ExperimentHandle) -> Result<(), Cause> {
        handle.updated_at = Utc::now();
        let path = self.record_path(&handle.name);
        let record_err = |reason: String| Cause::Record {
            path: path.clone(),
            reason,
        };

        let json = serde_json::to_vec_pretty(handle).map_err(|e| record_err(e.to_string()))?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| record_err(e.to_string()))?;
        }
        std::fs::write(&path, json).map_err(|e| record_err(e.to_string()))
    }

    fn fleet(&self, name: ProviderName) -> Result<Fleet, Cause> {
        let provider = self
            .providers
            .get(name)
            .cloned()
            .ok_or(Cause::ProviderUnavailable(name))?;
        Ok(Fleet::with_policy(provider, self.retry.clone()))
    }

    /// Deploy `config`. Returns the handle once every service is scheduled.
    pub async fn run(&self, config: ExperimentConfig) -> Result<ExperimentHandle, DeployError> {
        let _guard = self.claim(&config.name).at(Stage::Topology)?;

        if let Some(existing) = self.load(&config.name).at(Stage::Topology)?
            && existing.status == DeploymentStatus::Deployed
        {
            return Err(DeployError {
                stage: Stage::Topology,
                source: Cause::AlreadyDeployed(config.name.clone()),
            });
        }

        let run_id = Uuid::new_v4();
        info!(deployment = %config.name, %run_id, local = config.local, "deployment started");

        let topology = TopologyGenerator::new(&config).generate().at(Stage::Topology)?;

        let emitter = if config.local {
            ManifestEmitter::new()
        } else {
            ManifestEmitter::with_registry(REGISTRY_ADDR)
        };
        let manifest_path = emitter
            .write(&topology, &self.output_dir)
            .at(Stage::Manifest)?;

        let mut handle = ExperimentHandle::new(run_id, &topology, manifest_path);
        self.save(&mut handle).at(Stage::Manifest)?;

        let result = if config.local {
            self.deploy_local(&mut handle).await
        } else {
            self.deploy_cloud(&config, &topology, &emitter, &mut handle)
                .await
        };

        match result {
            Ok(()) => {
                handle.status = DeploymentStatus::Deployed;
                self.save(&mut handle).at(Stage::StackDeploy)?;
                info!(
                    deployment = %handle.name,
                    %run_id,
                    services = handle.services.len(),
                    base = handle.base_address.as_deref().unwrap_or_default(),
                    "deployment running"
                );
                Ok(handle)
            }
            Err(e) => {
                handle.status = DeploymentStatus::Failed {
                    stage: e.stage,
                    error: e.source.to_string(),
                };
                if let Err(save_err) = self.save(&mut handle) {
                    warn!(deployment = %handle.name, error = %save_err, "could not record failure");
                }
                error!(deployment = %handle.name, %run_id, stage = %e.stage, error = %e.source, "deployment failed");
                Err(e)
            }
        }
    }

    async fn deploy_local(&self, handle: &mut ExperimentHandle) -> Result<(), DeployError> {
        self.local
            .up(&handle.manifest_path, &handle.name)
            .await
            .at(Stage::StackDeploy)?;
        handle.base_address = Some("127.0.0.1".into());
        Ok(())
    }

    async fn deploy_cloud(
        &self,
        config: &ExperimentConfig,
        topology: &Topology,
        emitter: &ManifestEmitter,
        handle: &mut ExperimentHandle,
    ) -> Result<(), DeployError> {
        let machines = &config.machines;
        let fleet = Arc::new(self.fleet(machines.provider).at(Stage::ClusterFormation)?);
        handle.provider = Some(machines.provider);

        let spec = ClusterSpec {
            zones: machines.zones.clone(),
            manager_machine_type: machines.manager_machine_type.clone(),
            worker_machine_type: machines.worker_machine_type.clone(),
            workers: machines.workers,
            tags: machines.tags.clone(),
            concurrency: self.concurrency,
            ..ClusterSpec::new(&config.name)
        };
        let former = ClusterFormer::new(fleet.clone(), spec);
        let formed = former.form().await;
        handle.machines = former.records().into_iter().map(|r| r.name).collect();
        let cluster = formed.at(Stage::ClusterFormation)?;

        handle.base_address = cluster.base_address().map(str::to_string);
        self.save(handle).at(Stage::ClusterFormation)?;
        let manager = cluster.manager.name.as_str();

        bootstrap_registry(&fleet, manager)
            .await
            .at(Stage::RegistryBootstrap)?;

        distribute_images(&fleet, manager, &topology.images(), self.concurrency)
            .await
            .at(Stage::ImageDistribution)?;

        let yaml = emitter.render(topology).at(Stage::StackDeploy)?;
        deploy_stack(&fleet, manager, &handle.name, &yaml)
            .await
            .at(Stage::StackDeploy)?;

        Ok(())
    }

    /// Stop a deployment. Cloud deployments lose every `<name>-` machine;
    /// the manifest and record stay on disk.
    pub async fn tear_down(&self, name: &str) -> Result<ExperimentHandle, DeployError> {
        let _guard = self.claim(name).at(Stage::TearDown)?;

        let mut handle = self
            .load(name)
            .at(Stage::TearDown)?
            .ok_or_else(|| Cause::UnknownDeployment(name.to_string()))
            .at(Stage::TearDown)?;

        if handle.local {
            self.local
                .down(&handle.manifest_path, name)
                .await
                .at(Stage::TearDown)?;
        } else if let Some(provider) = handle.provider {
            let fleet = self.fleet(provider).at(Stage::TearDown)?;
            let removed = fleet
                .remove_deployment(name, self.concurrency)
                .await
                .at(Stage::TearDown)?;
            info!(deployment = name, removed = removed.len(), "machines removed");
        }

        handle.status = DeploymentStatus::TornDown;
        handle.base_address = None;
        self.save(&mut handle).at(Stage::TearDown)?;
        Ok(handle)
    }
}

fn registry_ready(out: &ExecOutput) -> bool {
    out.success() || out.stderr.contains("already exists")
}

async fn bootstrap_registry(fleet: &Fleet, manager: &str) -> tn_infra::Result<()> {
    let out = fleet.remote_exec(manager, REGISTRY_SERVICE).await?;
    if !registry_ready(&out) {
        return Err(tn_infra::Error::RemoteExec {
            machine: manager.to_string(),
            reason: format!("registry service: {}", out.stderr.trim()),
        });
    }
    info!(machine = %manager, registry = REGISTRY_ADDR, "image registry up");
    Ok(())
}

/// Pull on the manager, retag into the mesh registry, push.
fn stage_image_command(image: &str) -> String {
    let src = shell_quote(image);
    let dst = shell_quote(&format!("{REGISTRY_ADDR}/{image}"));
    format!("docker pull {src} && docker tag {src} {dst} && docker push {dst}")
}

async fn distribute_images(
    fleet: &Fleet,
    manager: &str,
    images: &BTreeSet<String>,
    concurrency: usize,
) -> tn_infra::Result<()> {
    info!(machine = %manager, images = images.len(), "distributing images");

    stream::iter(images.iter().cloned())
        .map(|image| async move {
            fleet
                .exec_checked(manager, &stage_image_command(&image))
                .await
                .map(|_| ())
        })
        .buffer_unordered(concurrency.max(1))
        .try_collect::<Vec<()>>()
        .await?;

    Ok(())
}

fn remote_manifest_path(deployment: &str) -> String {
    format!("{REMOTE_DIR}/{deployment}/docker-compose.yml")
}

fn upload_command(deployment: &str, yaml: &str) -> String {
    format!(
        "mkdir -p {dir} && cat > {path} <<'{MANIFEST_EOF}'\n{body}\n{MANIFEST_EOF}",
        dir = shell_quote(&format!("{REMOTE_DIR}/{deployment}")),
        path = shell_quote(&remote_manifest_path(deployment)),
        body = yaml.trim_end(),
    )
}

async fn deploy_stack(fleet: &Fleet, manager: &str, deployment: &str, yaml: &str) -> tn_infra::Result<()> {
    fleet
        .exec_checked(manager, &upload_command(deployment, yaml))
        .await?;

    let deploy = format!(
        "docker stack deploy --prune -c {} {}",
        shell_quote(&remote_manifest_path(deployment)),
        shell_quote(deployment),
    );
    fleet.exec_checked(manager, &deploy).await?;

    info!(machine = %manager, deployment, "stack deployed");
    Ok(())
}
