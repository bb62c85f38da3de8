//! Cluster formation: one manager plus N workers joined into a Docker Swarm.
//!
//! Phases run in a fixed order and each one is recorded:
//!
//! ```text
//! Idle -> ProvisioningManager -> ProvisioningWorkers -> MeshInit -> WorkersJoining -> Ready
//!   \____________________________ any failure ____________________________/-> Failed
//! ```
//!
//! Worker joins consume the [`JoinTicket`] that only `MeshInit` produces, so a
//! join can never be attempted before the mesh exists.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::exec::shell_quote;
use crate::fleet::Fleet;
use crate::types::{MachineRecord, MachineRole, MachineSpec, MachineState};
use crate::{Error, Result};

/// Concurrent machine creations per phase.
pub const DEFAULT_CREATE_CONCURRENCY: usize = 3;

/// Swarm cluster-management port.
pub const SWARM_PORT: u16 = 2377;

fn default_concurrency() -> usize {
    DEFAULT_CREATE_CONCURRENCY
}

fn default_log_max_size() -> String {
    "10m".into()
}

fn default_log_max_file() -> u32 {
    3
}

/// What to build for one deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub deployment: String,
    /// Zones in preference order; the manager takes the first, workers rotate.
    pub zones: Vec<String>,
    pub manager_machine_type: String,
    pub worker_machine_type: String,
    pub workers: usize,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Container log rotation applied on every machine.
    #[serde(default = "default_log_max_size")]
    pub log_max_size: String,
    #[serde(default = "default_log_max_file")]
    pub log_max_file: u32,
}

impl ClusterSpec {
    /// Manager-only spec with default concurrency and log rotation.
    pub fn new(deployment: impl Into<String>) -> Self {
        Self {
            deployment: deployment.into(),
            zones: Vec::new(),
            manager_machine_type: String::new(),
            worker_machine_type: String::new(),
            workers: 0,
            tags: Vec::new(),
            concurrency: default_concurrency(),
            log_max_size: default_log_max_size(),
            log_max_file: default_log_max_file(),
        }
    }

    pub fn manager_name(&self) -> String {
        format!("{}-manager", self.deployment)
    }

    pub fn worker_name(&self, index: usize) -> String {
        format!("{}-worker-{index}", self.deployment)
    }

    fn zone_for(&self, slot: usize) -> String {
        if self.zones.is_empty() {
            return String::new();
        }
        self.zones[slot % self.zones.len()].clone()
    }

    fn manager_spec(&self) -> MachineSpec {
        MachineSpec {
            name: self.manager_name(),
            deployment: self.deployment.clone(),
            zone: self.zone_for(0),
            machine_type: self.manager_machine_type.clone(),
            tags: self.tags.clone(),
            role: MachineRole::Manager,
        }
    }

    fn worker_spec(&self, index: usize) -> MachineSpec {
        MachineSpec {
            name: self.worker_name(index),
            deployment: self.deployment.clone(),
            zone: self.zone_for(index + 1),
            machine_type: self.worker_machine_type.clone(),
            tags: self.tags.clone(),
            role: MachineRole::Worker,
        }
    }

    /// Shell command that installs the log rotation policy and restarts the
    /// container runtime.
    fn log_rotation_command(&self) -> String {
        let daemon = serde_json::json!({
            "log-driver": "json-file",
            "log-opts": {
                "max-size": self.log_max_size,
                "max-file": self.log_max_file.to_string(),
            },
        });
        format!(
            "mkdir -p /etc/docker && printf '%s\\n' {} > /etc/docker/daemon.json && systemctl restart docker",
            shell_quote(&daemon.to_string()),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterState {
    Idle,
    ProvisioningManager,
    ProvisioningWorkers,
    MeshInit,
    WorkersJoining,
    Ready,
    Failed,
}

impl ClusterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ProvisioningManager => "provisioning_manager",
            Self::ProvisioningWorkers => "provisioning_workers",
            Self::MeshInit => "mesh_init",
            Self::WorkersJoining => "workers_joining",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proof that the mesh exists: the worker token and where to join.
#[derive(Debug, Clone)]
pub struct JoinTicket {
    token: String,
    manager_addr: String,
}

/// A cluster that reached `Ready`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormedCluster {
    pub deployment: String,
    pub manager: MachineRecord,
    pub workers: Vec<MachineRecord>,
    /// `<manager internal ip>:2377`.
    pub mesh_address: String,
}

impl FormedCluster {
    pub fn machines(&self) -> impl Iterator<Item = &MachineRecord> {
        std::iter::once(&self.manager).chain(self.workers.iter())
    }

    /// Address external collaborators use to reach published ports.
    pub fn base_address(&self) -> Option<&str> {
        self.manager
            .external_ip
            .as_deref()
            .or(self.manager.internal_ip.as_deref())
    }
}

/// Drives one deployment through the formation phases.
pub struct ClusterFormer {
    fleet: Arc<Fleet>,
    spec: ClusterSpec,
    state: Mutex<ClusterState>,
    records: Mutex<BTreeMap<String, MachineRecord>>,
}

impl ClusterFormer {
    pub fn new(fleet: Arc<Fleet>, spec: ClusterSpec) -> Self {
        Self {
            fleet,
            spec,
            state: Mutex::new(ClusterState::Idle),
            records: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    pub fn state(&self) -> ClusterState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of every machine record, by name.
    pub fn records(&self) -> Vec<MachineRecord> {
        self.records_guard().values().cloned().collect()
    }

    fn records_guard(&self) -> MutexGuard<'_, BTreeMap<String, MachineRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, next: ClusterState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let from = *state;
        info!(
            deployment = %self.spec.deployment,
            %from,
            to = %next,
            "cluster state transition"
        );
        *state = next;
    }

    /// Run every phase. On failure the state is `Failed` and no cluster is
    /// returned; machines that may exist are named in the log.
    pub async fn form(&self) -> Result<FormedCluster> {
        match self.run().await {
            Ok(cluster) => {
                self.transition(ClusterState::Ready);
                info!(
                    deployment = %self.spec.deployment,
                    workers = cluster.workers.len(),
                    mesh = %cluster.mesh_address,
                    "cluster ready"
                );
                Ok(cluster)
            }
            Err(e) => {
                let phase = self.state();
                self.transition(ClusterState::Failed);

                let left_behind: Vec<String> = self
                    .records_guard()
                    .values_mut()
                    .filter(|r| matches!(r.state, MachineState::Creating | MachineState::Ready))
                    .map(|r| {
                        if r.state == MachineState::Creating {
                            r.mark_failed();
                        }
                        r.name.clone()
                    })
                    .collect();

                error!(deployment = %self.spec.deployment, %phase, error = %e, "cluster formation failed");
                if !left_behind.is_empty() {
                    warn!(
                        deployment = %self.spec.deployment,
                        machines = ?left_behind,
                        "partial cluster left behind, tear down the deployment to remove it"
                    );
                }

                Err(Error::ClusterFormation {
                    phase,
                    source: Box::new(e),
                })
            }
        }
    }

    async fn run(&self) -> Result<FormedCluster> {
        self.transition(ClusterState::ProvisioningManager);
        let manager = self.provision(self.spec.manager_spec()).await?;

        self.transition(ClusterState::ProvisioningWorkers);
        let workers = self.provision_workers().await?;

        self.transition(ClusterState::MeshInit);
        let ticket = self.init_mesh(&manager).await?;

        self.transition(ClusterState::WorkersJoining);
        for worker in &workers {
            self.join(worker, &ticket).await?;
        }

        Ok(FormedCluster {
            deployment: self.spec.deployment.clone(),
            manager,
            workers,
            mesh_address: ticket.manager_addr,
        })
    }

    async fn provision(&self, spec: MachineSpec) -> Result<MachineRecord> {
        self.records_guard()
            .insert(spec.name.clone(), MachineRecord::requested(&spec));
        self.update_record(&spec.name, MachineRecord::mark_creating);

        match self.fleet.create_machine(&spec).await {
            Ok(record) => {
                self.records_guard().insert(record.name.clone(), record.clone());
                Ok(record)
            }
            Err(e) => {
                self.update_record(&spec.name, MachineRecord::mark_failed);
                Err(e)
            }
        }
    }

    fn update_record(&self, name: &str, f: impl FnOnce(&mut MachineRecord)) {
        if let Some(record) = self.records_guard().get_mut(name) {
            f(record);
        }
    }

    /// Create all workers, `concurrency` at a time. The first failure drops
    /// the remaining in-flight creations.
    async fn provision_workers(&self) -> Result<Vec<MachineRecord>> {
        let specs: Vec<(usize, MachineSpec)> = (0..self.spec.workers)
            .map(|i| (i, self.spec.worker_spec(i)))
            .collect();

        let mut workers: Vec<(usize, MachineRecord)> = stream::iter(specs)
            .map(|(i, spec)| async move { self.provision(spec).await.map(|r| (i, r)) })
            .buffer_unordered(self.spec.concurrency.max(1))
            .try_collect()
            .await?;

        workers.sort_by_key(|(i, _)| *i);
        Ok(workers.into_iter().map(|(_, r)| r).collect())
    }

    async fn configure_log_rotation(&self, machine: &str) -> Result<()> {
        self.fleet
            .exec_checked(machine, &self.spec.log_rotation_command())
            .await?;
        Ok(())
    }

    async fn init_mesh(&self, manager: &MachineRecord) -> Result<JoinTicket> {
        let name = &manager.name;
        let mesh_err = |reason: String| Error::MeshInit {
            machine: name.clone(),
            reason,
        };

        self.configure_log_rotation(name)
            .await
            .map_err(|e| mesh_err(e.to_string()))?;

        let ip = self.fleet.internal_ip(name).await?;
        let init = self
            .fleet
            .remote_exec(name, &format!("docker swarm init --advertise-addr {ip}"))
            .await
            .map_err(|e| mesh_err(e.to_string()))?;
        if !init.success() && !init.stderr.contains("already part of a swarm") {
            return Err(mesh_err(init.stderr.trim().to_string()));
        }

        let token = self
            .fleet
            .exec_checked(name, "docker swarm join-token -q worker")
            .await
            .map_err(|e| mesh_err(e.to_string()))?
            .trim()
            .to_string();
        if token.is_empty() {
            return Err(mesh_err("empty join token".into()));
        }

        info!(machine = %name, "mesh initialized");
        Ok(JoinTicket {
            token,
            manager_addr: format!("{ip}:{SWARM_PORT}"),
        })
    }

    async fn join(&self, worker: &MachineRecord, ticket: &JoinTicket) -> Result<()> {
        let name = &worker.name;
        let join_err = |reason: String| Error::Join {
            machine: name.clone(),
            reason,
        };

        self.configure_log_rotation(name)
            .await
            .map_err(|e| join_err(e.to_string()))?;

        let out = self
            .fleet
            .remote_exec(
                name,
                &format!(
                    "docker swarm join --token {} {}",
                    ticket.token, ticket.manager_addr
                ),
            )
            .await
            .map_err(|e| join_err(e.to_string()))?;

        if !out.success() && !out.stderr.contains("already part of a swarm") {
            return Err(join_err(out.stderr.trim().to_string()));
        }

        info!(machine = %name, "worker joined mesh");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FAKE_JOIN_TOKEN, FakeFailure, FakeProvider};
    use crate::retry::RetryPolicy;

    fn spec(workers: usize) -> ClusterSpec {
        ClusterSpec {
            deployment: "exp".into(),
            zones: vec!["us-east1-b".into(), "us-east1-c".into()],
            manager_machine_type: "n1-standard-4".into(),
            worker_machine_type: "n1-standard-2".into(),
            workers,
            tags: vec![],
            concurrency: DEFAULT_CREATE_CONCURRENCY,
            log_max_size: default_log_max_size(),
            log_max_file: default_log_max_file(),
        }
    }

    fn former(fake: &Arc<FakeProvider>, workers: usize) -> ClusterFormer {
        let fleet = Arc::new(Fleet::with_policy(fake.clone(), RetryPolicy::immediate(8)));
        ClusterFormer::new(fleet, spec(workers))
    }

    #[tokio::test]
    async fn one_manager_two_workers() {
        let fake = Arc::new(FakeProvider::new());
        let former = former(&fake, 2);

        let cluster = former.form().await.unwrap();

        assert_eq!(former.state(), ClusterState::Ready);
        let records = former.records();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(MachineRecord::is_ready));
        assert_eq!(
            records.iter().filter(|r| r.role == MachineRole::Manager).count(),
            1
        );
        assert_eq!(cluster.workers.len(), 2);
        assert_eq!(cluster.workers[0].name, "exp-worker-0");
        assert_eq!(cluster.workers[1].name, "exp-worker-1");
        assert_eq!(fake.commands_containing(FAKE_JOIN_TOKEN), 2);
        assert!(cluster.mesh_address.ends_with(":2377"));
    }

    #[tokio::test]
    async fn join_never_precedes_mesh_init() {
        let fake = Arc::new(FakeProvider::new());
        former(&fake, 3).form().await.unwrap();

        let log = fake.exec_log();
        let init = log
            .iter()
            .position(|(_, cmd)| cmd.starts_with("docker swarm init"))
            .unwrap();
        let first_join = log
            .iter()
            .position(|(_, cmd)| cmd.starts_with("docker swarm join --token"))
            .unwrap();
        assert!(init < first_join);
        assert!(log[init].0 == "exp-manager");
    }

    #[tokio::test]
    async fn workers_rotate_through_zones() {
        let fake = Arc::new(FakeProvider::new());
        let cluster = former(&fake, 3).form().await.unwrap();

        assert_eq!(cluster.manager.zone, "us-east1-b");
        let zones: Vec<&str> = cluster.workers.iter().map(|w| w.zone.as_str()).collect();
        assert_eq!(zones, vec!["us-east1-c", "us-east1-b", "us-east1-c"]);
    }

    #[tokio::test]
    async fn join_failure_leaves_cluster_failed() {
        let fake = Arc::new(FakeProvider::new());
        fake.fail_join("exp-worker-1");
        let former = former(&fake, 2);

        let err = former.form().await.unwrap_err();

        assert_eq!(former.state(), ClusterState::Failed);
        match err {
            Error::ClusterFormation { phase, source } => {
                assert_eq!(phase, ClusterState::WorkersJoining);
                assert!(matches!(*source, Error::Join { ref machine, .. } if machine == "exp-worker-1"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn worker_provisioning_failure_aborts_before_mesh_init() {
        let fake = Arc::new(FakeProvider::new());
        fake.fail_create("exp-worker-1", FakeFailure::Fatal);
        let former = former(&fake, 4);

        let err = former.form().await.unwrap_err();

        assert!(matches!(
            err,
            Error::ClusterFormation { phase: ClusterState::ProvisioningWorkers, .. }
        ));
        assert_eq!(former.state(), ClusterState::Failed);
        assert_eq!(fake.commands_containing("docker swarm init"), 0);
        let failed = former
            .records()
            .into_iter()
            .find(|r| r.name == "exp-worker-1")
            .unwrap();
        assert_eq!(failed.state, MachineState::Failed);
    }

    #[tokio::test]
    async fn transient_worker_failure_is_absorbed() {
        let fake = Arc::new(FakeProvider::new());
        fake.fail_create("exp-worker-0", FakeFailure::Transient);
        fake.fail_create("exp-worker-0", FakeFailure::PartialTransient);
        let former = former(&fake, 2);

        former.form().await.unwrap();

        assert_eq!(fake.create_calls("exp-worker-0"), 3);
        assert_eq!(fake.machines().len(), 3);
    }

    #[tokio::test]
    async fn mesh_init_failure_is_reported() {
        let fake = Arc::new(FakeProvider::new());
        fake.fail_command("exp-manager", "swarm join-token");
        let former = former(&fake, 1);

        let err = former.form().await.unwrap_err();

        match err {
            Error::ClusterFormation { phase, source } => {
                assert_eq!(phase, ClusterState::MeshInit);
                assert!(matches!(*source, Error::MeshInit { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fake.commands_containing("swarm join --token"), 0);
    }

    #[test]
    fn log_rotation_command_is_single_quoted_json() {
        let cmd = spec(0).log_rotation_command();
        assert!(cmd.contains(r#"'{"log-driver":"json-file","log-opts":{"max-file":"3","max-size":"10m"}}'"#));
        assert!(cmd.ends_with("systemctl restart docker"));
    }
}
