use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use gce_api::{
    AccessConfigRequest, AttachedDisk, GceClient, InitializeParams, InsertInstanceRequest,
    Instance, Metadata, MetadataItem, NetworkInterfaceConfig, Tags,
};
use tracing::{info, warn};

use crate::exec::SshConfig;
use crate::types::{ExecOutput, MachineAddress, MachineSpec};
use crate::{CloudProvider, Error, ProviderName, Result};

const DEFAULT_IMAGE: &str = "projects/ubuntu-os-cloud/global/images/family/ubuntu-2204-lts";

/// Installs the container runtime on first boot.
const STARTUP_SCRIPT: &str = "#!/bin/sh\n\
    command -v docker >/dev/null 2>&1 || curl -fsSL https://get.docker.com | sh\n\
    systemctl enable --now docker\n";

/// Compute Engine provider.
///
/// Delegates HTTP calls to `gce_api::GceClient`; commands run over `ssh`.
pub struct GceProvider {
    client: GceClient,
    image: String,
    network: String,
    disk_size_gb: Option<String>,
    ssh: SshConfig,
}

impl GceProvider {
    /// Create from env vars:
    ///
    /// - `GCE_PROJECT`, `GCE_ACCESS_TOKEN` (required)
    /// - `GCE_IMAGE` (default: Ubuntu 22.04 family)
    /// - `GCE_NETWORK` (default: `global/networks/default`)
    /// - `GCE_DISK_SIZE_GB` (optional)
    /// - `GCE_SSH_USER` (default: `ubuntu`, commands run through sudo)
    /// - `GCE_SSH_KEY` (optional private key path)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let project =
            std::env::var("GCE_PROJECT").map_err(|_| Error::MissingEnv("GCE_PROJECT".into()))?;
        let token = std::env::var("GCE_ACCESS_TOKEN")
            .map_err(|_| Error::MissingEnv("GCE_ACCESS_TOKEN".into()))?;

        let image = std::env::var("GCE_IMAGE").unwrap_or_else(|_| DEFAULT_IMAGE.into());
        let network =
            std::env::var("GCE_NETWORK").unwrap_or_else(|_| "global/networks/default".into());
        let disk_size_gb = std::env::var("GCE_DISK_SIZE_GB").ok();

        let user = std::env::var("GCE_SSH_USER").unwrap_or_else(|_| "ubuntu".into());
        let ssh = SshConfig {
            sudo: user != "root",
            user,
            key_path: std::env::var("GCE_SSH_KEY").ok().map(PathBuf::from),
            ..SshConfig::default()
        };

        Ok(Self {
            client: GceClient::new(token, project),
            image,
            network,
            disk_size_gb,
            ssh,
        })
    }

    fn insert_request(&self, spec: &MachineSpec) -> InsertInstanceRequest {
        let mut labels = HashMap::new();
        labels.insert("deployment".to_string(), spec.deployment.clone());
        labels.insert("role".to_string(), spec.role.as_str().to_string());

        InsertInstanceRequest {
            name: spec.name.clone(),
            machine_type: format!("zones/{}/machineTypes/{}", spec.zone, spec.machine_type),
            disks: vec![AttachedDisk {
                boot: true,
                auto_delete: true,
                initialize_params: InitializeParams {
                    source_image: self.image.clone(),
                    disk_size_gb: self.disk_size_gb.clone(),
                },
            }],
            network_interfaces: vec![NetworkInterfaceConfig {
                network: self.network.clone(),
                access_configs: vec![AccessConfigRequest::external_nat()],
            }],
            tags: (!spec.tags.is_empty()).then(|| Tags {
                items: spec.tags.clone(),
            }),
            labels,
            metadata: Some(Metadata {
                items: vec![MetadataItem {
                    key: "startup-script".into(),
                    value: STARTUP_SCRIPT.into(),
                }],
            }),
        }
    }

    fn address(instance: &Instance) -> Result<MachineAddress> {
        let internal_ip = instance
            .internal_ip()
            .ok_or_else(|| Error::NotFound(format!("internal address of {}", instance.name)))?;

        Ok(MachineAddress {
            name: instance.name.clone(),
            zone: instance.zone_name().to_string(),
            internal_ip: internal_ip.to_string(),
            external_ip: instance.external_ip().map(str::to_string),
        })
    }

    /// Find an instance by name in any zone.
    async fn find(&self, name: &str) -> Result<Option<Instance>> {
        let mut found = self
            .client
            .aggregated_instances(&format!("name = \"{name}\""))
            .await?;
        Ok(found.pop())
    }
}

#[async_trait]
impl CloudProvider for GceProvider {
    async fn create_machine(&self, spec: &MachineSpec) -> Result<MachineAddress> {
        let op = self
            .client
            .insert_instance(&spec.zone, &self.insert_request(spec))
            .await?;
        self.client.wait_until_done(&spec.zone, op).await?;

        let instance = self.client.get_instance(&spec.zone, &spec.name).await?;
        let address = Self::address(&instance)?;
        info!(machine = %spec.name, zone = %spec.zone, ip = %address.internal_ip, "gce: instance created");

        self.ssh
            .wait_until(
                &spec.name,
                address.ssh_host(),
                "docker info >/dev/null 2>&1",
                60,
                Duration::from_secs(5),
            )
            .await?;

        Ok(address)
    }

    async fn remove_machine(&self, name: &str) -> Result<()> {
        let Some(instance) = self.find(name).await? else {
            warn!(machine = %name, "gce: instance already gone");
            return Ok(());
        };

        let zone = instance.zone_name().to_string();
        match self.client.delete_instance(&zone, name).await? {
            Some(op) => {
                self.client.wait_until_done(&zone, op).await?;
                info!(machine = %name, %zone, "gce: instance deleted");
            }
            None => warn!(machine = %name, "gce: instance already gone"),
        }
        Ok(())
    }

    async fn describe_machine(&self, name: &str) -> Result<MachineAddress> {
        let instance = self
            .find(name)
            .await?
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        Self::address(&instance)
    }

    async fn remote_exec(&self, target: &MachineAddress, command: &str) -> Result<ExecOutput> {
        self.ssh.exec(&target.name, target.ssh_host(), command).await
    }

    async fn list_machines(&self, deployment: &str) -> Result<Vec<String>> {
        let instances = self
            .client
            .aggregated_instances(&format!("labels.deployment = \"{deployment}\""))
            .await?;

        Ok(instances
            .into_iter()
            .filter(Instance::is_running)
            .map(|i| i.name)
            .collect())
    }

    fn name(&self) -> ProviderName {
        ProviderName::Gce
    }
}
