use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use hcloud::apis::configuration::Configuration;
use hcloud::apis::servers_api;
use hcloud::models;
use tracing::{debug, info, warn};

use crate::exec::SshConfig;
use crate::types::{ExecOutput, MachineAddress, MachineSpec};
use crate::{CloudProvider, Error, ProviderName, Result};

const STATUS_POLL_ATTEMPTS: u32 = 60;
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Hetzner Cloud provider using the `hcloud` crate.
///
/// All configuration is loaded from environment variables via `from_env()`.
/// Zones map to Hetzner locations (`fsn1`, `nbg1`, `hel1`, ...).
pub struct HetznerProvider {
    config: Configuration,
    image: String,
    network_id: Option<i64>,
    firewall_id: Option<i64>,
    ssh_key_names: Vec<String>,
    ssh: SshConfig,
}

impl HetznerProvider {
    /// Create from env vars:
    ///
    /// - `HETZNER_API_TOKEN` (required)
    /// - `HETZNER_IMAGE` (default: `"ubuntu-22.04"`)
    /// - `HETZNER_NETWORK_ID` (optional, integer)
    /// - `HETZNER_FIREWALL_ID` (optional, integer)
    /// - `HETZNER_SSH_KEY_NAMES` (comma-separated names, optional)
    /// - `HETZNER_SSH_KEY` (private key path for remote exec, optional)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let token = std::env::var("HETZNER_API_TOKEN")
            .map_err(|_| Error::MissingEnv("HETZNER_API_TOKEN".into()))?;

        let mut config = Configuration::new();
        config.bearer_access_token = Some(token);

        let image = std::env::var("HETZNER_IMAGE").unwrap_or_else(|_| "ubuntu-22.04".into());

        let network_id = std::env::var("HETZNER_NETWORK_ID")
            .ok()
            .and_then(|s| s.parse::<i64>().ok());

        let firewall_id = std::env::var("HETZNER_FIREWALL_ID")
            .ok()
            .and_then(|s| s.parse::<i64>().ok());

        let ssh_key_names: Vec<String> = std::env::var("HETZNER_SSH_KEY_NAMES")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let ssh = SshConfig {
            key_path: std::env::var("HETZNER_SSH_KEY").ok().map(PathBuf::from),
            ..SshConfig::default()
        };

        Ok(Self {
            config,
            image,
            network_id,
            firewall_id,
            ssh_key_names,
            ssh,
        })
    }

    /// Cloud-init that installs the container runtime.
    fn cloud_init_user_data() -> String {
        r#"#cloud-config
runcmd:
  - curl -fsSL https://get.docker.com | sh
  - systemctl enable --now docker
"#
        .to_string()
    }

    fn labels(spec: &MachineSpec) -> HashMap<String, String> {
        HashMap::from([
            ("deployment".to_string(), spec.deployment.clone()),
            ("role".to_string(), spec.role.as_str().to_string()),
        ])
    }

    /// Address from a server; falls back to the public address when the
    /// server has no private network.
    fn address(server: &models::Server) -> Result<MachineAddress> {
        let value = serde_json::to_value(server)
            .map_err(|e| Error::HetznerApi(format!("decode server: {e}")))?;

        let public_ip = value
            .pointer("/public_net/ipv4/ip")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let location = value
            .pointer("/datacenter/location/name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let private_ip = server.private_net.first().and_then(|net| net.ip.clone());
        let internal_ip = private_ip
            .or_else(|| public_ip.clone())
            .ok_or_else(|| Error::NotFound(format!("address of {}", server.name)))?;

        Ok(MachineAddress {
            name: server.name.clone(),
            zone: location,
            internal_ip,
            external_ip: public_ip,
        })
    }

    async fn find(&self, name: &str) -> Result<Option<models::Server>> {
        let resp = servers_api::list_servers(
            &self.config,
            servers_api::ListServersParams {
                name: Some(name.to_string()),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| Error::HetznerApi(format!("list servers: {e}")))?;

        Ok(resp.servers.into_iter().find(|s| s.name == name))
    }

    /// Poll until the server reports `running`.
    async fn wait_running(&self, id: i64, name: &str) -> Result<models::Server> {
        for attempt in 1..=STATUS_POLL_ATTEMPTS {
            let resp = servers_api::get_server(&self.config, servers_api::GetServerParams { id })
                .await
                .map_err(|e| Error::HetznerApi(format!("get server: {e}")))?;

            if let Some(server) = resp.server {
                if server.status == models::server::Status::Running {
                    return Ok(*server);
                }
                debug!(machine = %name, attempt, status = ?server.status, "hetzner: waiting for server");
            }
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        }

        Err(Error::Timeout {
            op: "server start",
            target: name.to_string(),
            secs: STATUS_POLL_INTERVAL.as_secs() * u64::from(STATUS_POLL_ATTEMPTS),
        })
    }
}

#[async_trait]
impl CloudProvider for HetznerProvider {
    async fn create_machine(&self, spec: &MachineSpec) -> Result<MachineAddress> {
        let firewalls = self.firewall_id.map(|fw_id| {
            vec![models::CreateServerRequestFirewalls {
                firewall: fw_id,
            }]
        });

        let ssh_keys = if self.ssh_key_names.is_empty() {
            None
        } else {
            Some(self.ssh_key_names.clone())
        };

        let resp = servers_api::create_server(
            &self.config,
            servers_api::CreateServerParams {
                create_server_request: models::CreateServerRequest {
                    name: spec.name.clone(),
                    server_type: spec.machine_type.clone(),
                    image: self.image.clone(),
                    location: (!spec.zone.is_empty()).then(|| spec.zone.clone()),
                    user_data: Some(Self::cloud_init_user_data()),
                    networks: self.network_id.map(|id| vec![id]),
                    firewalls,
                    ssh_keys,
                    volumes: None,
                    start_after_create: Some(true),
                    automount: None,
                    datacenter: None,
                    labels: Some(Self::labels(spec)),
                    placement_group: None,
                    public_net: None,
                },
            },
        )
        .await
        .map_err(|e| Error::HetznerApi(format!("create server: {e}")))?;

        let server_id = resp.server.id;
        info!(machine = %spec.name, server_id, "hetzner: server created");

        let server = self.wait_running(server_id, &spec.name).await?;
        let address = Self::address(&server)?;

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
        let Some(server) = self.find(name).await? else {
            warn!(machine = %name, "hetzner: server already destroyed");
            return Ok(());
        };

        if let Err(e) = servers_api::delete_server(
            &self.config,
            servers_api::DeleteServerParams { id: server.id },
        )
        .await
        {
            let msg = format!("{e}");
            if msg.contains("404") {
                warn!(machine = %name, "hetzner: server already destroyed");
                return Ok(());
            }
            return Err(Error::HetznerApi(format!("delete server: {e}")));
        }

        info!(machine = %name, server_id = server.id, "hetzner: server destroyed");
        Ok(())
    }

    async fn describe_machine(&self, name: &str) -> Result<MachineAddress> {
        let server = self
            .find(name)
            .await?
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        Self::address(&server)
    }

    async fn remote_exec(&self, target: &MachineAddress, command: &str) -> Result<ExecOutput> {
        self.ssh.exec(&target.name, target.ssh_host(), command).await
    }

    async fn list_machines(&self, deployment: &str) -> Result<Vec<String>> {
        let resp = servers_api::list_servers(
            &self.config,
            servers_api::ListServersParams {
                label_selector: Some(format!("deployment={deployment}")),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| Error::HetznerApi(format!("list servers: {e}")))?;

        Ok(resp
            .servers
            .into_iter()
            .filter(|s| s.status == models::server::Status::Running)
            .map(|s| s.name)
            .collect())
    }

    fn name(&self) -> ProviderName {
        ProviderName::Hetzner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MachineRole;

    #[test]
    fn labels_scope_servers_to_deployment() {
        let spec = MachineSpec {
            name: "exp-worker-2".into(),
            deployment: "exp".into(),
            zone: "fsn1".into(),
            machine_type: "cpx21".into(),
            tags: vec![],
            role: MachineRole::Worker,
        };

        let labels = HetznerProvider::labels(&spec);
        assert_eq!(labels["deployment"], "exp");
        assert_eq!(labels["role"], "worker");
    }

    #[test]
    fn cloud_init_installs_docker() {
        let data = HetznerProvider::cloud_init_user_data();
        assert!(data.starts_with("#cloud-config"));
        assert!(data.contains("get.docker.com"));
    }
}
