//! `docker-machine` backend: any driver it supports, driven through its CLI.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use crate::exec::{run_command, with_sudo};
use crate::types::{ExecOutput, MachineAddress, MachineSpec};
use crate::{CloudProvider, Error, ProviderName, Result};

/// Fields of `docker-machine inspect --format '{{json .Driver}}'` that the
/// common drivers share.
#[derive(Debug, Deserialize)]
struct DriverInfo {
    #[serde(rename = "MachineName", default)]
    machine_name: String,
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
    #[serde(rename = "PrivateIPAddress", default)]
    private_ip_address: Option<String>,
    #[serde(rename = "Zone", default)]
    zone: Option<String>,
    #[serde(rename = "Region", default)]
    region: Option<String>,
}

pub struct DockerMachineProvider {
    binary: String,
    driver: String,
    extra_opts: Vec<String>,
    sudo: bool,
    timeout: Duration,
}

impl DockerMachineProvider {
    /// Create from env vars:
    ///
    /// - `DOCKER_MACHINE_DRIVER` (required, e.g. `google`, `amazonec2`, `virtualbox`)
    /// - `DOCKER_MACHINE_OPTS` (extra `create` flags, whitespace separated)
    /// - `DOCKER_MACHINE_BIN` (default: `docker-machine`)
    /// - `DOCKER_MACHINE_SUDO` (default: `true`)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let driver = std::env::var("DOCKER_MACHINE_DRIVER")
            .map_err(|_| Error::MissingEnv("DOCKER_MACHINE_DRIVER".into()))?;
        let extra_opts = std::env::var("DOCKER_MACHINE_OPTS")
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let binary = std::env::var("DOCKER_MACHINE_BIN").unwrap_or_else(|_| "docker-machine".into());
        let sudo = std::env::var("DOCKER_MACHINE_SUDO")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        Ok(Self {
            binary,
            driver,
            extra_opts,
            sudo,
            timeout: Duration::from_secs(900),
        })
    }

    /// Arguments for `docker-machine create`.
    fn create_args(&self, spec: &MachineSpec) -> Vec<String> {
        let mut args = vec!["create".to_string(), "--driver".into(), self.driver.clone()];

        match self.driver.as_str() {
            "google" => {
                args.extend(["--google-zone".into(), spec.zone.clone()]);
                args.extend(["--google-machine-type".into(), spec.machine_type.clone()]);
                if !spec.tags.is_empty() {
                    args.extend(["--google-tags".into(), spec.tags.join(",")]);
                }
            }
            "amazonec2" => {
                args.extend(["--amazonec2-zone".into(), spec.zone.clone()]);
                args.extend(["--amazonec2-instance-type".into(), spec.machine_type.clone()]);
                if !spec.tags.is_empty() {
                    args.extend(["--amazonec2-tags".into(), spec.tags.join(",")]);
                }
            }
            _ => {}
        }

        args.extend([
            "--engine-label".into(),
            format!("deployment={}", spec.deployment),
            "--engine-label".into(),
            format!("role={}", spec.role),
        ]);
        args.extend(self.extra_opts.iter().cloned());
        args.push(spec.name.clone());
        args
    }

    async fn run(&self, args: Vec<String>) -> Result<ExecOutput> {
        run_command(&self.binary, &args, self.timeout).await
    }

    async fn run_checked(&self, what: &str, args: Vec<String>) -> Result<String> {
        let out = self.run(args).await?;
        if !out.success() {
            return Err(Error::MachineDriver(format!(
                "{what}: {}",
                out.stderr.trim()
            )));
        }
        Ok(out.stdout)
    }

    fn parse_driver(raw: &str) -> Result<MachineAddress> {
        let info: DriverInfo = serde_json::from_str(raw.trim())
            .map_err(|e| Error::MachineDriver(format!("decode driver info: {e}")))?;

        let internal_ip = info
            .private_ip_address
            .filter(|ip| !ip.is_empty())
            .unwrap_or_else(|| info.ip_address.clone());

        Ok(MachineAddress {
            name: info.machine_name,
            zone: info.zone.or(info.region).unwrap_or_default(),
            internal_ip,
            external_ip: (!info.ip_address.is_empty()).then_some(info.ip_address),
        })
    }
}

fn is_missing_host(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("does not exist") || stderr.contains("not found")
}

#[async_trait]
impl CloudProvider for DockerMachineProvider {
    async fn create_machine(&self, spec: &MachineSpec) -> Result<MachineAddress> {
        self.run_checked("create", self.create_args(spec)).await?;
        info!(machine = %spec.name, driver = %self.driver, "docker-machine: host created");
        self.describe_machine(&spec.name).await
    }

    async fn remove_machine(&self, name: &str) -> Result<()> {
        let out = self
            .run(vec!["rm".into(), "-f".into(), "-y".into(), name.into()])
            .await?;

        if !out.success() {
            if is_missing_host(&out.stderr) {
                warn!(machine = %name, "docker-machine: host already removed");
                return Ok(());
            }
            return Err(Error::MachineDriver(format!("rm: {}", out.stderr.trim())));
        }

        info!(machine = %name, "docker-machine: host removed");
        Ok(())
    }

    async fn describe_machine(&self, name: &str) -> Result<MachineAddress> {
        let out = self
            .run(vec![
                "inspect".into(),
                "--format".into(),
                "{{json .Driver}}".into(),
                name.into(),
            ])
            .await?;

        if !out.success() {
            if is_missing_host(&out.stderr) {
                return Err(Error::NotFound(name.to_string()));
            }
            return Err(Error::MachineDriver(format!("inspect: {}", out.stderr.trim())));
        }

        let mut address = Self::parse_driver(&out.stdout)?;
        if address.name.is_empty() {
            address.name = name.to_string();
        }
        Ok(address)
    }

    async fn remote_exec(&self, target: &MachineAddress, command: &str) -> Result<ExecOutput> {
        let command = if self.sudo {
            with_sudo(command)
        } else {
            command.to_string()
        };
        self.run(vec!["ssh".into(), target.name.clone(), command]).await
    }

    async fn list_machines(&self, deployment: &str) -> Result<Vec<String>> {
        let stdout = self
            .run_checked(
                "ls",
                vec![
                    "ls".into(),
                    "-q".into(),
                    "--filter".into(),
                    format!("name={deployment}"),
                    "--filter".into(),
                    "state=Running".into(),
                ],
            )
            .await?;

        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn name(&self) -> ProviderName {
        ProviderName::DockerMachine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MachineRole;

    fn provider(driver: &str) -> DockerMachineProvider {
        DockerMachineProvider {
            binary: "docker-machine".into(),
            driver: driver.into(),
            extra_opts: vec!["--google-project".into(), "testnet".into()],
            sudo: true,
            timeout: Duration::from_secs(5),
        }
    }

    fn spec() -> MachineSpec {
        MachineSpec {
            name: "exp-worker-0".into(),
            deployment: "exp".into(),
            zone: "us-east1-c".into(),
            machine_type: "n1-standard-2".into(),
            tags: vec!["testnet".into(), "swarm".into()],
            role: MachineRole::Worker,
        }
    }

    #[test]
    fn google_create_args() {
        let args = provider("google").create_args(&spec());

        assert_eq!(&args[..3], ["create", "--driver", "google"]);
        let zone = args.iter().position(|a| a == "--google-zone").unwrap();
        assert_eq!(args[zone + 1], "us-east1-c");
        let tags = args.iter().position(|a| a == "--google-tags").unwrap();
        assert_eq!(args[tags + 1], "testnet,swarm");
        assert!(args.contains(&"deployment=exp".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("exp-worker-0"));
    }

    #[test]
    fn generic_driver_passes_only_opts() {
        let args = provider("virtualbox").create_args(&spec());
        assert!(!args.iter().any(|a| a.starts_with("--google-zone")));
        assert!(args.contains(&"--google-project".to_string()));
    }

    #[test]
    fn parses_google_driver_info() {
        let raw = r#"{"MachineName":"exp-manager","IPAddress":"34.73.1.2","Zone":"us-east1-b","MachineType":"n1-standard-4"}"#;
        let addr = DockerMachineProvider::parse_driver(raw).unwrap();
        assert_eq!(addr.name, "exp-manager");
        assert_eq!(addr.zone, "us-east1-b");
        assert_eq!(addr.internal_ip, "34.73.1.2");
        assert_eq!(addr.external_ip.as_deref(), Some("34.73.1.2"));
    }

    #[test]
    fn prefers_private_address_when_present() {
        let raw = r#"{"MachineName":"exp-manager","IPAddress":"54.1.2.3","PrivateIPAddress":"172.31.0.9","Region":"us-east-1"}"#;
        let addr = DockerMachineProvider::parse_driver(raw).unwrap();
        assert_eq!(addr.internal_ip, "172.31.0.9");
        assert_eq!(addr.zone, "us-east-1");
    }

    #[test]
    fn missing_host_detection() {
        assert!(is_missing_host("Error: Host does not exist: \"exp-worker-9\""));
        assert!(!is_missing_host("Error: permission denied"));
    }
}
