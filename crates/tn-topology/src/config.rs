use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tn_infra::ProviderName;

use crate::{Error, Result};

const MAX_NAME_LEN: usize = 40;

/// Functional type of a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Broadcaster,
    Orchestrator,
    Transcoder,
    Streamer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Broadcaster => "broadcaster",
            Self::Orchestrator => "orchestrator",
            Self::Transcoder => "transcoder",
            Self::Streamer => "streamer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How dependents of a group pick their providers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingRule {
    /// Dependent `i` takes provider `i mod count`.
    #[default]
    RoundRobin,
    /// Every dependent takes every provider.
    All,
    /// Dependent `k` of the group takes provider `indices[k mod len]`.
    Explicit(Vec<usize>),
}

/// Override of the default relationship rule for one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectTo {
    /// Provider group, by name.
    pub group: String,
    #[serde(default)]
    pub rule: PairingRule,
}

/// Base of each port range; draws add an offset in `1..=2000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBases {
    pub cli: u16,
    pub rtmp: u16,
    pub http: u16,
}

impl Default for PortBases {
    fn default() -> Self {
        Self {
            cli: 7935,
            rtmp: 1935,
            http: 8935,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    pub role: Role,
    pub instances: usize,
    /// Free-form flags appended verbatim (binding flags excepted).
    #[serde(default)]
    pub flags: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub connect_to: Option<ConnectTo>,
    #[serde(default)]
    pub ports: Option<PortBases>,
}

fn default_provider() -> ProviderName {
    ProviderName::Gce
}

fn default_manager_type() -> String {
    "n1-standard-4".into()
}

fn default_worker_type() -> String {
    "n1-standard-2".into()
}

fn default_tags() -> Vec<String> {
    vec!["testnet".into()]
}

/// Machine sizing and placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachinesConfig {
    #[serde(default = "default_provider")]
    pub provider: ProviderName,
    #[serde(default)]
    pub zones: Vec<String>,
    #[serde(default = "default_manager_type")]
    pub manager_machine_type: String,
    #[serde(default = "default_worker_type")]
    pub worker_machine_type: String,
    #[serde(default)]
    pub workers: usize,
    #[serde(default = "default_tags")]
    pub tags: Vec<String>,
}

impl Default for MachinesConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            zones: Vec::new(),
            manager_machine_type: default_manager_type(),
            worker_machine_type: default_worker_type(),
            workers: 0,
            tags: default_tags(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainProfile {
    /// No chain at all.
    #[default]
    Offchain,
    /// Private development chain run inside the deployment.
    Devenv,
    /// A chain reachable at `eth_url`.
    External,
}

fn default_geth_image() -> String {
    "livepeer/geth-with-livepeer-protocol:streamflow".into()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockchainConfig {
    #[serde(default)]
    pub profile: ChainProfile,
    /// Network name passed to nodes; defaults per profile.
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub eth_url: Option<String>,
    #[serde(default)]
    pub controller: Option<String>,
    #[serde(default = "default_geth_image")]
    pub geth_image: String,
}

impl Default for BlockchainConfig {
    fn default() -> Self {
        Self {
            profile: ChainProfile::default(),
            network: None,
            eth_url: None,
            controller: None,
            geth_image: default_geth_image(),
        }
    }
}

fn default_node_image() -> String {
    "livepeer/go-livepeer:master".into()
}

fn default_streamer_image() -> String {
    "livepeer/streamtester:latest".into()
}

/// Default image per role, used when a group does not name one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagesConfig {
    #[serde(default = "default_node_image")]
    pub node: String,
    #[serde(default = "default_streamer_image")]
    pub streamer: String,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            node: default_node_image(),
            streamer: default_streamer_image(),
        }
    }
}

impl ImagesConfig {
    pub fn for_role(&self, role: Role) -> &str {
        match role {
            Role::Streamer => &self.streamer,
            _ => &self.node,
        }
    }
}

/// Declarative description of one experiment. Immutable once validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    #[serde(default)]
    pub local: bool,
    pub groups: Vec<GroupConfig>,
    #[serde(default)]
    pub machines: MachinesConfig,
    #[serde(default)]
    pub blockchain: BlockchainConfig,
    /// Pins port draws and credentials for reproducible manifests.
    #[serde(default)]
    pub port_seed: Option<u64>,
    #[serde(default)]
    pub images: ImagesConfig,
}

impl ExperimentConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    /// Read a config file; `.yaml` / `.yml` are YAML, anything else JSON.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Self::from_yaml(&raw),
            _ => Self::from_json(&raw),
        }
    }

    pub fn group(&self, name: &str) -> Option<&GroupConfig> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Check every structural invariant. Generation assumes a validated config.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;

        let mut seen = HashSet::new();
        for group in &self.groups {
            if group.name.is_empty() {
                return Err(Error::InvalidConfig("group name must not be empty".into()));
            }
            if !seen.insert(group.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate group name {:?}",
                    group.name
                )));
            }
        }

        for group in &self.groups {
            let Some(connect) = &group.connect_to else {
                continue;
            };
            let target = self.group(&connect.group).ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "group {:?} connects to unknown group {:?}",
                    group.name, connect.group
                ))
            })?;
            if target.name == group.name {
                return Err(Error::InvalidConfig(format!(
                    "group {:?} cannot connect to itself",
                    group.name
                )));
            }
            if let PairingRule::Explicit(indices) = &connect.rule {
                if indices.is_empty() {
                    return Err(Error::InvalidConfig(format!(
                        "group {:?} has an empty explicit pairing",
                        group.name
                    )));
                }
                if let Some(bad) = indices.iter().find(|&&i| i >= target.instances) {
                    return Err(Error::InvalidConfig(format!(
                        "group {:?} pairs with {}[{bad}] but it has {} instance(s)",
                        group.name, target.name, target.instances
                    )));
                }
            }
        }

        if !self.local && self.machines.zones.is_empty() {
            return Err(Error::InvalidConfig(
                "cloud deployments need at least one zone".into(),
            ));
        }

        if self.blockchain.profile == ChainProfile::External && self.blockchain.eth_url.is_none() {
            return Err(Error::InvalidConfig(
                "external chain profile requires eth_url".into(),
            ));
        }

        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    let starts_with_letter = name.chars().next().is_some_and(|c| c.is_ascii_lowercase());
    let charset_ok = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');

    if !starts_with_letter || !charset_ok || name.len() > MAX_NAME_LEN || name.ends_with('-') {
        return Err(Error::InvalidConfig(format!(
            "deployment name {name:?} must start with a lowercase letter, use only [a-z0-9-], not end with '-', and be at most {MAX_NAME_LEN} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(name: &str, role: Role, instances: usize) -> GroupConfig {
        GroupConfig {
            name: name.into(),
            role,
            instances,
            flags: String::new(),
            image: None,
            connect_to: None,
            ports: None,
        }
    }

    fn config(groups: Vec<GroupConfig>) -> ExperimentConfig {
        ExperimentConfig {
            name: "exp".into(),
            local: true,
            groups,
            machines: MachinesConfig::default(),
            blockchain: BlockchainConfig::default(),
            port_seed: Some(7),
            images: ImagesConfig::default(),
        }
    }

    #[test]
    fn parses_yaml_with_defaults() {
        let raw = r#"
name: exp
local: false
machines:
  provider: docker-machine
  zones: [us-east1-b]
  workers: 2
blockchain:
  profile: devenv
groups:
  - name: o
    role: orchestrator
    instances: 2
  - name: t
    role: transcoder
    instances: 4
    flags: "-v 6"
    connect_to:
      group: o
      rule: !explicit [1, 0]
"#;
        let cfg = ExperimentConfig::from_yaml(raw).unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.machines.provider, ProviderName::DockerMachine);
        assert_eq!(cfg.machines.manager_machine_type, "n1-standard-4");
        assert_eq!(cfg.blockchain.profile, ChainProfile::Devenv);
        assert_eq!(
            cfg.groups[1].connect_to.as_ref().unwrap().rule,
            PairingRule::Explicit(vec![1, 0])
        );
        assert_eq!(cfg.groups[1].flags, "-v 6");
    }

    #[test]
    fn parses_json() {
        let raw = r#"{"name":"exp","local":true,"groups":[{"name":"b","role":"broadcaster","instances":1}]}"#;
        let cfg = ExperimentConfig::from_json(raw).unwrap();
        assert!(cfg.local);
        assert_eq!(cfg.groups[0].role, Role::Broadcaster);
        assert_eq!(cfg.blockchain.profile, ChainProfile::Offchain);
    }

    #[test]
    fn unknown_role_is_rejected() {
        let raw = r#"{"name":"exp","groups":[{"name":"x","role":"miner","instances":1}]}"#;
        assert!(matches!(ExperimentConfig::from_json(raw), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn duplicate_group_names_are_rejected() {
        let cfg = config(vec![
            group("o", Role::Orchestrator, 1),
            group("o", Role::Transcoder, 1),
        ]);
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn deployment_names_must_be_machine_safe() {
        for bad in ["", "Exp", "1exp", "exp_1", "exp-", &"e".repeat(41)] {
            let mut cfg = config(vec![]);
            cfg.name = bad.to_string();
            assert!(cfg.validate().is_err(), "{bad:?} should be rejected");
        }
        let mut cfg = config(vec![]);
        cfg.name = "exp-2024-a".into();
        cfg.validate().unwrap();
    }

    #[test]
    fn explicit_pairing_must_stay_in_range() {
        let mut t = group("t", Role::Transcoder, 2);
        t.connect_to = Some(ConnectTo {
            group: "o".into(),
            rule: PairingRule::Explicit(vec![0, 2]),
        });
        let cfg = config(vec![group("o", Role::Orchestrator, 2), t]);
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn connect_to_unknown_group_is_rejected() {
        let mut t = group("t", Role::Transcoder, 1);
        t.connect_to = Some(ConnectTo {
            group: "missing".into(),
            rule: PairingRule::RoundRobin,
        });
        assert!(config(vec![t]).validate().is_err());
    }

    #[test]
    fn cloud_mode_needs_zones() {
        let mut cfg = config(vec![]);
        cfg.local = false;
        assert!(cfg.validate().is_err());
        cfg.machines.zones = vec!["us-east1-b".into()];
        cfg.validate().unwrap();
    }

    #[test]
    fn external_chain_needs_url() {
        let mut cfg = config(vec![]);
        cfg.blockchain.profile = ChainProfile::External;
        assert!(cfg.validate().is_err());
        cfg.blockchain.eth_url = Some("https://rpc.example.org".into());
        cfg.validate().unwrap();
    }
}
