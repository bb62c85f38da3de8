//! Compose-format manifest for `docker stack deploy` / `docker compose`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::generator::Topology;
use crate::node::{InfraService, ServiceNode};
use crate::{Error, Result};

pub const MANIFEST_FILE: &str = "docker-compose.yml";
pub const NETWORK_NAME: &str = "testnet";

const COMPOSE_VERSION: &str = "3.7";
const MANAGER_ONLY: &str = "node.role == manager";

#[derive(Debug, Serialize)]
struct ComposeFile {
    version: String,
    services: BTreeMap<String, ComposeService>,
    networks: BTreeMap<String, ComposeNetwork>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    volumes: BTreeMap<String, ComposeVolume>,
}

#[derive(Debug, Default, Serialize)]
struct ComposeService {
    image: String,
    hostname: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    command: Vec<String>,
    networks: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ports: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    environment: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    volumes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    depends_on: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
    deploy: DeployConfig,
}

#[derive(Debug, Default, Serialize)]
struct DeployConfig {
    replicas: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    placement: Option<Placement>,
    restart_policy: RestartPolicy,
}

#[derive(Debug, Serialize)]
struct Placement {
    constraints: Vec<String>,
}

#[derive(Debug, Default, Serialize)]
struct RestartPolicy {
    condition: String,
    delay: String,
    max_attempts: u32,
}

#[derive(Debug, Serialize)]
struct ComposeNetwork {
    driver: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    attachable: bool,
}

#[derive(Debug, Default, Serialize)]
struct ComposeVolume {}

fn restart_policy() -> RestartPolicy {
    RestartPolicy {
        condition: "on-failure".into(),
        delay: "5s".into(),
        max_attempts: 5,
    }
}

/// Serializes a [`Topology`] into the mesh's manifest format.
///
/// Rendering is pure: the same topology always gives the same bytes.
#[derive(Debug, Clone, Default)]
pub struct ManifestEmitter {
    registry_prefix: Option<String>,
}

impl ManifestEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite every image to `<prefix>/<image>`, e.g. the in-mesh registry.
    pub fn with_registry(prefix: impl Into<String>) -> Self {
        Self {
            registry_prefix: Some(prefix.into()),
        }
    }

    pub fn image_ref(&self, image: &str) -> String {
        match &self.registry_prefix {
            Some(prefix) => format!("{}/{image}", prefix.trim_end_matches('/')),
            None => image.to_string(),
        }
    }

    pub fn render(&self, topology: &Topology) -> Result<String> {
        let mut compose = ComposeFile {
            version: COMPOSE_VERSION.into(),
            services: BTreeMap::new(),
            networks: BTreeMap::new(),
            volumes: BTreeMap::new(),
        };

        compose.networks.insert(
            NETWORK_NAME.into(),
            ComposeNetwork {
                driver: if topology.local { "bridge" } else { "overlay" }.into(),
                attachable: !topology.local,
            },
        );

        for service in &topology.infra {
            for (volume, _) in &service.volumes {
                compose.volumes.insert(volume.clone(), ComposeVolume::default());
            }
            compose
                .services
                .insert(service.name.clone(), self.infra_service(service));
        }

        for node in &topology.nodes {
            compose
                .services
                .insert(node.alias().to_string(), self.node_service(topology, node));
        }

        Ok(serde_yaml::to_string(&compose)?)
    }

    /// Render and write to `<output_dir>/<name>/docker-compose.yml`.
    pub fn write(&self, topology: &Topology, output_dir: &Path) -> Result<PathBuf> {
        let yaml = self.render(topology)?;

        let dir = output_dir.join(&topology.name);
        std::fs::create_dir_all(&dir).map_err(|source| Error::ManifestWrite {
            path: dir.clone(),
            source,
        })?;

        let path = dir.join(MANIFEST_FILE);
        std::fs::write(&path, yaml).map_err(|source| Error::ManifestWrite {
            path: path.clone(),
            source,
        })?;

        info!(deployment = %topology.name, path = %path.display(), "manifest written");
        Ok(path)
    }

    fn node_service(&self, topology: &Topology, node: &ServiceNode) -> ComposeService {
        let labels = BTreeMap::from([
            ("testnet.deployment".to_string(), topology.name.clone()),
            ("testnet.group".to_string(), node.id.group.clone()),
            ("testnet.role".to_string(), node.role().to_string()),
        ]);

        ComposeService {
            image: self.image_ref(&node.image),
            hostname: node.alias().to_string(),
            command: node.flags.clone(),
            networks: vec![NETWORK_NAME.into()],
            ports: node.ports.all().iter().map(|p| format!("{p}:{p}")).collect(),
            environment: node.environment.clone(),
            depends_on: node.depends_on.clone(),
            labels,
            deploy: DeployConfig {
                replicas: 1,
                placement: None,
                restart_policy: restart_policy(),
            },
            ..Default::default()
        }
    }

    fn infra_service(&self, service: &InfraService) -> ComposeService {
        ComposeService {
            image: self.image_ref(&service.image),
            hostname: service.name.clone(),
            command: service.command.clone(),
            networks: vec![NETWORK_NAME.into()],
            ports: service.ports.iter().map(|p| format!("{p}:{p}")).collect(),
            volumes: service
                .volumes
                .iter()
                .map(|(volume, target)| format!("{volume}:{target}"))
                .collect(),
            deploy: DeployConfig {
                replicas: 1,
                placement: Some(Placement {
                    constraints: vec![MANAGER_ONLY.into()],
                }),
                restart_policy: restart_policy(),
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BlockchainConfig, ChainProfile, ExperimentConfig, GroupConfig, ImagesConfig,
        MachinesConfig, Role,
    };
    use crate::generator::TopologyGenerator;

    fn config(local: bool, profile: ChainProfile) -> ExperimentConfig {
        let group = |name: &str, role, instances| GroupConfig {
            name: name.to_string(),
            role,
            instances,
            flags: "-v 6".into(),
            image: None,
            connect_to: None,
            ports: None,
        };
        ExperimentConfig {
            name: "exp".into(),
            local,
            groups: vec![
                group("o", Role::Orchestrator, 2),
                group("t", Role::Transcoder, 4),
                group("b", Role::Broadcaster, 1),
                group("s", Role::Streamer, 0),
            ],
            machines: MachinesConfig {
                zones: vec!["us-east1-b".into()],
                ..MachinesConfig::default()
            },
            blockchain: BlockchainConfig {
                profile,
                ..BlockchainConfig::default()
            },
            port_seed: Some(2024),
            images: ImagesConfig::default(),
        }
    }

    fn yaml(cfg: &ExperimentConfig, emitter: &ManifestEmitter) -> serde_yaml::Value {
        let topo = TopologyGenerator::new(cfg).generate().unwrap();
        serde_yaml::from_str(&emitter.render(&topo).unwrap()).unwrap()
    }

    #[test]
    fn same_seed_gives_identical_bytes() {
        let cfg = config(false, ChainProfile::Devenv);
        let dir = tempfile::tempdir().unwrap();
        let emitter = ManifestEmitter::new();

        let first = emitter
            .write(&TopologyGenerator::new(&cfg).generate().unwrap(), dir.path())
            .unwrap();
        let a = std::fs::read(&first).unwrap();

        let second = emitter
            .write(&TopologyGenerator::new(&cfg).generate().unwrap(), dir.path())
            .unwrap();
        let b = std::fs::read(&second).unwrap();

        assert_eq!(first, second);
        assert_eq!(a, b);
        assert_eq!(first, dir.path().join("exp").join(MANIFEST_FILE));
    }

    #[test]
    fn services_keyed_by_alias_on_one_network() {
        let doc = yaml(&config(false, ChainProfile::Offchain), &ManifestEmitter::new());

        assert_eq!(doc["version"].as_str(), Some("3.7"));
        let services = doc["services"].as_mapping().unwrap();
        assert_eq!(services.len(), 7);
        assert!(services.contains_key("transcoder_3"));
        assert!(!services.keys().any(|k| k.as_str().is_some_and(|k| k.starts_with("streamer"))));

        assert_eq!(doc["networks"]["testnet"]["driver"].as_str(), Some("overlay"));
        assert_eq!(doc["networks"]["testnet"]["attachable"].as_bool(), Some(true));
        assert_eq!(
            doc["services"]["orchestrator_0"]["networks"][0].as_str(),
            Some("testnet")
        );
    }

    #[test]
    fn local_mode_uses_bridge() {
        let doc = yaml(&config(true, ChainProfile::Offchain), &ManifestEmitter::new());
        assert_eq!(doc["networks"]["testnet"]["driver"].as_str(), Some("bridge"));
        assert!(doc["networks"]["testnet"].get("attachable").is_none());
    }

    #[test]
    fn geth_is_pinned_to_manager_with_volume() {
        let doc = yaml(&config(false, ChainProfile::Devenv), &ManifestEmitter::new());

        let geth = &doc["services"]["geth"];
        assert_eq!(
            geth["deploy"]["placement"]["constraints"][0].as_str(),
            Some("node.role == manager")
        );
        assert_eq!(geth["volumes"][0].as_str(), Some("geth-data:/root/.ethereum"));
        assert!(doc["volumes"].get("geth-data").is_some());
        assert!(doc["services"]["broadcaster_0"]["deploy"].get("placement").is_none());
        assert_eq!(
            doc["services"]["transcoder_0"]["depends_on"][0].as_str(),
            Some("geth")
        );
    }

    #[test]
    fn registry_prefix_rewrites_images() {
        let emitter = ManifestEmitter::with_registry("127.0.0.1:5000/");
        let doc = yaml(&config(false, ChainProfile::Offchain), &emitter);
        assert_eq!(
            doc["services"]["orchestrator_1"]["image"].as_str(),
            Some("127.0.0.1:5000/livepeer/go-livepeer:master")
        );
    }

    #[test]
    fn ports_are_published_one_to_one() {
        let cfg = config(false, ChainProfile::Offchain);
        let topo = TopologyGenerator::new(&cfg).generate().unwrap();
        let doc: serde_yaml::Value =
            serde_yaml::from_str(&ManifestEmitter::new().render(&topo).unwrap()).unwrap();

        let node = topo.node("broadcaster_0").unwrap();
        let ports: Vec<&str> = doc["services"]["broadcaster_0"]["ports"]
            .as_sequence()
            .unwrap()
            .iter()
            .filter_map(|p| p.as_str())
            .collect();
        assert_eq!(ports[0], format!("{0}:{0}", node.ports.cli));
        assert_eq!(ports.len(), 3);
    }
}
