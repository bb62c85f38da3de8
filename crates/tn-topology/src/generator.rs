use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{ChainProfile, ExperimentConfig, Role};
use crate::credentials::{Credential, shared_secret};
use crate::flags;
use crate::node::{InfraService, NodeId, NodePorts, ServiceNode};
use crate::ports::{PortDraw, PortRegistry};
use crate::relationships::{RelationshipKind, RelationshipMap};
use crate::{Error, Result};

/// Keeps the credential stream independent of how many port draws a run made.
const CREDENTIAL_SALT: u64 = 0x9e37_79b9_7f4a_7c15;

/// The generated service graph of one deployment.
#[derive(Debug, Clone, Serialize)]
pub struct Topology {
    pub name: String,
    pub seed: u64,
    pub local: bool,
    pub nodes: Vec<ServiceNode>,
    pub infra: Vec<InfraService>,
    pub relationships: RelationshipMap,
    #[serde(skip)]
    pub port_draws: Vec<PortDraw>,
}

impl Topology {
    pub fn node(&self, alias: &str) -> Option<&ServiceNode> {
        self.nodes.iter().find(|n| n.alias() == alias)
    }

    pub fn nodes_with_role(&self, role: Role) -> impl Iterator<Item = &ServiceNode> {
        self.nodes.iter().filter(move |n| n.role() == role)
    }

    /// Alias → published ports, the surface external tools consume.
    pub fn port_map(&self) -> BTreeMap<String, NodePorts> {
        self.nodes
            .iter()
            .map(|n| (n.alias().to_string(), n.ports))
            .collect()
    }

    /// Every distinct image the deployment runs.
    pub fn images(&self) -> BTreeSet<String> {
        self.nodes
            .iter()
            .map(|n| n.image.clone())
            .chain(self.infra.iter().map(|s| s.image.clone()))
            .collect()
    }

    /// Check graph consistency: unique aliases, unique host ports, and every
    /// relationship target and dependency resolving to a service.
    pub fn validate(&self) -> Result<()> {
        let mut names: HashSet<&str> = HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.alias()) {
                return Err(Error::InvalidConfig(format!(
                    "alias {} generated twice",
                    node.alias()
                )));
            }
        }
        for service in &self.infra {
            if !names.insert(service.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "service name {} generated twice",
                    service.name
                )));
            }
        }

        let mut ports = HashSet::new();
        let all_ports = self
            .nodes
            .iter()
            .flat_map(|n| n.ports.all())
            .chain(self.infra.iter().flat_map(|s| s.ports.iter().copied()));
        for port in all_ports {
            if !ports.insert(port) {
                return Err(Error::InvalidConfig(format!("host port {port} assigned twice")));
            }
        }

        for (alias, relationship) in self.relationships.iter() {
            for target in &relationship.targets {
                if !names.contains(target.as_str()) {
                    return Err(Error::RelationshipResolution {
                        alias: alias.to_string(),
                        target: target.clone(),
                    });
                }
            }
        }

        for node in &self.nodes {
            if let Some(dep) = node.depends_on.iter().find(|d| !names.contains(d.as_str())) {
                return Err(Error::RelationshipResolution {
                    alias: node.alias().to_string(),
                    target: dep.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Turns a validated [`ExperimentConfig`] into a [`Topology`].
///
/// Groups are walked in declaration order and all ports come from one
/// [`PortRegistry`], so a pinned seed reproduces the graph exactly.
pub struct TopologyGenerator<'a> {
    config: &'a ExperimentConfig,
    registry: PortRegistry,
}

impl<'a> TopologyGenerator<'a> {
    /// Seeded from `port_seed`, or from a fresh random seed that is logged.
    pub fn new(config: &'a ExperimentConfig) -> Self {
        let seed = config
            .port_seed
            .unwrap_or_else(|| rand::rng().random::<u64>());
        Self::with_seed(config, seed)
    }

    pub fn with_seed(config: &'a ExperimentConfig, seed: u64) -> Self {
        Self {
            config,
            registry: PortRegistry::new(seed),
        }
    }

    pub fn seed(&self) -> u64 {
        self.registry.seed()
    }

    pub fn generate(self) -> Result<Topology> {
        let config = self.config;
        config.validate()?;

        let seed = self.registry.seed();
        info!(deployment = %config.name, seed, "generating topology");

        let infra = self.infra_services();
        let mut nodes = self.allocate_nodes()?;
        let relationships = RelationshipMap::build(config, &nodes);
        self.wire(&mut nodes, &relationships);

        let topology = Topology {
            name: config.name.clone(),
            seed,
            local: config.local,
            nodes,
            infra,
            relationships,
            port_draws: self.registry.draws(),
        };
        topology.validate()?;

        info!(
            deployment = %topology.name,
            seed,
            nodes = topology.nodes.len(),
            relationships = topology.relationships.len(),
            "topology generated"
        );
        Ok(topology)
    }

    fn infra_services(&self) -> Vec<InfraService> {
        if self.config.blockchain.profile != ChainProfile::Devenv {
            return Vec::new();
        }

        let geth = InfraService::geth(&self.config.blockchain.geth_image);
        for port in &geth.ports {
            self.registry.reserve(*port);
        }
        vec![geth]
    }

    fn allocate_nodes(&self) -> Result<Vec<ServiceNode>> {
        let mut next_index: HashMap<Role, usize> = HashMap::new();
        let mut nodes = Vec::new();

        for group in &self.config.groups {
            if group.instances == 0 {
                debug!(group = %group.name, "group has no instances");
                continue;
            }

            let bases = group.ports.unwrap_or_default();
            let image = group
                .image
                .clone()
                .unwrap_or_else(|| self.config.images.for_role(group.role).to_string());

            for position in 0..group.instances {
                let counter = next_index.entry(group.role).or_default();
                let id = NodeId {
                    role: group.role,
                    group: group.name.clone(),
                    index: *counter,
                };
                *counter += 1;

                let alias = id.alias();
                let ports = NodePorts {
                    cli: self.registry.allocate(bases.cli, &alias)?,
                    rtmp: self.registry.allocate(bases.rtmp, &alias)?,
                    http: self.registry.allocate(bases.http, &alias)?,
                };
                debug!(%alias, group = %group.name, cli = ports.cli, rtmp = ports.rtmp, http = ports.http, "node allocated");

                nodes.push(ServiceNode::new(id, position, ports, image.clone()));
            }
        }

        Ok(nodes)
    }

    /// Fill in flags, dependencies and credentials once every node exists.
    fn wire(&self, nodes: &mut [ServiceNode], relationships: &RelationshipMap) {
        let config = self.config;
        let devenv = config.blockchain.profile == ChainProfile::Devenv;
        let on_chain = config.blockchain.profile != ChainProfile::Offchain;

        let mut rng = StdRng::seed_from_u64(self.registry.seed() ^ CREDENTIAL_SALT);
        let secret = shared_secret(&mut rng);

        let by_alias: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.alias(), i))
            .collect();

        let bonded: HashSet<&str> = relationships
            .iter()
            .filter(|(_, r)| r.kind == RelationshipKind::BondedTo)
            .flat_map(|(_, r)| r.targets.iter().map(String::as_str))
            .collect();

        let mut wiring = Vec::with_capacity(nodes.len());
        for node in nodes.iter() {
            let targets = relationships.targets(node.alias());
            let providers: Vec<&ServiceNode> = targets
                .iter()
                .filter_map(|t| by_alias.get(t.as_str()).map(|&i| &nodes[i]))
                .collect();

            let user_flags = config
                .group(&node.id.group)
                .map(|g| g.flags.as_str())
                .unwrap_or_default();

            let flags = flags::merge(
                node,
                flags::relationship_flags(node, &providers, &secret, bonded.contains(node.alias())),
                flags::chain_flags(node.role(), &config.blockchain),
                user_flags,
            );

            let mut depends_on = Vec::new();
            if devenv {
                depends_on.push("geth".to_string());
            }
            depends_on.extend(targets.iter().cloned());

            let environment = if on_chain && matches!(node.role(), Role::Broadcaster | Role::Orchestrator) {
                Credential::generate(&mut rng).env()
            } else {
                BTreeMap::new()
            };

            wiring.push((flags, depends_on, environment));
        }

        for (node, (flags, depends_on, environment)) in nodes.iter_mut().zip(wiring) {
            node.flags = flags;
            node.depends_on = depends_on;
            node.environment = environment;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BlockchainConfig, ConnectTo, GroupConfig, ImagesConfig, MachinesConfig, PairingRule,
        PortBases,
    };
    use crate::credentials::PRIVATE_KEY_ENV;

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
            port_seed: Some(1234),
            images: ImagesConfig::default(),
        }
    }

    fn full_config() -> ExperimentConfig {
        let mut cfg = config(vec![
            group("orchs", Role::Orchestrator, 3),
            group("ts", Role::Transcoder, 5),
            group("bs", Role::Broadcaster, 2),
            group("ss", Role::Streamer, 3),
        ]);
        cfg.blockchain.profile = ChainProfile::Devenv;
        cfg
    }

    #[test]
    fn every_port_is_unique() {
        let topo = TopologyGenerator::new(&full_config()).generate().unwrap();

        let mut seen = HashSet::new();
        for node in &topo.nodes {
            for port in node.ports.all() {
                assert!(seen.insert(port), "duplicate port {port}");
            }
        }
        for service in &topo.infra {
            for port in &service.ports {
                assert!(seen.insert(*port), "infra port {port} reused");
            }
        }
        assert_eq!(seen.len(), 13 * 3 + 2);
    }

    #[test]
    fn two_groups_on_one_base_fifty_instances() {
        let shared = PortBases {
            cli: 8935,
            rtmp: 8935,
            http: 8935,
        };
        let mut a = group("a", Role::Orchestrator, 20);
        a.ports = Some(shared);
        let mut b = group("b", Role::Orchestrator, 30);
        b.ports = Some(shared);

        let topo = TopologyGenerator::new(&config(vec![a, b])).generate().unwrap();

        let ports: HashSet<u16> = topo.nodes.iter().flat_map(|n| n.ports.all()).collect();
        assert_eq!(topo.nodes.len(), 50);
        assert_eq!(ports.len(), 150);
        assert!(ports.iter().all(|p| (8936..=10935).contains(p)));
    }

    #[test]
    fn zero_instance_groups_produce_nothing() {
        let cfg = config(vec![
            group("orchs", Role::Orchestrator, 0),
            group("ts", Role::Transcoder, 2),
            group("empty-bs", Role::Broadcaster, 0),
        ]);
        let topo = TopologyGenerator::new(&cfg).generate().unwrap();

        assert_eq!(topo.nodes.len(), 2);
        assert!(topo.nodes.iter().all(|n| n.id.group == "ts"));
        assert!(topo.relationships.is_empty());
        // No orchestrator to pair with: transcoders stay unconnected.
        assert!(topo.node("transcoder_0").unwrap().depends_on.is_empty());
    }

    #[test]
    fn round_robin_pairs_transcoders_to_orchestrators() {
        let cfg = config(vec![
            group("orchs", Role::Orchestrator, 2),
            group("ts", Role::Transcoder, 4),
        ]);
        let topo = TopologyGenerator::new(&cfg).generate().unwrap();

        for (t, o) in [(0, 0), (1, 1), (2, 0), (3, 1)] {
            let rel = topo.relationships.get(&format!("transcoder_{t}")).unwrap();
            assert_eq!(rel.kind, RelationshipKind::BondedTo);
            assert_eq!(rel.targets, vec![format!("orchestrator_{o}")]);
        }
        assert_eq!(
            topo.relationships.dependents_of("orchestrator_0"),
            vec!["transcoder_0", "transcoder_2"]
        );
    }

    #[test]
    fn relationships_never_dangle() {
        let topo = TopologyGenerator::new(&full_config()).generate().unwrap();

        for (alias, rel) in topo.relationships.iter() {
            assert!(topo.node(alias).is_some());
            for target in &rel.targets {
                assert!(topo.node(target).is_some(), "{alias} -> {target} dangles");
            }
        }
        for node in &topo.nodes {
            for dep in &node.depends_on {
                assert!(
                    topo.node(dep).is_some() || topo.infra.iter().any(|s| &s.name == dep),
                    "{} depends on missing {dep}",
                    node.alias()
                );
            }
        }
    }

    #[test]
    fn aliases_are_role_wide_across_groups() {
        let cfg = config(vec![
            group("orchs-a", Role::Orchestrator, 2),
            group("orchs-b", Role::Orchestrator, 2),
        ]);
        let topo = TopologyGenerator::new(&cfg).generate().unwrap();

        let aliases: Vec<&str> = topo.nodes.iter().map(ServiceNode::alias).collect();
        assert_eq!(
            aliases,
            vec!["orchestrator_0", "orchestrator_1", "orchestrator_2", "orchestrator_3"]
        );
        assert_eq!(topo.node("orchestrator_2").unwrap().group_index, 0);
    }

    #[test]
    fn same_seed_same_graph() {
        let cfg = full_config();
        let a = TopologyGenerator::new(&cfg).generate().unwrap();
        let b = TopologyGenerator::new(&cfg).generate().unwrap();

        assert_eq!(a.nodes, b.nodes);
        assert_eq!(a.relationships, b.relationships);

        let other = TopologyGenerator::with_seed(&cfg, 99).generate().unwrap();
        assert_ne!(a.port_map(), other.port_map());
    }

    #[test]
    fn explicit_connect_to_overrides_default() {
        let mut ts = group("ts", Role::Transcoder, 3);
        ts.connect_to = Some(ConnectTo {
            group: "orchs-b".into(),
            rule: PairingRule::Explicit(vec![1]),
        });
        let cfg = config(vec![
            group("orchs-a", Role::Orchestrator, 2),
            group("orchs-b", Role::Orchestrator, 2),
            ts,
        ]);
        let topo = TopologyGenerator::new(&cfg).generate().unwrap();

        for t in 0..3 {
            assert_eq!(
                topo.relationships.targets(&format!("transcoder_{t}")),
                ["orchestrator_3".to_string()]
            );
        }
    }

    #[test]
    fn broadcasters_take_every_orchestrator() {
        let cfg = config(vec![
            group("orchs", Role::Orchestrator, 3),
            group("bs", Role::Broadcaster, 1),
        ]);
        let topo = TopologyGenerator::new(&cfg).generate().unwrap();

        let rel = topo.relationships.get("broadcaster_0").unwrap();
        assert_eq!(rel.kind, RelationshipKind::Orchestrators);
        assert_eq!(rel.targets.len(), 3);

        let flags = &topo.node("broadcaster_0").unwrap().flags;
        let i = flags.iter().position(|f| f == "-orchAddr").unwrap();
        assert_eq!(flags[i + 1].split(',').count(), 3);
    }

    #[test]
    fn orchestrator_without_transcoder_transcodes() {
        let cfg = config(vec![
            group("orchs", Role::Orchestrator, 2),
            group("ts", Role::Transcoder, 1),
        ]);
        let topo = TopologyGenerator::new(&cfg).generate().unwrap();

        let bonded = &topo.node("orchestrator_0").unwrap().flags;
        let lone = &topo.node("orchestrator_1").unwrap().flags;
        assert!(bonded.contains(&"-orchSecret".to_string()));
        assert!(!bonded.contains(&"-transcoder".to_string()));
        assert!(lone.contains(&"-transcoder".to_string()));
    }

    #[test]
    fn devenv_adds_geth_and_credentials() {
        let topo = TopologyGenerator::new(&full_config()).generate().unwrap();

        assert_eq!(topo.infra.len(), 1);
        assert_eq!(topo.infra[0].name, "geth");
        assert!(topo.nodes.iter().all(|n| n.depends_on.first().map(String::as_str) == Some("geth")));

        let orch = topo.node("orchestrator_0").unwrap();
        assert!(orch.environment.contains_key(PRIVATE_KEY_ENV));
        assert!(topo.node("transcoder_0").unwrap().environment.is_empty());
        assert_ne!(
            orch.environment[PRIVATE_KEY_ENV],
            topo.node("orchestrator_1").unwrap().environment[PRIVATE_KEY_ENV]
        );
    }

    #[test]
    fn offchain_has_no_chain_services_or_keys() {
        let mut cfg = full_config();
        cfg.blockchain.profile = ChainProfile::Offchain;
        let topo = TopologyGenerator::new(&cfg).generate().unwrap();

        assert!(topo.infra.is_empty());
        assert!(topo.nodes.iter().all(|n| n.environment.is_empty()));
        assert!(topo.nodes.iter().all(|n| !n.depends_on.contains(&"geth".to_string())));
    }

    #[test]
    fn user_flags_come_last_and_bindings_are_dropped() {
        let mut orchs = group("orchs", Role::Orchestrator, 1);
        orchs.flags = "-httpAddr 0.0.0.0:1 -pricePerUnit 1".into();
        let topo = TopologyGenerator::new(&config(vec![orchs])).generate().unwrap();

        let node = topo.node("orchestrator_0").unwrap();
        let http = node.flags.iter().position(|f| f == "-httpAddr").unwrap();
        assert_eq!(node.flags[http + 1], format!("0.0.0.0:{}", node.ports.http));
        assert!(!node.flags.contains(&"0.0.0.0:1".to_string()));
        assert_eq!(node.flags.last().map(String::as_str), Some("1"));
    }

    #[test]
    fn invalid_config_is_rejected_before_allocation() {
        let cfg = config(vec![
            group("dup", Role::Orchestrator, 1),
            group("dup", Role::Transcoder, 1),
        ]);
        let generator = TopologyGenerator::new(&cfg);
        assert!(matches!(generator.generate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn validate_catches_dangling_dependency() {
        let mut topo = TopologyGenerator::new(&config(vec![group("o", Role::Orchestrator, 1)]))
            .generate()
            .unwrap();
        topo.nodes[0].depends_on.push("transcoder_9".into());

        assert!(matches!(
            topo.validate(),
            Err(Error::RelationshipResolution { ref target, .. }) if target == "transcoder_9"
        ));
    }
}
