//! Which instance talks to which.
//!
//! Defaults:
//!
//! | dependent    | provider     | rule        |
//! |--------------|--------------|-------------|
//! | transcoder   | orchestrator | round robin |
//! | broadcaster  | orchestrator | all         |
//! | streamer     | broadcaster  | round robin |
//! | orchestrator | none         |             |
//!
//! Under the defaults, providers are every instance of the provider role and
//! the dependent's role-wide index drives the pairing. A group's
//! `connect_to` narrows providers to one group and pairs by the dependent's
//! position inside its own group.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{ExperimentConfig, PairingRule, Role};
use crate::node::ServiceNode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    /// Transcoder attached to an orchestrator.
    BondedTo,
    /// Broadcaster's orchestrator pool.
    Orchestrators,
    /// Streamer pushing into a broadcaster.
    Ingest,
    /// Any pairing declared for a role without a default rule.
    Peers,
}

impl RelationshipKind {
    fn for_dependent(role: Role) -> Self {
        match role {
            Role::Transcoder => Self::BondedTo,
            Role::Broadcaster => Self::Orchestrators,
            Role::Streamer => Self::Ingest,
            Role::Orchestrator => Self::Peers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub kind: RelationshipKind,
    pub targets: Vec<String>,
}

/// Provider role and rule used when a group declares nothing.
pub fn default_rule(role: Role) -> Option<(Role, PairingRule)> {
    match role {
        Role::Transcoder => Some((Role::Orchestrator, PairingRule::RoundRobin)),
        Role::Broadcaster => Some((Role::Orchestrator, PairingRule::All)),
        Role::Streamer => Some((Role::Broadcaster, PairingRule::RoundRobin)),
        Role::Orchestrator => None,
    }
}

/// Provider positions for the dependent at `position`.
pub fn pair(rule: &PairingRule, position: usize, providers: usize) -> Vec<usize> {
    if providers == 0 {
        return Vec::new();
    }
    match rule {
        PairingRule::RoundRobin => vec![position % providers],
        PairingRule::All => (0..providers).collect(),
        PairingRule::Explicit(indices) if !indices.is_empty() => {
            let i = indices[position % indices.len()];
            if i < providers { vec![i] } else { Vec::new() }
        }
        PairingRule::Explicit(_) => Vec::new(),
    }
}

/// `dependent alias → providers`. A pure function of the config and the
/// generated instances.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipMap {
    entries: BTreeMap<String, Relationship>,
}

impl RelationshipMap {
    pub fn build(config: &ExperimentConfig, nodes: &[ServiceNode]) -> Self {
        let mut entries = BTreeMap::new();

        for node in nodes {
            let declared = config
                .group(&node.id.group)
                .and_then(|g| g.connect_to.as_ref());

            let (providers, rule, position): (Vec<&ServiceNode>, PairingRule, usize) =
                match declared {
                    Some(connect) => (
                        nodes.iter().filter(|n| n.id.group == connect.group).collect(),
                        connect.rule.clone(),
                        node.group_index,
                    ),
                    None => match default_rule(node.role()) {
                        Some((provider_role, rule)) => (
                            nodes.iter().filter(|n| n.role() == provider_role).collect(),
                            rule,
                            node.id.index,
                        ),
                        None => continue,
                    },
                };

            let targets: Vec<String> = pair(&rule, position, providers.len())
                .into_iter()
                .map(|i| providers[i].alias().to_string())
                .collect();

            if targets.is_empty() {
                continue;
            }

            entries.insert(
                node.alias().to_string(),
                Relationship {
                    kind: RelationshipKind::for_dependent(node.role()),
                    targets,
                },
            );
        }

        Self { entries }
    }

    pub fn get(&self, alias: &str) -> Option<&Relationship> {
        self.entries.get(alias)
    }

    pub fn targets(&self, alias: &str) -> &[String] {
        self.entries
            .get(alias)
            .map(|r| r.targets.as_slice())
            .unwrap_or_default()
    }

    /// Aliases that list `provider` as a target.
    pub fn dependents_of(&self, provider: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(_, r)| r.targets.iter().any(|t| t == provider))
            .map(|(alias, _)| alias.as_str())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Relationship)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
