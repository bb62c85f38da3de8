use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::Role;

/// Typed identity of a service instance.
///
/// `index` counts instances of the role across all groups, in declaration
/// order, so aliases stay unique even when several groups share a role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    pub role: Role,
    pub group: String,
    pub index: usize,
}

impl NodeId {
    pub fn alias(&self) -> String {
        format!("{}_{}", self.role, self.index)
    }
}

/// The three host ports every instance publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePorts {
    pub cli: u16,
    pub rtmp: u16,
    pub http: u16,
}

impl NodePorts {
    pub fn all(&self) -> [u16; 3] {
        [self.cli, self.rtmp, self.http]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceNode {
    pub id: NodeId,
    /// Derived from `id` once and never changed afterwards.
    alias: String,
    /// Position inside its group.
    pub group_index: usize,
    pub ports: NodePorts,
    pub image: String,
    pub flags: Vec<String>,
    pub depends_on: Vec<String>,
    pub environment: BTreeMap<String, String>,
}

impl ServiceNode {
    pub fn new(id: NodeId, group_index: usize, ports: NodePorts, image: String) -> Self {
        let alias = id.alias();
        Self {
            id,
            alias,
            group_index,
            ports,
            image,
            flags: Vec::new(),
            depends_on: Vec::new(),
            environment: BTreeMap::new(),
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn role(&self) -> Role {
        self.id.role
    }

    /// `<alias>:<port>` as seen from inside the mesh network.
    pub fn address(&self, port: u16) -> String {
        format!("{}:{port}", self.alias)
    }
}

/// A service that is not a test-network node, pinned to the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InfraService {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    /// Host ports published 1:1.
    pub ports: Vec<u16>,
    /// `(named volume, container path)`.
    pub volumes: Vec<(String, String)>,
}

/// JSON-RPC and websocket ports of the development chain.
pub const GETH_RPC_PORT: u16 = 8545;
pub const GETH_WS_PORT: u16 = 8546;

impl InfraService {
    pub fn geth(image: &str) -> Self {
        Self {
            name: "geth".into(),
            image: image.to_string(),
            command: Vec::new(),
            ports: vec![GETH_RPC_PORT, GETH_WS_PORT],
            volumes: vec![("geth-data".into(), "/root/.ethereum".into())],
        }
    }
}
