//! Experiment description → service graph → compose manifest.
//!
//! Everything here is pure apart from [`ManifestEmitter::write`]: the same
//! config and seed always produce the same graph and the same bytes.

pub mod config;
pub mod credentials;
pub mod flags;
pub mod generator;
pub mod manifest;
pub mod node;
pub mod ports;
pub mod relationships;

use std::path::PathBuf;

pub use config::{ChainProfile, ExperimentConfig, GroupConfig, PairingRule, Role};
pub use generator::{Topology, TopologyGenerator};
pub use manifest::ManifestEmitter;
pub use node::{InfraService, NodeId, NodePorts, ServiceNode};
pub use ports::PortRegistry;
pub use relationships::{Relationship, RelationshipKind, RelationshipMap};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid experiment config: {0}")]
    InvalidConfig(String),

    #[error("could not read experiment config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no free port for {owner} above base {base} after {draws} draws")]
    PortExhaustion {
        owner: String,
        base: u16,
        draws: u32,
    },

    #[error("{alias} references unknown service {target}")]
    RelationshipResolution { alias: String, target: String },

    #[error("failed to write manifest {path}: {source}")]
    ManifestWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("manifest serialization failed: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
