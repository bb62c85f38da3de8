//! Command-line flags for each instance.
//!
//! Order is fixed: infra flags, relationship flags, chain flags, then the
//! group's own flags verbatim. Binding flags are owned by the generator; a
//! user-supplied binding flag would point a node at a port nobody published,
//! so it is dropped along with its value.

use tracing::warn;

use crate::config::{BlockchainConfig, ChainProfile, Role};
use crate::node::{GETH_WS_PORT, ServiceNode};

pub const BINDING_FLAGS: &[&str] = &["cliAddr", "rtmpAddr", "httpAddr", "serviceAddr"];

/// Controller contract of the development chain image.
pub const DEVENV_CONTROLLER: &str = "0x04746b890d090ae3c4c5df0101cfd089a4faca6c";

fn flag_name(token: &str) -> Option<&str> {
    let stripped = token.strip_prefix("--").or_else(|| token.strip_prefix('-'))?;
    Some(stripped.split('=').next().unwrap_or(stripped))
}

fn is_binding_flag(token: &str) -> bool {
    flag_name(token).is_some_and(|name| BINDING_FLAGS.contains(&name))
}

/// Split a free-form flag string on whitespace.
pub fn tokenize(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

/// Drop binding flags (both `-flag value` and `-flag=value`). Returns the
/// remaining tokens and the dropped flags.
pub fn strip_binding_flags(tokens: &[String]) -> (Vec<String>, Vec<String>) {
    let mut kept = Vec::with_capacity(tokens.len());
    let mut dropped = Vec::new();
    let mut iter = tokens.iter().peekable();

    while let Some(token) = iter.next() {
        if !is_binding_flag(token) {
            kept.push(token.clone());
            continue;
        }
        dropped.push(token.clone());
        if !token.contains('=')
            && let Some(value) = iter.next_if(|next| !next.starts_with('-'))
        {
            dropped.push(value.clone());
        }
    }

    (kept, dropped)
}

fn bind(port: u16) -> String {
    format!("0.0.0.0:{port}")
}

/// Role switch and bind addresses forced to the allocated ports.
pub fn infra_flags(node: &ServiceNode) -> Vec<String> {
    let p = node.ports;
    match node.role() {
        Role::Broadcaster => vec![
            "-broadcaster".into(),
            "-cliAddr".into(),
            bind(p.cli),
            "-rtmpAddr".into(),
            bind(p.rtmp),
            "-httpAddr".into(),
            bind(p.http),
        ],
        Role::Orchestrator => vec![
            "-orchestrator".into(),
            "-cliAddr".into(),
            bind(p.cli),
            "-httpAddr".into(),
            bind(p.http),
            "-serviceAddr".into(),
            node.address(p.http),
        ],
        Role::Transcoder => vec!["-transcoder".into(), "-cliAddr".into(), bind(p.cli)],
        Role::Streamer => Vec::new(),
    }
}

/// Flags that point a node at its providers.
///
/// `bonded` is whether any transcoder depends on this node; orchestrators
/// without one transcode themselves.
pub fn relationship_flags(
    node: &ServiceNode,
    providers: &[&ServiceNode],
    secret: &str,
    bonded: bool,
) -> Vec<String> {
    match node.role() {
        Role::Transcoder if !providers.is_empty() => {
            let orchs: Vec<String> = providers.iter().map(|o| o.address(o.ports.http)).collect();
            vec![
                "-orchAddr".into(),
                orchs.join(","),
                "-orchSecret".into(),
                secret.to_string(),
            ]
        }
        Role::Broadcaster if !providers.is_empty() => {
            let orchs: Vec<String> = providers.iter().map(|o| o.address(o.ports.http)).collect();
            vec!["-orchAddr".into(), orchs.join(",")]
        }
        Role::Streamer => match providers.first() {
            Some(b) => vec![
                "-host".into(),
                b.alias().to_string(),
                "-rtmp".into(),
                b.ports.rtmp.to_string(),
                "-media".into(),
                b.ports.http.to_string(),
            ],
            None => Vec::new(),
        },
        Role::Orchestrator if bonded => vec!["-orchSecret".into(), secret.to_string()],
        Role::Orchestrator => vec!["-transcoder".into()],
        _ => Vec::new(),
    }
}

/// Network flags for the chain profile. Streamers are not chain clients.
pub fn chain_flags(role: Role, chain: &BlockchainConfig) -> Vec<String> {
    if role == Role::Streamer {
        return Vec::new();
    }

    match chain.profile {
        ChainProfile::Offchain => vec!["-network".into(), "offchain".into()],
        ChainProfile::Devenv => vec![
            "-network".into(),
            chain.network.clone().unwrap_or_else(|| "devenv".into()),
            "-ethUrl".into(),
            format!("ws://geth:{GETH_WS_PORT}"),
            "-ethController".into(),
            chain
                .controller
                .clone()
                .unwrap_or_else(|| DEVENV_CONTROLLER.into()),
        ],
        ChainProfile::External => {
            let mut flags = vec![
                "-network".into(),
                chain.network.clone().unwrap_or_else(|| "mainnet".into()),
            ];
            if let Some(url) = &chain.eth_url {
                flags.extend(["-ethUrl".into(), url.clone()]);
            }
            if let Some(controller) = &chain.controller {
                flags.extend(["-ethController".into(), controller.clone()]);
            }
            flags
        }
    }
}

/// Assemble the final command line for `node`.
pub fn merge(
    node: &ServiceNode,
    relationship: Vec<String>,
    chain: Vec<String>,
    user_flags: &str,
) -> Vec<String> {
    let (user, dropped) = strip_binding_flags(&tokenize(user_flags));
    if !dropped.is_empty() {
        warn!(alias = %node.alias(), ?dropped, "ignoring user binding flags");
    }

    let mut flags = infra_flags(node);
    flags.extend(relationship);
    flags.extend(chain);
    flags.extend(user);
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeId, NodePorts};

    fn node(role: Role, index: usize, base: u16) -> ServiceNode {
        ServiceNode::new(
            NodeId {
                role,
                group: "g".into(),
                index,
            },
            index,
            NodePorts {
                cli: base,
                rtmp: base + 1,
                http: base + 2,
            },
            "img".into(),
        )
    }

    fn strs(v: &[String]) -> Vec<&str> {
        v.iter().map(String::as_str).collect()
    }

    #[test]
    fn binding_flags_are_dropped_with_their_values() {
        let tokens = tokenize("-v 6 -httpAddr 0.0.0.0:80 --cliAddr=:1 -monitor -rtmpAddr -x");
        let (kept, dropped) = strip_binding_flags(&tokens);

        assert_eq!(strs(&kept), vec!["-v", "6", "-monitor", "-x"]);
        assert_eq!(
            strs(&dropped),
            vec!["-httpAddr", "0.0.0.0:80", "--cliAddr=:1", "-rtmpAddr"]
        );
    }

    #[test]
    fn user_bindings_never_override_allocated_ports() {
        let orch = node(Role::Orchestrator, 0, 8000);
        let flags = merge(&orch, vec![], vec![], "-httpAddr 0.0.0.0:1 -v 99");

        let http = flags.iter().position(|f| f == "-httpAddr").unwrap();
        assert_eq!(flags[http + 1], "0.0.0.0:8002");
        assert_eq!(flags.iter().filter(|f| *f == "-httpAddr").count(), 1);
        assert_eq!(&flags[flags.len() - 2..], ["-v", "99"]);
    }

    #[test]
    fn orchestrator_service_addr_uses_alias() {
        let flags = infra_flags(&node(Role::Orchestrator, 1, 8000));
        let i = flags.iter().position(|f| f == "-serviceAddr").unwrap();
        assert_eq!(flags[i + 1], "orchestrator_1:8002");
    }

    #[test]
    fn transcoder_points_at_its_orchestrator() {
        let orch = node(Role::Orchestrator, 1, 9000);
        let t = node(Role::Transcoder, 3, 7000);
        let flags = relationship_flags(&t, &[&orch], "s3cret", false);
        assert_eq!(
            strs(&flags),
            vec!["-orchAddr", "orchestrator_1:9002", "-orchSecret", "s3cret"]
        );
    }

    #[test]
    fn lone_orchestrator_transcodes_itself() {
        let orch = node(Role::Orchestrator, 0, 9000);
        assert_eq!(strs(&relationship_flags(&orch, &[], "s", false)), vec!["-transcoder"]);
        assert_eq!(
            strs(&relationship_flags(&orch, &[], "s", true)),
            vec!["-orchSecret", "s"]
        );
    }

    #[test]
    fn streamer_targets_broadcaster_ports() {
        let b = node(Role::Broadcaster, 0, 5000);
        let s = node(Role::Streamer, 0, 6000);
        assert_eq!(
            strs(&relationship_flags(&s, &[&b], "s", false)),
            vec!["-host", "broadcaster_0", "-rtmp", "5001", "-media", "5002"]
        );
    }

    #[test]
    fn chain_profiles() {
        let mut chain = BlockchainConfig::default();
        assert_eq!(strs(&chain_flags(Role::Broadcaster, &chain)), vec!["-network", "offchain"]);

        chain.profile = ChainProfile::Devenv;
        let flags = chain_flags(Role::Orchestrator, &chain);
        assert!(flags.contains(&"ws://geth:8546".to_string()));
        assert!(flags.contains(&DEVENV_CONTROLLER.to_string()));

        assert!(chain_flags(Role::Streamer, &chain).is_empty());
    }
}
