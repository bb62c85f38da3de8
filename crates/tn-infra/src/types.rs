use std::fmt;

use serde::{Deserialize, Serialize};

/// Role of a machine inside the orchestration mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineRole {
    Manager,
    Worker,
}

impl MachineRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manager => "manager",
            Self::Worker => "worker",
        }
    }
}

impl fmt::Display for MachineRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Specification for creating a machine.
#[derive(Debug, Clone)]
pub struct MachineSpec {
    /// Deployment-scoped name, `<deployment>-manager` or `<deployment>-worker-<i>`.
    pub name: String,
    pub deployment: String,
    pub zone: String,
    pub machine_type: String,
    pub tags: Vec<String>,
    pub role: MachineRole,
}

/// Where a machine lives and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineAddress {
    pub name: String,
    pub zone: String,
    pub internal_ip: String,
    pub external_ip: Option<String>,
}

impl MachineAddress {
    /// Address used for remote execution from the control process.
    pub fn ssh_host(&self) -> &str {
        self.external_ip.as_deref().unwrap_or(&self.internal_ip)
    }
}

/// Lifecycle of a provisioned machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    Requested,
    Creating,
    Ready,
    Failed,
    Removed,
}

/// One provisioned (or to-be-provisioned) VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRecord {
    pub name: String,
    pub zone: String,
    pub internal_ip: Option<String>,
    pub external_ip: Option<String>,
    pub role: MachineRole,
    pub state: MachineState,
}

impl MachineRecord {
    pub fn requested(spec: &MachineSpec) -> Self {
        Self {
            name: spec.name.clone(),
            zone: spec.zone.clone(),
            internal_ip: None,
            external_ip: None,
            role: spec.role,
            state: MachineState::Requested,
        }
    }

    pub fn mark_creating(&mut self) {
        self.state = MachineState::Creating;
    }

    pub fn mark_ready(&mut self, address: &MachineAddress) {
        self.zone = address.zone.clone();
        self.internal_ip = Some(address.internal_ip.clone());
        self.external_ip = address.external_ip.clone();
        self.state = MachineState::Ready;
    }

    pub fn mark_failed(&mut self) {
        self.state = MachineState::Failed;
    }

    pub fn mark_removed(&mut self) {
        self.state = MachineState::Removed;
    }

    pub fn is_ready(&self) -> bool {
        self.state == MachineState::Ready
    }
}

/// Result of a remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}
