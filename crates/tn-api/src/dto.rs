use chrono::{DateTime, Utc};
use serde::Serialize;
use tn_infra::ProviderName;

use crate::driver::{DeploymentStatus, ExperimentHandle};

#[derive(Debug, Serialize)]
pub struct ExperimentAccepted {
    pub name: String,
    pub status: DeploymentStatus,
}

#[derive(Debug, Serialize)]
pub struct ExperimentSummary {
    pub name: String,
    pub status: DeploymentStatus,
    pub local: bool,
    pub provider: Option<ProviderName>,
    pub base_address: Option<String>,
    pub services: usize,
    pub machines: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ExperimentHandle> for ExperimentSummary {
    fn from(handle: ExperimentHandle) -> Self {
        Self {
            name: handle.name,
            status: handle.status,
            local: handle.local,
            provider: handle.provider,
            base_address: handle.base_address,
            services: handle.services.len(),
            machines: handle.machines.len(),
            created_at: handle.created_at,
            updated_at: handle.updated_at,
        }
    }
}
