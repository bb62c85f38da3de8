use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Instance insert ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertInstanceRequest {
    pub name: String,
    /// Partial URL, e.g. `zones/us-east1-b/machineTypes/n1-standard-2`.
    pub machine_type: String,
    pub disks: Vec<AttachedDisk>,
    pub network_interfaces: Vec<NetworkInterfaceConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Tags>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDisk {
    pub boot: bool,
    pub auto_delete: bool,
    pub initialize_params: InitializeParams,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub source_image: String,
    /// int64 values are strings on the wire.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_size_gb: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterfaceConfig {
    pub network: String,
    pub access_configs: Vec<AccessConfigRequest>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccessConfigRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl AccessConfigRequest {
    /// Ephemeral external address.
    pub fn external_nat() -> Self {
        Self {
            name: "External NAT".into(),
            kind: "ONE_TO_ONE_NAT".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Tags {
    pub items: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Metadata {
    pub items: Vec<MetadataItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetadataItem {
    pub key: String,
    pub value: String,
}

// ── Instance read ────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub name: String,
    /// Full zone URL.
    pub zone: String,
    pub status: String,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Instance {
    /// Short zone name, e.g. `us-east1-b`.
    pub fn zone_name(&self) -> &str {
        self.zone.rsplit('/').next().unwrap_or(&self.zone)
    }

    pub fn internal_ip(&self) -> Option<&str> {
        self.network_interfaces
            .first()
            .and_then(|nic| nic.network_ip.as_deref())
    }

    pub fn external_ip(&self) -> Option<&str> {
        self.network_interfaces
            .iter()
            .flat_map(|nic| nic.access_configs.iter())
            .find_map(|ac| ac.nat_ip.as_deref())
    }

    pub fn is_running(&self) -> bool {
        self.status == "RUNNING"
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    #[serde(rename = "networkIP")]
    pub network_ip: Option<String>,
    #[serde(default)]
    pub access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessConfig {
    #[serde(rename = "natIP")]
    pub nat_ip: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedInstanceList {
    #[serde(default)]
    pub items: HashMap<String, InstancesScopedList>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstancesScopedList {
    #[serde(default)]
    pub instances: Vec<Instance>,
}

// ── Operations ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub name: String,
    pub status: String,
    pub error: Option<OperationError>,
    pub http_error_status_code: Option<u16>,
}

impl Operation {
    pub fn is_done(&self) -> bool {
        self.status == "DONE"
    }

    /// First error message reported by a finished operation, if any.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| {
            e.errors
                .iter()
                .map(|item| format!("{}: {}", item.code, item.message))
                .collect::<Vec<_>>()
                .join("; ")
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationError {
    #[serde(default)]
    pub errors: Vec<OperationErrorItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationErrorItem {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_addresses_from_wire_json() {
        let json = r#"{
            "name": "exp-worker-0",
            "zone": "https://www.googleapis.com/compute/v1/projects/p/zones/us-east1-b",
            "status": "RUNNING",
            "networkInterfaces": [{
                "networkIP": "10.142.0.7",
                "accessConfigs": [{ "natIP": "35.1.2.3" }]
            }]
        }"#;

        let instance: Instance = serde_json::from_str(json).unwrap();
        assert_eq!(instance.zone_name(), "us-east1-b");
        assert_eq!(instance.internal_ip(), Some("10.142.0.7"));
        assert_eq!(instance.external_ip(), Some("35.1.2.3"));
        assert!(instance.is_running());
    }

    #[test]
    fn operation_error_joins_items() {
        let json = r#"{
            "name": "op-1",
            "status": "DONE",
            "error": { "errors": [
                { "code": "QUOTA_EXCEEDED", "message": "CPUS quota" },
                { "code": "ZONE_RESOURCE_POOL_EXHAUSTED", "message": "no capacity" }
            ]}
        }"#;

        let op: Operation = serde_json::from_str(json).unwrap();
        assert!(op.is_done());
        assert_eq!(
            op.error_message().as_deref(),
            Some("QUOTA_EXCEEDED: CPUS quota; ZONE_RESOURCE_POOL_EXHAUSTED: no capacity")
        );
    }

    #[test]
    fn insert_request_uses_wire_names() {
        let req = InsertInstanceRequest {
            name: "exp-manager".into(),
            machine_type: "zones/us-east1-b/machineTypes/n1-standard-2".into(),
            disks: vec![],
            network_interfaces: vec![NetworkInterfaceConfig {
                network: "global/networks/default".into(),
                access_configs: vec![AccessConfigRequest::external_nat()],
            }],
            tags: None,
            labels: HashMap::new(),
            metadata: None,
        };

        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["machineType"], "zones/us-east1-b/machineTypes/n1-standard-2");
        assert_eq!(
            value["networkInterfaces"][0]["accessConfigs"][0]["type"],
            "ONE_TO_ONE_NAT"
        );
        assert!(value.get("labels").is_none());
    }
}
