//! Azure Container Instances request and response models.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::providers::traits::{
    ResourcePhase, ResourceSpec, ResourceStatus, ResourceTags, VolumeSpec,
};

/// API version for container groups.
pub const ACI_API_VERSION: &str = "2023-05-01";

/// API version for resource group deployments.
pub const DEPLOYMENT_API_VERSION: &str = "2021-04-01";

/// Tag carrying the owning scheduler instance.
pub const TAG_INSTANCE: &str = "agentInstance";
/// Tag carrying the configured cloud name.
pub const TAG_CLOUD: &str = "agentCloud";
/// Tag carrying the template name.
pub const TAG_TEMPLATE: &str = "agentTemplate";

/// Age after which a succeeded deployment record is removed.
pub const SUCCEEDED_DEPLOYMENT_RETENTION_MINUTES: i64 = 60;
/// Age after which a failed deployment record is removed.
pub const FAILED_DEPLOYMENT_RETENTION_MINUTES: i64 = 8 * 60;

const DEFAULT_CPU_CORES: f64 = 1.0;
const DEFAULT_MEMORY_GB: f64 = 1.5;

// ============================================================================
// Container group types
// ============================================================================

/// Container group as returned by ARM.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerGroup {
    /// Group name.
    pub name: String,
    /// Resource tags.
    #[serde(default)]
    pub tags: HashMap<String, String>,
    /// Group properties.
    #[serde(default)]
    pub properties: ContainerGroupProperties,
}

/// Container group properties.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerGroupProperties {
    /// Provisioning state.
    pub provisioning_state: Option<String>,
    /// Runtime view of the group.
    pub instance_view: Option<GroupInstanceView>,
    /// Public address.
    pub ip_address: Option<IpAddress>,
    /// Containers.
    #[serde(default)]
    pub containers: Vec<Container>,
}

/// Group runtime state.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupInstanceView {
    /// State such as `Pending`, `Running`, `Succeeded`, `Failed`.
    pub state: Option<String>,
}

/// Public IP address of a group.
#[derive(Debug, Clone, Deserialize)]
pub struct IpAddress {
    /// Address.
    pub ip: Option<String>,
}

/// Single container of a group.
#[derive(Debug, Clone, Deserialize)]
pub struct Container {
    /// Container name.
    pub name: String,
    /// Container properties.
    #[serde(default)]
    pub properties: ContainerProperties,
}

/// Container properties.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerProperties {
    /// Runtime view.
    pub instance_view: Option<ContainerInstanceView>,
}

/// Container runtime view.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInstanceView {
    /// Current state.
    pub current_state: Option<ContainerState>,
}

/// Container state.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    /// `Waiting`, `Running` or `Terminated`.
    pub state: Option<String>,
    /// Human readable detail.
    pub detail_status: Option<String>,
    /// Exit code once terminated.
    pub exit_code: Option<i32>,
}

/// Paged list of container groups.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerGroupListResponse {
    /// Groups.
    #[serde(default)]
    pub value: Vec<ContainerGroup>,
    /// Link to the next page.
    pub next_link: Option<String>,
}

/// Container logs.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerLogs {
    /// Log content.
    #[serde(default)]
    pub content: String,
}

fn owned_by(tags: &HashMap<String, String>, owner: &ResourceTags) -> bool {
    let tag_eq = |key: &str, expected: &str| {
        tags.get(key)
            .is_some_and(|v| v.eq_ignore_ascii_case(expected))
    };
    tag_eq(TAG_INSTANCE, &owner.instance) && tag_eq(TAG_CLOUD, &owner.cloud)
}

impl ContainerGroup {
    /// Whether the group is owned by `owner`.
    #[must_use]
    pub fn is_owned_by(&self, owner: &ResourceTags) -> bool {
        owned_by(&self.tags, owner)
    }

    /// Map the group onto the platform-neutral status.
    #[must_use]
    pub fn status(&self) -> ResourceStatus {
        let props = &self.properties;
        let address = props.ip_address.as_ref().and_then(|ip| ip.ip.clone());
        let group_state = props
            .instance_view
            .as_ref()
            .and_then(|v| v.state.as_deref());

        if props.provisioning_state.as_deref() == Some("Failed") {
            return ResourceStatus::new(ResourcePhase::Failed)
                .with_address(address)
                .with_detail("container group provisioning failed");
        }

        let terminated = props.containers.iter().find_map(|c| {
            let state = c
                .properties
                .instance_view
                .as_ref()
                .and_then(|v| v.current_state.as_ref())?;
            (state.state.as_deref() == Some("Terminated")).then(|| {
                format!(
                    "container {} terminated: {} (exit code {})",
                    c.name,
                    state.detail_status.as_deref().unwrap_or("no detail"),
                    state.exit_code.unwrap_or_default()
                )
            })
        });

        let phase = match group_state {
            None | Some("Pending" | "Waiting" | "Creating") => ResourcePhase::Pending,
            Some("Running") => ResourcePhase::Running,
            Some("Succeeded") => ResourcePhase::Succeeded,
            Some("Failed" | "Stopped") => ResourcePhase::Failed,
            Some(_) => ResourcePhase::Unknown,
        };

        match (phase, terminated) {
            (ResourcePhase::Succeeded, _) | (_, None) => {
                ResourceStatus::new(phase).with_address(address)
            }
            (_, Some(detail)) => ResourceStatus::new(ResourcePhase::Failed)
                .with_address(address)
                .with_detail(detail),
        }
    }
}

// ============================================================================
// Deployment types
// ============================================================================

/// Resource group deployment.
#[derive(Debug, Clone, Deserialize)]
pub struct Deployment {
    /// Deployment name.
    pub name: String,
    /// Deployment tags.
    #[serde(default)]
    pub tags: HashMap<String, String>,
    /// Deployment properties.
    pub properties: DeploymentProperties,
}

/// Deployment properties.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentProperties {
    /// `Accepted`, `Running`, `Succeeded`, `Failed`, ...
    pub provisioning_state: String,
    /// Last state change.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Error returned by a failed deployment.
    pub error: Option<DeploymentError>,
}

/// Paged list of deployments.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentListResponse {
    /// Deployments.
    #[serde(default)]
    pub value: Vec<Deployment>,
    /// Link to the next page.
    pub next_link: Option<String>,
}

/// Deployment error.
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentError {
    /// Message.
    #[serde(default)]
    pub message: String,
}

impl Deployment {
    /// Whether the deployment finished successfully.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.properties
            .provisioning_state
            .eq_ignore_ascii_case("succeeded")
    }

    /// Whether the deployment failed.
    #[must_use]
    pub fn failed(&self) -> bool {
        self.properties
            .provisioning_state
            .eq_ignore_ascii_case("failed")
    }

    /// Whether the deployment is owned by `owner`.
    #[must_use]
    pub fn is_owned_by(&self, owner: &ResourceTags) -> bool {
        owned_by(&self.tags, owner)
    }

    /// Whether the record has finished and is old enough to remove at `now`.
    /// Unfinished deployments never expire.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let retention = if self.succeeded() {
            SUCCEEDED_DEPLOYMENT_RETENTION_MINUTES
        } else if self.failed() {
            FAILED_DEPLOYMENT_RETENTION_MINUTES
        } else {
            return false;
        };
        self.properties
            .timestamp
            .is_some_and(|at| now.signed_duration_since(at).num_minutes() >= retention)
    }
}

// ============================================================================
// Template construction
// ============================================================================

/// Parse a CPU quantity (`1`, `0.5`, `500m`) into cores.
fn parse_cpu(value: Option<&str>) -> f64 {
    value
        .and_then(|v| match v.strip_suffix('m') {
            Some(milli) => milli.parse::<f64>().ok().map(|m| m / 1000.0),
            None => v.parse().ok(),
        })
        .unwrap_or(DEFAULT_CPU_CORES)
}

/// Parse a memory quantity (`1.5`, `2G`, `2Gi`) into gigabytes.
fn parse_memory_gb(value: Option<&str>) -> f64 {
    value
        .and_then(|v| {
            v.trim_end_matches("Gi")
                .trim_end_matches("GB")
                .trim_end_matches('G')
                .parse()
                .ok()
        })
        .unwrap_or(DEFAULT_MEMORY_GB)
}

fn volume_json(index: usize, volume: &VolumeSpec) -> Option<(Value, Value)> {
    let name = format!("volume-{index}");
    let source = match volume {
        VolumeSpec::EmptyDir { .. } => json!({ "name": name, "emptyDir": {} }),
        VolumeSpec::AzureFile {
            share_name,
            storage_account_name,
            storage_account_key,
            read_only,
            ..
        } => json!({
            "name": name,
            "azureFile": {
                "shareName": share_name,
                "storageAccountName": storage_account_name.clone().unwrap_or_default(),
                "storageAccountKey": storage_account_key.clone().unwrap_or_default(),
                "readOnly": read_only
            }
        }),
        VolumeSpec::HostPath { .. }
        | VolumeSpec::Secret { .. }
        | VolumeSpec::PersistentVolumeClaim { .. } => return None,
    };
    let mount = json!({
        "name": name,
        "mountPath": volume.mount_path(),
        "readOnly": volume.read_only()
    });
    Some((source, mount))
}

/// Ownership tags of a resource.
#[must_use]
pub fn owner_tags(spec: &ResourceSpec) -> Map<String, Value> {
    let mut tags = Map::new();
    if let Some(owner) = &spec.tags {
        tags.insert(TAG_INSTANCE.to_string(), json!(owner.instance));
        tags.insert(TAG_CLOUD.to_string(), json!(owner.cloud));
        if let Some(template) = &owner.template {
            tags.insert(TAG_TEMPLATE.to_string(), json!(template));
        }
    }
    tags
}

/// Build the ARM template deploying one container group.
#[must_use]
pub fn build_template(spec: &ResourceSpec, location: &str) -> Value {
    let tags = owner_tags(spec);

    let env: Vec<Value> = spec
        .env
        .iter()
        .map(|e| json!({ "name": e.name, "value": e.value }))
        .collect();

    let command: Vec<&String> = spec.command.iter().chain(spec.args.iter()).collect();

    let (volumes, mounts): (Vec<Value>, Vec<Value>) = spec
        .volumes
        .iter()
        .enumerate()
        .filter_map(|(i, v)| volume_json(i, v))
        .unzip();

    let ports: Vec<Value> = spec.ports.iter().map(|p| json!({ "port": p })).collect();

    let mut container_props = json!({
        "image": spec.image,
        "environmentVariables": env,
        "ports": ports,
        "volumeMounts": mounts,
        "resources": {
            "requests": {
                "cpu": parse_cpu(spec.cpu_request.as_deref()),
                "memoryInGB": parse_memory_gb(spec.memory_request.as_deref())
            }
        }
    });
    if !command.is_empty() {
        container_props["command"] = json!(command);
    }

    let mut group_props = json!({
        "containers": [{ "name": spec.name, "properties": container_props }],
        "osType": spec.os_type.clone().unwrap_or_else(|| "Linux".to_string()),
        "restartPolicy": "Never",
        "volumes": volumes,
        "imageRegistryCredentials": spec.registry_credentials.iter().map(|c| json!({
            "server": c.server,
            "username": c.username,
            "password": c.password
        })).collect::<Vec<_>>()
    });
    if !spec.ports.is_empty() {
        group_props["ipAddress"] = json!({
            "type": "Public",
            "ports": spec.ports.iter().map(|p| json!({ "protocol": "TCP", "port": p })).collect::<Vec<_>>()
        });
    }

    json!({
        "$schema": "https://schema.management.azure.com/schemas/2015-01-01/deploymentTemplate.json#",
        "contentVersion": "1.0.0.0",
        "parameters": {},
        "resources": [{
            "type": "Microsoft.ContainerInstance/containerGroups",
            "apiVersion": ACI_API_VERSION,
            "name": spec.name,
            "location": location,
            "tags": tags,
            "properties": group_props
        }]
    })
}

/// Wrap a template into an incremental deployment request body. The
/// deployment record carries the same ownership tags as its group.
#[must_use]
pub fn deployment_request(spec: &ResourceSpec, location: &str) -> Value {
    json!({
        "tags": owner_tags(spec),
        "properties": {
            "mode": "Incremental",
            "template": build_template(spec, location),
            "parameters": {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::traits::EnvVar;

    #[test]
    fn test_parse_quantities() {
        assert!((parse_cpu(Some("500m")) - 0.5).abs() < f64::EPSILON);
        assert!((parse_cpu(Some("2")) - 2.0).abs() < f64::EPSILON);
        assert!((parse_cpu(None) - DEFAULT_CPU_CORES).abs() < f64::EPSILON);
        assert!((parse_memory_gb(Some("2Gi")) - 2.0).abs() < f64::EPSILON);
        assert!((parse_memory_gb(Some("bogus")) - DEFAULT_MEMORY_GB).abs() < f64::EPSILON);
    }

    #[test]
    fn test_template_carries_tags_and_command() {
        let spec = ResourceSpec {
            name: "aci-agent-x7k2q".to_string(),
            image: "agent/inbound".to_string(),
            command: vec!["run".to_string()],
            args: vec!["--url".to_string(), "http://ci".to_string()],
            env: vec![EnvVar::new("IP", "")],
            ports: vec![22],
            tags: Some(ResourceTags {
                instance: "inst-1".to_string(),
                cloud: "aci".to_string(),
                template: Some("linux".to_string()),
            }),
            ..ResourceSpec::default()
        };
        let template = build_template(&spec, "eastus");
        let group = &template["resources"][0];
        assert_eq!(group["tags"][TAG_INSTANCE], "inst-1");
        assert_eq!(group["tags"][TAG_TEMPLATE], "linux");
        let container = &group["properties"]["containers"][0]["properties"];
        assert_eq!(container["command"], json!(["run", "--url", "http://ci"]));
        assert_eq!(group["properties"]["ipAddress"]["ports"][0]["port"], 22);
    }

    #[test]
    fn test_group_status_mapping() {
        let group: ContainerGroup = serde_json::from_value(json!({
            "name": "g",
            "properties": {
                "instanceView": { "state": "Running" },
                "ipAddress": { "ip": "20.1.1.1" },
                "containers": [{ "name": "g", "properties": {
                    "instanceView": { "currentState": { "state": "Running" } }
                }}]
            }
        }))
        .unwrap();
        let status = group.status();
        assert_eq!(status.phase, ResourcePhase::Running);
        assert_eq!(status.address.as_deref(), Some("20.1.1.1"));
    }

    #[test]
    fn test_group_with_terminated_container_is_failed() {
        let group: ContainerGroup = serde_json::from_value(json!({
            "name": "g",
            "properties": {
                "instanceView": { "state": "Running" },
                "containers": [{ "name": "g", "properties": {
                    "instanceView": { "currentState": {
                        "state": "Terminated", "detailStatus": "Error", "exitCode": 137
                    } }
                }}]
            }
        }))
        .unwrap();
        let status = group.status();
        assert_eq!(status.phase, ResourcePhase::Failed);
        assert!(status.detail.unwrap().contains("137"));
    }

    #[test]
    fn test_deployment_request_is_tagged() {
        let spec = ResourceSpec {
            name: "g".to_string(),
            tags: Some(ResourceTags::owner("inst-1", "aci")),
            ..ResourceSpec::default()
        };
        let body = deployment_request(&spec, "eastus");
        assert_eq!(body["tags"][TAG_INSTANCE], "inst-1");
        assert_eq!(body["properties"]["template"]["resources"][0]["name"], "g");
    }

    fn deployment(state: &str, age_minutes: i64, now: DateTime<Utc>) -> Deployment {
        serde_json::from_value(json!({
            "name": "d",
            "properties": {
                "provisioningState": state,
                "timestamp": (now - chrono::Duration::minutes(age_minutes)).to_rfc3339()
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_deployment_expiry() {
        let now = Utc::now();
        assert!(!deployment("Succeeded", 59, now).is_expired(now));
        assert!(deployment("Succeeded", 61, now).is_expired(now));
        assert!(!deployment("Failed", 61, now).is_expired(now));
        assert!(deployment("Failed", 8 * 60 + 1, now).is_expired(now));
        assert!(!deployment("Running", 10_000, now).is_expired(now));
    }

    #[test]
    fn test_ownership_is_case_insensitive() {
        let group: ContainerGroup = serde_json::from_value(json!({
            "name": "g",
            "tags": { TAG_INSTANCE: "INST-1", TAG_CLOUD: "aci" }
        }))
        .unwrap();
        assert!(group.is_owned_by(&ResourceTags::owner("inst-1", "aci")));
        assert!(!group.is_owned_by(&ResourceTags::owner("inst-2", "aci")));
    }
}
