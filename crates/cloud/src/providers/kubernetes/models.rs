//! Pod and secret manifests.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use k8s_openapi::api::core::v1::{Pod, Secret};
use serde_json::{json, Value};

use crate::providers::traits::{
    RegistryCredential, RemoteError, ResourcePhase, ResourceSpec, ResourceStatus, ResourceTags,
    VolumeSpec,
};

/// Label key marking agent pods.
pub const LABEL_APP: &str = "app";
/// Value of [`LABEL_APP`] on every agent pod.
pub const AGENT_APP: &str = "container-agent";
/// Label carrying the owning scheduler instance.
pub const LABEL_INSTANCE: &str = "agent-instance";
/// Label carrying the configured cloud name.
pub const LABEL_CLOUD: &str = "agent-cloud";
/// Label carrying the template name.
pub const LABEL_TEMPLATE: &str = "agent-template";

/// Waiting reasons that will never resolve on their own.
const FATAL_WAITING_REASONS: &[&str] = &["ImagePullBackOff", "ErrImagePull", "InvalidImageName"];

/// Maximum length of a Kubernetes label value.
const MAX_LABEL_VALUE_LENGTH: usize = 63;

/// Make an arbitrary string usable as a label value.
#[must_use]
pub fn sanitize_label_value(input: &str) -> String {
    let mut sanitized = input.to_lowercase().replace([' ', '_'], "-");
    sanitized.retain(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');

    let trimmed = sanitized.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    let mut value = trimmed.to_string();
    if value.len() > MAX_LABEL_VALUE_LENGTH {
        value.truncate(MAX_LABEL_VALUE_LENGTH);
        let end = value.trim_end_matches(|c: char| !c.is_ascii_alphanumeric()).len();
        value.truncate(end);
    }
    value
}

/// Labels identifying a pod's owner.
fn owner_labels(tags: &ResourceTags) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_APP.to_string(), AGENT_APP.to_string());
    labels.insert(
        LABEL_INSTANCE.to_string(),
        sanitize_label_value(&tags.instance),
    );
    labels.insert(LABEL_CLOUD.to_string(), sanitize_label_value(&tags.cloud));
    if let Some(template) = &tags.template {
        labels.insert(LABEL_TEMPLATE.to_string(), sanitize_label_value(template));
    }
    labels
}

/// Label selector matching every agent pod owned by `owner`.
#[must_use]
pub fn owner_selector(owner: &ResourceTags) -> String {
    format!(
        "{LABEL_APP}={AGENT_APP},{LABEL_INSTANCE}={},{LABEL_CLOUD}={}",
        sanitize_label_value(&owner.instance),
        sanitize_label_value(&owner.cloud)
    )
}

/// Name of the pull secret shared by all pods of one cloud/template pair.
#[must_use]
pub fn registry_secret_name(spec: &ResourceSpec) -> String {
    match &spec.tags {
        Some(ResourceTags {
            cloud,
            template: Some(template),
            ..
        }) => sanitize_label_value(&format!("{cloud}-{template}")),
        _ => sanitize_label_value(&format!("{}-registry", spec.name)),
    }
}

/// Build a `kubernetes.io/dockerconfigjson` secret for the given logins.
///
/// # Errors
/// Returns error if the manifest does not deserialize into a `Secret`.
pub fn build_registry_secret(
    name: &str,
    namespace: &str,
    credentials: &[RegistryCredential],
) -> Result<Secret, RemoteError> {
    let auths: serde_json::Map<String, Value> = credentials
        .iter()
        .map(|c| {
            let auth = STANDARD.encode(format!("{}:{}", c.username, c.password));
            (
                c.server.clone(),
                json!({ "username": c.username, "password": c.password, "auth": auth }),
            )
        })
        .collect();
    let docker_config = json!({ "auths": auths }).to_string();

    let secret = json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": { LABEL_APP: AGENT_APP }
        },
        "type": "kubernetes.io/dockerconfigjson",
        "data": { ".dockerconfigjson": STANDARD.encode(docker_config) }
    });

    Ok(serde_json::from_value(secret)?)
}

fn volume_json(index: usize, volume: &VolumeSpec) -> (Value, Value) {
    let name = format!("volume-{index}");
    let source = match volume {
        VolumeSpec::EmptyDir { .. } => json!({ "name": name, "emptyDir": {} }),
        VolumeSpec::HostPath { host_path, .. } => {
            json!({ "name": name, "hostPath": { "path": host_path } })
        }
        VolumeSpec::Secret { secret_name, .. } => {
            json!({ "name": name, "secret": { "secretName": secret_name } })
        }
        VolumeSpec::PersistentVolumeClaim {
            claim_name,
            read_only,
            ..
        } => json!({
            "name": name,
            "persistentVolumeClaim": { "claimName": claim_name, "readOnly": read_only }
        }),
        VolumeSpec::AzureFile {
            share_name,
            secret_name,
            read_only,
            ..
        } => json!({
            "name": name,
            "azureFile": {
                "shareName": share_name,
                "secretName": secret_name.clone().unwrap_or_default(),
                "readOnly": read_only
            }
        }),
    };
    let mount = json!({
        "name": name,
        "mountPath": volume.mount_path(),
        "readOnly": volume.read_only()
    });
    (source, mount)
}

/// Build the agent pod for `spec`.
///
/// # Errors
/// Returns error if the manifest does not deserialize into a `Pod`.
pub fn build_pod(spec: &ResourceSpec, namespace: &str) -> Result<Pod, RemoteError> {
    let labels = spec.tags.as_ref().map_or_else(
        || BTreeMap::from([(LABEL_APP.to_string(), AGENT_APP.to_string())]),
        owner_labels,
    );

    let env: Vec<Value> = spec
        .env
        .iter()
        .map(|e| json!({ "name": e.name, "value": e.value }))
        .collect();

    let mut requests = serde_json::Map::new();
    if let Some(cpu) = &spec.cpu_request {
        requests.insert("cpu".to_string(), json!(cpu));
    }
    if let Some(memory) = &spec.memory_request {
        requests.insert("memory".to_string(), json!(memory));
    }
    let mut limits = serde_json::Map::new();
    if let Some(cpu) = &spec.cpu_limit {
        limits.insert("cpu".to_string(), json!(cpu));
    }
    if let Some(memory) = &spec.memory_limit {
        limits.insert("memory".to_string(), json!(memory));
    }

    let (volumes, mounts): (Vec<Value>, Vec<Value>) = spec
        .volumes
        .iter()
        .enumerate()
        .map(|(i, v)| volume_json(i, v))
        .unzip();

    let mut pull_secrets: Vec<Value> = spec
        .image_pull_secrets
        .iter()
        .map(|name| json!({ "name": name }))
        .collect();
    if !spec.registry_credentials.is_empty() {
        pull_secrets.push(json!({ "name": registry_secret_name(spec) }));
    }

    let ports: Vec<Value> = spec
        .ports
        .iter()
        .map(|p| json!({ "containerPort": p }))
        .collect();

    let mut container = json!({
        "name": spec.name,
        "image": spec.image,
        "env": env,
        "resources": { "requests": requests, "limits": limits },
        "volumeMounts": mounts,
        "ports": ports,
        "securityContext": { "privileged": spec.privileged }
    });
    if !spec.command.is_empty() {
        container["command"] = json!(spec.command);
    }
    if !spec.args.is_empty() {
        container["args"] = json!(spec.args);
    }
    if let Some(dir) = &spec.working_dir {
        container["workingDir"] = json!(dir);
    }

    let mut pod_spec = json!({
        "restartPolicy": "Never",
        "containers": [container],
        "volumes": volumes,
        "imagePullSecrets": pull_secrets
    });
    if let Some(node) = &spec.node_name {
        pod_spec["nodeName"] = json!(node);
    }
    if let Some(os) = &spec.os_type {
        pod_spec["nodeSelector"] = json!({ "kubernetes.io/os": os.to_lowercase() });
    }

    let pod = json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": spec.name,
            "namespace": namespace,
            "labels": labels
        },
        "spec": pod_spec
    });

    Ok(serde_json::from_value(pod)?)
}

/// Map a pod onto the platform-neutral status.
///
/// A pending pod whose container already terminated, or is stuck pulling its
/// image, is reported as failed right away.
#[must_use]
pub fn pod_status(pod: &Pod) -> ResourceStatus {
    let Some(status) = pod.status.as_ref() else {
        return ResourceStatus::new(ResourcePhase::Pending);
    };
    let address = status.pod_ip.clone();

    let phase = match status.phase.as_deref() {
        Some("Pending") | None => ResourcePhase::Pending,
        Some("Running") => ResourcePhase::Running,
        Some("Succeeded") => ResourcePhase::Succeeded,
        Some("Failed") => ResourcePhase::Failed,
        Some(_) => ResourcePhase::Unknown,
    };

    if phase == ResourcePhase::Pending {
        for container in status.container_statuses.iter().flatten() {
            let Some(state) = &container.state else {
                continue;
            };
            if let Some(terminated) = &state.terminated {
                let reason = terminated
                    .message
                    .clone()
                    .or_else(|| terminated.reason.clone())
                    .unwrap_or_else(|| format!("exit code {}", terminated.exit_code));
                return ResourceStatus::new(ResourcePhase::Failed)
                    .with_address(address)
                    .with_detail(format!("container {} terminated: {reason}", container.name));
            }
            if let Some(waiting) = &state.waiting {
                if let Some(reason) = waiting.reason.as_deref() {
                    if FATAL_WAITING_REASONS.contains(&reason) {
                        let message = waiting.message.clone().unwrap_or_default();
                        return ResourceStatus::new(ResourcePhase::Failed)
                            .with_address(address)
                            .with_detail(format!(
                                "container {} waiting: {reason} {message}",
                                container.name
                            ));
                    }
                }
            }
        }
    }

    let mut result = ResourceStatus::new(phase).with_address(address);
    if let Some(message) = status.message.clone().or_else(|| status.reason.clone()) {
        result = result.with_detail(message);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::traits::EnvVar;

    fn spec() -> ResourceSpec {
        ResourceSpec {
            name: "maven-x7k2q".to_string(),
            image: "agent/inbound:latest".to_string(),
            command: vec!["sh".to_string(), "-c".to_string()],
            args: vec!["run-agent".to_string()],
            env: vec![EnvVar::new("AGENT_NAME", "maven-x7k2q")],
            cpu_request: Some("500m".to_string()),
            memory_limit: Some("1Gi".to_string()),
            tags: Some(ResourceTags {
                instance: "Instance_01".to_string(),
                cloud: "k8s".to_string(),
                template: Some("maven".to_string()),
            }),
            ..ResourceSpec::default()
        }
    }

    #[test]
    fn test_sanitize_label_value() {
        assert_eq!(sanitize_label_value("My Template_1"), "my-template-1");
        assert_eq!(sanitize_label_value("--abc--"), "abc");
        assert_eq!(sanitize_label_value(&"a".repeat(80)).len(), 63);
    }

    #[test]
    fn test_build_pod_labels_and_container() {
        let pod = build_pod(&spec(), "agents").unwrap();
        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels[LABEL_APP], AGENT_APP);
        assert_eq!(labels[LABEL_INSTANCE], "instance-01");
        assert_eq!(labels[LABEL_TEMPLATE], "maven");

        let pod_spec = pod.spec.unwrap();
        assert_eq!(pod_spec.restart_policy.as_deref(), Some("Never"));
        let container = &pod_spec.containers[0];
        assert_eq!(container.command.as_ref().unwrap()[0], "sh");
        assert_eq!(container.args.as_ref().unwrap()[0], "run-agent");
        assert_eq!(container.env.as_ref().unwrap()[0].name, "AGENT_NAME");
    }

    #[test]
    fn test_build_pod_adds_registry_secret() {
        let mut spec = spec();
        spec.registry_credentials.push(RegistryCredential {
            server: "registry.example.com".to_string(),
            username: "bot".to_string(),
            password: "hunter2".to_string(),
        });
        let pod = build_pod(&spec, "agents").unwrap();
        let secrets = pod.spec.unwrap().image_pull_secrets.unwrap();
        assert_eq!(secrets[0].name, "k8s-maven");
    }

    #[test]
    fn test_registry_secret_payload() {
        let creds = [RegistryCredential {
            server: "registry.example.com".to_string(),
            username: "bot".to_string(),
            password: "pw".to_string(),
        }];
        let secret = build_registry_secret("k8s-maven", "agents", &creds).unwrap();
        assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/dockerconfigjson"));
        let data = secret.data.unwrap();
        let raw = &data[".dockerconfigjson"].0;
        let config: Value = serde_json::from_slice(raw).unwrap();
        assert_eq!(
            config["auths"]["registry.example.com"]["auth"],
            STANDARD.encode("bot:pw")
        );
    }

    fn pod_from(status: Value) -> Pod {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "p" },
            "status": status
        }))
        .unwrap()
    }

    #[test]
    fn test_pod_status_running_with_ip() {
        let status = pod_status(&pod_from(json!({ "phase": "Running", "podIP": "10.1.2.3" })));
        assert_eq!(status.phase, ResourcePhase::Running);
        assert_eq!(status.address.as_deref(), Some("10.1.2.3"));
    }

    #[test]
    fn test_pod_status_image_pull_backoff_fails_fast() {
        let status = pod_status(&pod_from(json!({
            "phase": "Pending",
            "containerStatuses": [{
                "name": "agent", "image": "x", "imageID": "", "ready": false, "restartCount": 0,
                "state": { "waiting": { "reason": "ImagePullBackOff" } }
            }]
        })));
        assert_eq!(status.phase, ResourcePhase::Failed);
        assert!(status.detail.unwrap().contains("ImagePullBackOff"));
    }

    #[test]
    fn test_pod_status_pending_container_terminated() {
        let status = pod_status(&pod_from(json!({
            "phase": "Pending",
            "containerStatuses": [{
                "name": "agent", "image": "x", "imageID": "", "ready": false, "restartCount": 0,
                "state": { "terminated": { "exitCode": 1, "reason": "Error" } }
            }]
        })));
        assert_eq!(status.phase, ResourcePhase::Failed);
    }

    #[test]
    fn test_pod_status_plain_pending() {
        let status = pod_status(&pod_from(json!({
            "phase": "Pending",
            "containerStatuses": [{
                "name": "agent", "image": "x", "imageID": "", "ready": false, "restartCount": 0,
                "state": { "waiting": { "reason": "ContainerCreating" } }
            }]
        })));
        assert_eq!(status.phase, ResourcePhase::Pending);
    }
}
