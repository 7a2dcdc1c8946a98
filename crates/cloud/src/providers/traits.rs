//! Remote resource trait and common types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while talking to a remote platform.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Kubernetes client error.
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Authentication error.
    #[error("Authentication error: {0}")]
    Auth(String),
}

impl RemoteError {
    /// Whether the failure is a transport-level hiccup worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Kube(e) => matches!(e, kube::Error::HyperError(_) | kube::Error::Service(_)),
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

// ============================================================================
// Resource description
// ============================================================================

/// A single environment variable passed to the agent container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    /// Variable name.
    pub name: String,
    /// Variable value.
    pub value: String,
}

impl EnvVar {
    /// Create a new environment variable.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Resolved container registry login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryCredential {
    /// Registry host, e.g. `myregistry.azurecr.io`.
    pub server: String,
    /// Login name.
    pub username: String,
    /// Password or token.
    pub password: String,
}

/// Volume mounted into the agent container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VolumeSpec {
    /// Scratch directory living as long as the resource.
    #[serde(rename_all = "camelCase")]
    EmptyDir { mount_path: String },
    /// Directory on the hosting node.
    #[serde(rename_all = "camelCase")]
    HostPath {
        host_path: String,
        mount_path: String,
    },
    /// Kubernetes secret projected as files.
    #[serde(rename_all = "camelCase")]
    Secret {
        secret_name: String,
        mount_path: String,
    },
    /// Existing persistent volume claim.
    #[serde(rename_all = "camelCase")]
    PersistentVolumeClaim {
        claim_name: String,
        mount_path: String,
        #[serde(default)]
        read_only: bool,
    },
    /// Azure file share.
    ///
    /// Kubernetes reads the storage key from `secret_name`; ACI takes the
    /// account name and key inline.
    #[serde(rename_all = "camelCase")]
    AzureFile {
        share_name: String,
        mount_path: String,
        #[serde(default)]
        secret_name: Option<String>,
        #[serde(default)]
        storage_account_name: Option<String>,
        #[serde(default)]
        storage_account_key: Option<String>,
        #[serde(default)]
        read_only: bool,
    },
}

impl VolumeSpec {
    /// Path the volume is mounted at inside the container.
    #[must_use]
    pub fn mount_path(&self) -> &str {
        match self {
            Self::EmptyDir { mount_path }
            | Self::HostPath { mount_path, .. }
            | Self::Secret { mount_path, .. }
            | Self::PersistentVolumeClaim { mount_path, .. }
            | Self::AzureFile { mount_path, .. } => mount_path,
        }
    }

    /// Whether the mount is read-only.
    #[must_use]
    pub fn read_only(&self) -> bool {
        match self {
            Self::PersistentVolumeClaim { read_only, .. } | Self::AzureFile { read_only, .. } => {
                *read_only
            }
            Self::Secret { .. } => true,
            Self::EmptyDir { .. } | Self::HostPath { .. } => false,
        }
    }
}

/// Ownership markers attached to every resource this process creates.
///
/// Reclamation lists resources by `instance` and `cloud`, so both must be
/// stable across restarts of the same deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTags {
    /// Identity of the owning scheduler instance.
    pub instance: String,
    /// Name of the configured cloud.
    pub cloud: String,
    /// Template the resource was created from, when known.
    pub template: Option<String>,
}

impl ResourceTags {
    /// Tags used when listing: only instance and cloud are significant.
    pub fn owner(instance: impl Into<String>, cloud: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            cloud: cloud.into(),
            template: None,
        }
    }
}

/// Platform-neutral description of one agent container.
#[derive(Debug, Clone, Default)]
pub struct ResourceSpec {
    /// Unique resource name (also the agent name).
    pub name: String,
    /// Container image.
    pub image: String,
    /// Entrypoint override. Empty keeps the image default.
    pub command: Vec<String>,
    /// Arguments to the entrypoint.
    pub args: Vec<String>,
    /// Environment variables.
    pub env: Vec<EnvVar>,
    /// CPU request, e.g. `500m` or `1`.
    pub cpu_request: Option<String>,
    /// CPU limit.
    pub cpu_limit: Option<String>,
    /// Memory request, e.g. `512Mi` (Kubernetes) or `1.5` GB (ACI).
    pub memory_request: Option<String>,
    /// Memory limit.
    pub memory_limit: Option<String>,
    /// Ports to expose.
    pub ports: Vec<u16>,
    /// Operating system of the container, `Linux` when absent.
    pub os_type: Option<String>,
    /// Working directory inside the container.
    pub working_dir: Option<String>,
    /// Run the container privileged.
    pub privileged: bool,
    /// Pin the resource to a node.
    pub node_name: Option<String>,
    /// Names of pre-existing image pull secrets.
    pub image_pull_secrets: Vec<String>,
    /// Registry logins resolved from the credential store.
    pub registry_credentials: Vec<RegistryCredential>,
    /// Volumes to mount.
    pub volumes: Vec<VolumeSpec>,
    /// Name of the deployment record for platforms that keep one.
    pub deployment: Option<String>,
    /// Ownership tags.
    pub tags: Option<ResourceTags>,
}

// ============================================================================
// Resource status
// ============================================================================

/// Coarse lifecycle phase of a remote resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourcePhase {
    /// Accepted but not yet running.
    Pending,
    /// Container is running.
    Running,
    /// Container exited successfully.
    Succeeded,
    /// Container failed or cannot start.
    Failed,
    /// Platform reported something we do not recognize.
    Unknown,
}

impl std::fmt::Display for ResourcePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Observed state of a remote resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceStatus {
    /// Current phase.
    pub phase: ResourcePhase,
    /// Network address reachable by the scheduler, once assigned.
    pub address: Option<String>,
    /// Platform-provided explanation, mostly for failures.
    pub detail: Option<String>,
}

impl ResourceStatus {
    /// Status with only a phase.
    #[must_use]
    pub fn new(phase: ResourcePhase) -> Self {
        Self {
            phase,
            address: None,
            detail: None,
        }
    }

    /// Attach an address.
    #[must_use]
    pub fn with_address(mut self, address: Option<String>) -> Self {
        self.address = address;
        self
    }

    /// Attach a detail message.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

// ============================================================================
// Client trait
// ============================================================================

/// A remote platform that can host agent containers.
///
/// Implementations must be safe to share between concurrently running
/// provisioning tasks.
#[async_trait]
pub trait RemoteResourceClient: Send + Sync {
    /// Platform name for logs.
    fn platform(&self) -> &'static str;

    /// Submit a creation request and return the resource id.
    ///
    /// Returns as soon as the platform accepted the request; the resource
    /// may still be starting.
    async fn create(&self, spec: &ResourceSpec) -> Result<String, RemoteError>;

    /// Current status, or `None` when the resource does not exist.
    async fn get(&self, id: &str) -> Result<Option<ResourceStatus>, RemoteError>;

    /// Delete a resource. Returns `false` when it was already gone.
    async fn delete(&self, id: &str) -> Result<bool, RemoteError>;

    /// Names of all resources carrying the given owner tags.
    async fn list(&self, owner: &ResourceTags) -> Result<Vec<String>, RemoteError>;

    /// Recent container output for diagnostics, `None` when unavailable.
    async fn logs(&self, id: &str) -> Result<Option<String>, RemoteError>;

    /// Remove platform bookkeeping left behind by finished creations of
    /// `owner`. Returns the names of the records removed.
    async fn prune_records(&self, _owner: &ResourceTags) -> Result<Vec<String>, RemoteError> {
        Ok(Vec::new())
    }
}
