//! Provisioner configuration.
//!
//! Loaded from a YAML file, typically a mounted `ConfigMap`:
//!
//! ```yaml
//! instanceId: ci-prod
//! clouds:
//!   - name: k8s
//!     kind: { type: kubernetes, namespace: agents }
//!     templates:
//!       - name: maven
//!         label: linux maven
//!         image: agent/inbound:latest
//! backoff: { initialSeconds: 5, maxSeconds: 600 }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::label::is_valid_atom;
use crate::template::{AgentTemplate, LaunchMethod};

/// Environment variable holding the config file path.
pub const CONFIG_ENV: &str = "AGENT_PROVISIONER_CONFIG";

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid YAML for this schema.
    #[error("failed to parse config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The configuration is structurally valid but inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_max_concurrent_requests() -> usize {
    32
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionerConfig {
    /// Identity of this scheduler instance, stamped on every remote resource.
    #[serde(default)]
    pub instance_id: String,

    /// Configured clouds.
    #[serde(default)]
    pub clouds: Vec<CloudConfig>,

    /// Backoff settings.
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Reclamation settings.
    #[serde(default)]
    pub reclaim: ReclaimConfig,

    /// Readiness polling settings.
    #[serde(default)]
    pub polling: PollingConfig,
}

/// One remote platform account.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudConfig {
    /// Unique cloud name.
    pub name: String,

    /// Platform.
    pub kind: CloudKind,

    /// Remote calls allowed in flight at once.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Templates, in resolution order.
    #[serde(default)]
    pub templates: Vec<AgentTemplate>,
}

/// Platform of a cloud.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CloudKind {
    /// Pods in a Kubernetes namespace.
    #[serde(rename_all = "camelCase")]
    Kubernetes {
        #[serde(default = "default_namespace")]
        namespace: String,
        #[serde(default)]
        kubeconfig: Option<PathBuf>,
    },
    /// Azure Container Instances in a resource group.
    #[serde(rename_all = "camelCase")]
    Aci {
        subscription_id: String,
        resource_group: String,
        location: String,
        credentials_id: String,
    },
}

impl CloudKind {
    /// Short name for logs.
    #[must_use]
    pub fn platform(&self) -> &'static str {
        match self {
            Self::Kubernetes { .. } => "kubernetes",
            Self::Aci { .. } => "aci",
        }
    }
}

/// Longest backoff interval accepted from configuration.
pub const MAX_BACKOFF_SECONDS: u64 = 24 * 60 * 60;

/// Backoff settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    /// Interval after the first failure.
    #[serde(default = "BackoffConfig::default_initial")]
    pub initial_seconds: u64,
    /// Upper bound of the interval.
    #[serde(default = "BackoffConfig::default_max")]
    pub max_seconds: u64,
}

impl BackoffConfig {
    fn default_initial() -> u64 {
        5
    }

    fn default_max() -> u64 {
        600
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_seconds: Self::default_initial(),
            max_seconds: Self::default_max(),
        }
    }
}

/// Reclamation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReclaimConfig {
    /// Run the periodic sweep.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sweep period for Kubernetes clouds.
    #[serde(default = "ReclaimConfig::default_kubernetes")]
    pub kubernetes_period_minutes: u64,
    /// Sweep period for ACI clouds.
    #[serde(default = "ReclaimConfig::default_aci")]
    pub aci_period_minutes: u64,
}

impl ReclaimConfig {
    fn default_kubernetes() -> u64 {
        15
    }

    fn default_aci() -> u64 {
        30
    }

    /// Sweep period for a cloud of the given kind.
    #[must_use]
    pub fn period_for(&self, kind: &CloudKind) -> Duration {
        let minutes = match kind {
            CloudKind::Kubernetes { .. } => self.kubernetes_period_minutes,
            CloudKind::Aci { .. } => self.aci_period_minutes,
        };
        Duration::from_secs(minutes.max(1).saturating_mul(60))
    }
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            kubernetes_period_minutes: Self::default_kubernetes(),
            aci_period_minutes: Self::default_aci(),
        }
    }
}

/// Readiness polling settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingConfig {
    /// Poll interval for Kubernetes clouds.
    #[serde(default = "PollingConfig::default_kubernetes")]
    pub kubernetes_interval_seconds: u64,
    /// Poll interval for ACI clouds.
    #[serde(default = "PollingConfig::default_aci")]
    pub aci_interval_seconds: u64,
}

impl PollingConfig {
    fn default_kubernetes() -> u64 {
        1
    }

    fn default_aci() -> u64 {
        5
    }

    /// Poll interval for a cloud of the given kind.
    #[must_use]
    pub fn interval_for(&self, kind: &CloudKind) -> Duration {
        let seconds = match kind {
            CloudKind::Kubernetes { .. } => self.kubernetes_interval_seconds,
            CloudKind::Aci { .. } => self.aci_interval_seconds,
        };
        Duration::from_secs(seconds.max(1))
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            kubernetes_interval_seconds: Self::default_kubernetes(),
            aci_interval_seconds: Self::default_aci(),
        }
    }
}

impl ProvisionerConfig {
    /// Load and validate configuration from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let mut config: ProvisionerConfig = serde_yaml::from_str(contents)?;
        config.ensure_instance_id();
        config.validate()?;
        Ok(config)
    }

    /// Fill in a generated instance id when none is configured.
    pub fn ensure_instance_id(&mut self) {
        if self.instance_id.trim().is_empty() {
            self.instance_id = uuid::Uuid::new_v4().to_string();
            warn!(
                instance_id = %self.instance_id,
                "No instanceId configured, generated one; resources from earlier runs will not be reclaimed"
            );
        }
    }

    /// Look up a cloud by name.
    #[must_use]
    pub fn cloud(&self, name: &str) -> Option<&CloudConfig> {
        self.clouds.iter().find(|c| c.name == name)
    }

    /// Check cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut cloud_names = HashSet::new();
        for cloud in &self.clouds {
            if cloud.name.trim().is_empty() {
                return Err(ConfigError::Invalid("cloud name must not be empty".to_string()));
            }
            if !cloud_names.insert(cloud.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate cloud name '{}'",
                    cloud.name
                )));
            }
            if cloud.max_concurrent_requests == 0 {
                return Err(ConfigError::Invalid(format!(
                    "cloud '{}': maxConcurrentRequests must be at least 1",
                    cloud.name
                )));
            }
            cloud.validate_templates()?;
        }

        if self.backoff.initial_seconds == 0 {
            return Err(ConfigError::Invalid(
                "backoff.initialSeconds must be at least 1".to_string(),
            ));
        }
        if self.backoff.max_seconds > MAX_BACKOFF_SECONDS {
            return Err(ConfigError::Invalid(format!(
                "backoff.maxSeconds must not exceed {MAX_BACKOFF_SECONDS}"
            )));
        }

        Ok(())
    }
}

impl CloudConfig {
    fn validate_templates(&self) -> Result<(), ConfigError> {
        let invalid = |template: &str, message: String| {
            ConfigError::Invalid(format!(
                "cloud '{}', template '{template}': {message}",
                self.name
            ))
        };

        let mut names = HashSet::new();
        for template in &self.templates {
            if template.name.trim().is_empty() {
                return Err(invalid("", "template name must not be empty".to_string()));
            }
            if !names.insert(template.name.as_str()) {
                return Err(invalid(&template.name, "duplicate template name".to_string()));
            }
            if template.image.trim().is_empty() {
                return Err(invalid(&template.name, "image must not be empty".to_string()));
            }
            if let Some(bad) = template.label_set().iter().find(|l| !is_valid_atom(l)) {
                return Err(invalid(
                    &template.name,
                    format!("label '{bad}' contains operator characters"),
                ));
            }
            if let LaunchMethod::Pull { ssh_port, .. } = &template.launch {
                if *ssh_port > u32::from(u16::MAX) {
                    return Err(invalid(
                        &template.name,
                        format!("SSH port {ssh_port} is out of range"),
                    ));
                }
            }
        }
        Ok(())
    }
}
