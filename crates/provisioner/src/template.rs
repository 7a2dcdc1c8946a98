//! Agent templates.

use std::collections::BTreeSet;
use std::time::Duration;

use agent_cloud::{EnvVar, RegistryCredential, ResourceSpec, ResourceTags, VolumeSpec};
use serde::{Deserialize, Serialize};

use crate::label::parse_label_set;
use crate::retention::RetentionPolicy;
use crate::scheduler::AgentContext;

/// Default startup timeout.
pub const DEFAULT_STARTUP_TIMEOUT_MINUTES: u64 = 10;

/// Default SSH port for pull launch.
pub const DEFAULT_SSH_PORT: u32 = 22;

/// Default agent working directory.
pub const DEFAULT_ROOT_FS: &str = "/home/agent";

fn default_startup_timeout() -> u64 {
    DEFAULT_STARTUP_TIMEOUT_MINUTES
}

fn default_ssh_port() -> u32 {
    DEFAULT_SSH_PORT
}

fn default_root_fs() -> String {
    DEFAULT_ROOT_FS.to_string()
}

/// How the agent process gets connected to the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LaunchMethod {
    /// The agent dials the scheduler itself.
    #[default]
    Push,
    /// The provisioner opens an SSH session and starts the agent.
    #[serde(rename_all = "camelCase")]
    Pull {
        ssh_credentials_id: String,
        #[serde(default = "default_ssh_port")]
        ssh_port: u32,
    },
}

impl LaunchMethod {
    /// Short name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull { .. } => "pull",
        }
    }
}

/// CPU and memory requests and limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    /// CPU request (`500m`, `1`).
    #[serde(default)]
    pub cpu_request: Option<String>,
    /// CPU limit.
    #[serde(default)]
    pub cpu_limit: Option<String>,
    /// Memory request (`512Mi` on Kubernetes, gigabytes on ACI).
    #[serde(default)]
    pub memory_request: Option<String>,
    /// Memory limit.
    #[serde(default)]
    pub memory_limit: Option<String>,
}

/// Blueprint of one kind of agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTemplate {
    /// Template name, also the base of generated agent names.
    pub name: String,

    /// Whitespace-separated labels this template offers.
    #[serde(default)]
    pub label: Option<String>,

    /// Container image.
    pub image: String,

    /// Entrypoint override, may contain placeholders.
    #[serde(default)]
    pub command: Option<String>,

    /// Arguments, may contain placeholders.
    #[serde(default)]
    pub args: Option<String>,

    /// Requests and limits.
    #[serde(flatten)]
    pub resources: ResourceRequirements,

    /// Container operating system.
    #[serde(default)]
    pub os_type: Option<String>,

    /// Agent working directory.
    #[serde(default = "default_root_fs")]
    pub root_fs: String,

    /// Launch method.
    #[serde(default)]
    pub launch: LaunchMethod,

    /// Retention policy.
    #[serde(default)]
    pub retention: RetentionPolicy,

    /// Minutes allowed from creation to online. Zero disables the deadline.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_minutes: u64,

    /// Extra environment variables.
    #[serde(default)]
    pub env: Vec<EnvVar>,

    /// Volumes.
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,

    /// Names of existing image pull secrets.
    #[serde(default)]
    pub image_pull_secrets: Vec<String>,

    /// Credential ids of private registries, resolved at creation time.
    #[serde(default)]
    pub registry_credentials: Vec<RegistryLogin>,

    /// Ports to expose.
    #[serde(default)]
    pub ports: Vec<u16>,

    /// Run privileged.
    #[serde(default)]
    pub privileged: bool,

    /// Pin agents to a node.
    #[serde(default)]
    pub node_name: Option<String>,
}

/// Reference to a registry login held in the credential store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryLogin {
    /// Registry host.
    pub server: String,
    /// Credential id.
    pub credentials_id: String,
}

impl AgentTemplate {
    /// Minimal template, mostly for tests and tooling.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: None,
            image: image.into(),
            command: None,
            args: None,
            resources: ResourceRequirements::default(),
            os_type: None,
            root_fs: default_root_fs(),
            launch: LaunchMethod::default(),
            retention: RetentionPolicy::default(),
            startup_timeout_minutes: DEFAULT_STARTUP_TIMEOUT_MINUTES,
            env: Vec::new(),
            volumes: Vec::new(),
            image_pull_secrets: Vec::new(),
            registry_credentials: Vec::new(),
            ports: Vec::new(),
            privileged: false,
            node_name: None,
        }
    }

    /// Labels offered by this template.
    #[must_use]
    pub fn label_set(&self) -> BTreeSet<String> {
        self.label.as_deref().map(parse_label_set).unwrap_or_default()
    }

    /// Startup deadline, `None` when disabled.
    #[must_use]
    pub fn startup_timeout(&self) -> Option<Duration> {
        (self.startup_timeout_minutes > 0)
            .then(|| Duration::from_secs(self.startup_timeout_minutes.saturating_mul(60)))
    }

    /// Build the platform request for one agent.
    ///
    /// Placeholders in `command` and `args` are expanded from `context`, then
    /// split on whitespace. Push-launched agents additionally get their
    /// connection details as environment variables.
    #[must_use]
    pub fn resource_spec(
        &self,
        name: &str,
        context: &AgentContext,
        tags: ResourceTags,
        registry_credentials: Vec<RegistryCredential>,
    ) -> ResourceSpec {
        let split = |value: Option<&String>| -> Vec<String> {
            value
                .map(|v| {
                    context
                        .expand(v)
                        .split_whitespace()
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut env = self.env.clone();
        if self.launch == LaunchMethod::Push {
            env.push(EnvVar::new("AGENT_URL", &context.root_url));
            env.push(EnvVar::new("AGENT_SECRET", &context.secret));
            env.push(EnvVar::new("AGENT_NAME", name));
        }

        ResourceSpec {
            name: name.to_string(),
            image: self.image.clone(),
            command: split(self.command.as_ref()),
            args: split(self.args.as_ref()),
            env,
            cpu_request: self.resources.cpu_request.clone(),
            cpu_limit: self.resources.cpu_limit.clone(),
            memory_request: self.resources.memory_request.clone(),
            memory_limit: self.resources.memory_limit.clone(),
            ports: self.ports.clone(),
            os_type: self.os_type.clone(),
            working_dir: Some(self.root_fs.clone()),
            privileged: self.privileged,
            node_name: self.node_name.clone(),
            image_pull_secrets: self.image_pull_secrets.clone(),
            registry_credentials,
            volumes: self.volumes.clone(),
            deployment: None,
            tags: Some(tags),
        }
    }
}
