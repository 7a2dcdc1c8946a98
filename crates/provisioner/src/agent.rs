//! Agent records handed to the scheduler.

use agent_cloud::EnvVar;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::retention::RetentionPolicy;
use crate::template::{AgentTemplate, LaunchMethod};

/// Environment entry carrying an ACI agent's address.
pub const ADDRESS_ENV: &str = "IP";

/// A scheduler-visible node backed by one remote resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentNode {
    /// Generated name, also the remote resource name.
    pub name: String,
    /// Owning cloud.
    pub cloud: String,
    /// Template the agent was created from.
    pub template: String,
    /// Labels the agent offers.
    pub labels: Option<String>,
    /// Launch method.
    pub launch: LaunchMethod,
    /// Retention policy.
    pub retention: RetentionPolicy,
    /// Address, once the resource is running.
    pub address: Option<String>,
    /// Remote resource id, once created.
    pub resource_id: Option<String>,
    /// Node-level environment exposed to jobs.
    pub env: Vec<EnvVar>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

impl AgentNode {
    /// New pending agent for `template` in `cloud`.
    #[must_use]
    pub fn new(name: impl Into<String>, cloud: impl Into<String>, template: &AgentTemplate) -> Self {
        Self {
            name: name.into(),
            cloud: cloud.into(),
            template: template.name.clone(),
            labels: template.label.clone(),
            launch: template.launch.clone(),
            retention: template.retention,
            address: None,
            resource_id: None,
            env: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Remote resource to delete for this agent.
    #[must_use]
    pub fn remote_id(&self) -> &str {
        self.resource_id.as_deref().unwrap_or(&self.name)
    }

    /// Record the agent's address, optionally exposing it as the `IP` entry.
    pub fn set_address(&mut self, address: Option<String>, expose_env: bool) {
        self.address = address;
        self.env.retain(|e| e.name != ADDRESS_ENV);
        if expose_env {
            if let Some(address) = &self.address {
                self.env.push(EnvVar::new(ADDRESS_ENV, address));
            }
        }
    }
}
