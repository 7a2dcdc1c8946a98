//! In-memory scheduler and platform shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_cloud::{
    RemoteError, RemoteResourceClient, ResourcePhase, ResourceSpec, ResourceStatus, ResourceTags,
};
use agent_provisioner::{
    AgentContext, AgentNode, AgentTemplate, CloudConfig, CloudKind, ComputerState, EventSink,
    ProvisionEvent, ProvisionerConfig, Scheduler, SchedulerError,
};
use async_trait::async_trait;
use tokio::time::Instant;

pub const INSTANCE: &str = "ci-test";

// =============================================================================
// Scheduler
// =============================================================================

struct Registered {
    node: AgentNode,
    registered_at: Instant,
}

/// Scheduler whose agents connect a fixed time after registration.
#[derive(Default)]
pub struct FakeScheduler {
    pub nodes: Mutex<HashMap<String, Registered>>,
    /// `None` means agents never connect.
    pub connect_after: Option<Duration>,
    /// Reject every `add_node`.
    pub reject_registration: bool,
    pub removed: Mutex<Vec<String>>,
}

impl FakeScheduler {
    pub fn connecting_after(delay: Duration) -> Self {
        Self {
            connect_after: Some(delay),
            ..Self::default()
        }
    }

    pub fn never_connecting() -> Self {
        Self::default()
    }

    pub fn node(&self, name: &str) -> Option<AgentNode> {
        self.nodes.lock().unwrap().get(name).map(|r| r.node.clone())
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes.lock().unwrap().keys().cloned().collect()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    /// Register a node directly, as if it had been provisioned earlier.
    pub fn insert(&self, node: AgentNode) {
        self.nodes.lock().unwrap().insert(
            node.name.clone(),
            Registered {
                node,
                registered_at: Instant::now(),
            },
        );
    }
}

#[async_trait]
impl Scheduler for FakeScheduler {
    async fn add_node(&self, node: &AgentNode) -> Result<(), SchedulerError> {
        if self.reject_registration {
            return Err(SchedulerError::Rejected {
                operation: "add_node",
                node: node.name.clone(),
                message: "read-only mode".to_string(),
            });
        }
        let mut nodes = self.nodes.lock().unwrap();
        let registered_at = nodes
            .get(&node.name)
            .map_or_else(Instant::now, |r| r.registered_at);
        nodes.insert(
            node.name.clone(),
            Registered {
                node: node.clone(),
                registered_at,
            },
        );
        Ok(())
    }

    async fn remove_node(&self, name: &str) -> Result<bool, SchedulerError> {
        self.removed.lock().unwrap().push(name.to_string());
        Ok(self.nodes.lock().unwrap().remove(name).is_some())
    }

    async fn computer(&self, name: &str) -> Option<ComputerState> {
        let nodes = self.nodes.lock().unwrap();
        let registered = nodes.get(name)?;
        let online = self
            .connect_after
            .is_some_and(|delay| registered.registered_at.elapsed() >= delay);
        Some(ComputerState {
            online,
            accepting_tasks: online,
        })
    }

    async fn agent_context(&self, name: &str) -> Result<AgentContext, SchedulerError> {
        Ok(AgentContext {
            root_url: "http://ci.test/".to_string(),
            node_name: name.to_string(),
            secret: format!("secret-{name}"),
            instance_identity: "MIIB".to_string(),
        })
    }

    async fn agents_for_cloud(&self, cloud: &str) -> Vec<String> {
        self.nodes
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.node.cloud == cloud)
            .map(|r| r.node.name.clone())
            .collect()
    }
}

// =============================================================================
// Remote platform
// =============================================================================

struct Resource {
    spec: ResourceSpec,
    created_at: Instant,
}

/// Platform whose resources start running a fixed time after creation.
#[derive(Default)]
pub struct FakePlatform {
    resources: Mutex<HashMap<String, Resource>>,
    /// `None` keeps resources pending forever.
    pub running_after: Option<Duration>,
    /// Fail every `create`.
    pub fail_create: bool,
    /// Never answer `create`.
    pub hang_create: bool,
    pub creates: Mutex<Vec<String>>,
    pub deletes: Mutex<Vec<String>>,
}

impl FakePlatform {
    pub fn running_after(delay: Duration) -> Self {
        Self {
            running_after: Some(delay),
            ..Self::default()
        }
    }

    pub fn stuck_pending() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }

    pub fn hanging_create() -> Self {
        Self {
            hang_create: true,
            ..Self::default()
        }
    }

    /// Seed a resource owned by `instance` in `cloud`.
    pub fn seed(&self, name: &str, instance: &str, cloud: &str) {
        let spec = ResourceSpec {
            name: name.to_string(),
            tags: Some(ResourceTags::owner(instance, cloud)),
            ..ResourceSpec::default()
        };
        self.resources.lock().unwrap().insert(
            name.to_string(),
            Resource {
                spec,
                created_at: Instant::now(),
            },
        );
    }

    pub fn spec(&self, name: &str) -> Option<ResourceSpec> {
        self.resources.lock().unwrap().get(name).map(|r| r.spec.clone())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.resources.lock().unwrap().contains_key(name)
    }

    pub fn creates(&self) -> Vec<String> {
        self.creates.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteResourceClient for FakePlatform {
    fn platform(&self) -> &'static str {
        "fake"
    }

    async fn create(&self, spec: &ResourceSpec) -> Result<String, RemoteError> {
        self.creates.lock().unwrap().push(spec.name.clone());
        if self.hang_create {
            std::future::pending::<()>().await;
        }
        if self.fail_create {
            return Err(RemoteError::Api {
                status: 503,
                message: "quota exceeded".to_string(),
            });
        }
        self.resources.lock().unwrap().insert(
            spec.name.clone(),
            Resource {
                spec: spec.clone(),
                created_at: Instant::now(),
            },
        );
        Ok(spec.name.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<ResourceStatus>, RemoteError> {
        let resources = self.resources.lock().unwrap();
        let Some(resource) = resources.get(id) else {
            return Ok(None);
        };
        let running = self
            .running_after
            .is_some_and(|delay| resource.created_at.elapsed() >= delay);
        Ok(Some(if running {
            ResourceStatus::new(ResourcePhase::Running).with_address(Some("10.0.0.7".to_string()))
        } else {
            ResourceStatus::new(ResourcePhase::Pending)
        }))
    }

    async fn delete(&self, id: &str) -> Result<bool, RemoteError> {
        self.deletes.lock().unwrap().push(id.to_string());
        Ok(self.resources.lock().unwrap().remove(id).is_some())
    }

    async fn list(&self, owner: &ResourceTags) -> Result<Vec<String>, RemoteError> {
        Ok(self
            .resources
            .lock()
            .unwrap()
            .values()
            .filter(|r| {
                r.spec
                    .tags
                    .as_ref()
                    .is_some_and(|t| t.instance == owner.instance && t.cloud == owner.cloud)
            })
            .map(|r| r.spec.name.clone())
            .collect())
    }

    async fn logs(&self, _id: &str) -> Result<Option<String>, RemoteError> {
        Ok(Some("agent starting".to_string()))
    }
}

// =============================================================================
// Events
// =============================================================================

/// Sink keeping every event.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProvisionEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ProvisionEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: ProvisionEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// =============================================================================
// Configuration
// =============================================================================

pub fn template(name: &str, label: &str, timeout_minutes: u64) -> AgentTemplate {
    let mut template = AgentTemplate::new(name, "agent/inbound:latest");
    template.label = Some(label.to_string());
    template.startup_timeout_minutes = timeout_minutes;
    template.command = Some("agent-run".to_string());
    template.args = Some("-url ${rootUrl} -secret ${secret} -name ${nodeName}".to_string());
    template
}

pub fn kubernetes(name: &str, templates: Vec<AgentTemplate>) -> CloudConfig {
    CloudConfig {
        name: name.to_string(),
        kind: CloudKind::Kubernetes {
            namespace: "agents".to_string(),
            kubeconfig: None,
        },
        max_concurrent_requests: 8,
        templates,
    }
}

pub fn aci(name: &str, templates: Vec<AgentTemplate>) -> CloudConfig {
    CloudConfig {
        name: name.to_string(),
        kind: CloudKind::Aci {
            subscription_id: "sub".to_string(),
            resource_group: "agents".to_string(),
            location: "eastus".to_string(),
            credentials_id: "azure".to_string(),
        },
        max_concurrent_requests: 8,
        templates,
    }
}

pub fn config(clouds: Vec<CloudConfig>) -> ProvisionerConfig {
    ProvisionerConfig {
        instance_id: INSTANCE.to_string(),
        clouds,
        ..ProvisionerConfig::default()
    }
}

pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
