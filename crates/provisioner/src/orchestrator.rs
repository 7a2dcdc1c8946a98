//! Provisioning orchestrator.
//!
//! One [`Provisioner`] serves every configured cloud. Each requested agent
//! becomes an independent task that registers the agent, creates its remote
//! resource, waits for readiness and unwinds on failure. Tasks never affect
//! each other; only the per-cloud backoff gate is shared.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agent_cloud::{RegistryCredential, RemoteResourceClient, ResourceSpec, ResourceTags};
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::agent::AgentNode;
use crate::breaker::ProvisionBackoff;
use crate::config::{BackoffConfig, CloudConfig, CloudKind, PollingConfig, ProvisionerConfig};
use crate::connection::CloudConnection;
use crate::credentials::{Credential, CredentialStore, EnvCredentials};
use crate::error::ProvisionError;
use crate::events::{EventSink, ProvisionEvent, TracingSink};
use crate::label::LabelExpr;
use crate::launch::SshLauncher;
use crate::naming::{self, AGENT_SUFFIX_LENGTH, DEPLOYMENT_SUFFIX_LENGTH};
use crate::poller::{self, FailureReason, Online, PullLaunch, ReadinessPoller, ReadinessState};
use crate::reclaim::Reclaimer;
use crate::registry::TemplateRegistry;
use crate::retention::{ComputerActivity, RetentionDecision};
use crate::scheduler::Scheduler;
use crate::template::{AgentTemplate, LaunchMethod};

// ============================================================================
// Per-cloud state
// ============================================================================

/// Everything the provisioner keeps for one configured cloud.
pub struct CloudRuntime {
    name: String,
    kind: CloudKind,
    registry: TemplateRegistry,
    breaker: ProvisionBackoff,
    connection: CloudConnection,
    poll_interval: Duration,
}

impl CloudRuntime {
    /// Runtime whose client is built on first use.
    #[must_use]
    pub fn new(
        cloud: CloudConfig,
        backoff: &BackoffConfig,
        polling: &PollingConfig,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self::build(cloud, backoff, polling, |cloud| {
            CloudConnection::new(cloud, credentials)
        })
    }

    /// Runtime around an existing client.
    #[must_use]
    pub fn with_client(
        cloud: CloudConfig,
        backoff: &BackoffConfig,
        polling: &PollingConfig,
        credentials: Arc<dyn CredentialStore>,
        client: Arc<dyn RemoteResourceClient>,
    ) -> Self {
        Self::build(cloud, backoff, polling, |cloud| {
            CloudConnection::with_client(cloud, credentials, client)
        })
    }

    fn build(
        cloud: CloudConfig,
        backoff: &BackoffConfig,
        polling: &PollingConfig,
        connect: impl FnOnce(CloudConfig) -> CloudConnection,
    ) -> Self {
        Self {
            name: cloud.name.clone(),
            kind: cloud.kind.clone(),
            registry: TemplateRegistry::new(cloud.templates.iter().cloned()),
            breaker: ProvisionBackoff::new(backoff),
            poll_interval: polling.interval_for(&cloud.kind),
            connection: connect(cloud),
        }
    }

    /// Cloud name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cloud platform.
    #[must_use]
    pub fn kind(&self) -> &CloudKind {
        &self.kind
    }

    /// Templates of this cloud.
    #[must_use]
    pub fn registry(&self) -> &TemplateRegistry {
        &self.registry
    }

    /// Backoff gate of this cloud's templates.
    #[must_use]
    pub fn breaker(&self) -> &ProvisionBackoff {
        &self.breaker
    }

    /// Shared connection.
    #[must_use]
    pub fn connection(&self) -> &CloudConnection {
        &self.connection
    }

    fn is_aci(&self) -> bool {
        matches!(self.kind, CloudKind::Aci { .. })
    }
}

// ============================================================================
// Provisioner
// ============================================================================

/// An agent whose provisioning task has been scheduled.
#[derive(Debug)]
pub struct PlannedAgent {
    /// Generated agent name.
    pub name: String,
    /// Template used.
    pub template: String,
    /// Resolves to the online agent or the reason it failed.
    pub handle: JoinHandle<Result<AgentNode, ProvisionError>>,
}

struct Inner {
    instance_id: String,
    clouds: HashMap<String, Arc<CloudRuntime>>,
    reclaim_enabled: bool,
    reclaim_periods: HashMap<String, Duration>,
    scheduler: Arc<dyn Scheduler>,
    credentials: Arc<dyn CredentialStore>,
    events: Arc<dyn EventSink>,
    launcher: Option<SshLauncher>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

/// Provisions, terminates and reclaims agents for all configured clouds.
#[derive(Clone)]
pub struct Provisioner {
    inner: Arc<Inner>,
}

/// Builder for [`Provisioner`].
pub struct ProvisionerBuilder {
    config: ProvisionerConfig,
    scheduler: Arc<dyn Scheduler>,
    credentials: Arc<dyn CredentialStore>,
    events: Arc<dyn EventSink>,
    launcher: Option<SshLauncher>,
    clients: HashMap<String, Arc<dyn RemoteResourceClient>>,
}

impl ProvisionerBuilder {
    /// Credential store, environment variables by default.
    #[must_use]
    pub fn credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Event sink, the log by default.
    #[must_use]
    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Launcher for pull-style templates.
    #[must_use]
    pub fn launcher(mut self, launcher: SshLauncher) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Use `client` for `cloud` instead of connecting from configuration.
    #[must_use]
    pub fn client(mut self, cloud: impl Into<String>, client: Arc<dyn RemoteResourceClient>) -> Self {
        self.clients.insert(cloud.into(), client);
        self
    }

    /// Build the provisioner.
    #[must_use]
    pub fn build(mut self) -> Provisioner {
        let backoff = self.config.backoff;
        let polling = self.config.polling;
        let mut clouds = HashMap::new();
        let mut reclaim_periods = HashMap::new();

        for cloud in self.config.clouds {
            let name = cloud.name.clone();
            reclaim_periods.insert(name.clone(), self.config.reclaim.period_for(&cloud.kind));
            let credentials = Arc::clone(&self.credentials);
            let runtime = match self.clients.remove(&name) {
                Some(client) => CloudRuntime::with_client(cloud, &backoff, &polling, credentials, client),
                None => CloudRuntime::new(cloud, &backoff, &polling, credentials),
            };
            clouds.insert(name, Arc::new(runtime));
        }

        Provisioner {
            inner: Arc::new(Inner {
                instance_id: self.config.instance_id,
                clouds,
                reclaim_enabled: self.config.reclaim.enabled,
                reclaim_periods,
                scheduler: self.scheduler,
                credentials: self.credentials,
                events: self.events,
                launcher: self.launcher,
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }
}

impl Provisioner {
    /// Start building a provisioner for `config`.
    #[must_use]
    pub fn builder(config: ProvisionerConfig, scheduler: Arc<dyn Scheduler>) -> ProvisionerBuilder {
        ProvisionerBuilder {
            config,
            scheduler,
            credentials: Arc::new(EnvCredentials),
            events: Arc::new(TracingSink),
            launcher: None,
            clients: HashMap::new(),
        }
    }

    /// Identity used to tag remote resources.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Runtime of `cloud`.
    #[must_use]
    pub fn cloud(&self, cloud: &str) -> Option<Arc<CloudRuntime>> {
        self.inner.clouds.get(cloud).cloned()
    }

    /// Whether `cloud` can currently provision an agent for `label`.
    #[must_use]
    pub fn can_provision(&self, cloud: &str, label: Option<&str>) -> bool {
        match self.admit(cloud, label) {
            Ok(_) => true,
            Err(e) => {
                debug!(cloud = %cloud, label = ?label, reason = %e, "Cannot provision");
                false
            }
        }
    }

    /// Schedule `count` agents for `label` in `cloud`.
    ///
    /// Returns as soon as the tasks are spawned. Each handle resolves to the
    /// online agent or the reason provisioning failed; failures have already
    /// been unwound, reported to the backoff gate and emitted as events.
    ///
    /// # Errors
    /// Returns an admission error if the cloud is unknown, no template
    /// matches, the template is backing off, or the provisioner is shutting
    /// down.
    pub fn provision(
        &self,
        cloud: &str,
        label: Option<&str>,
        count: usize,
    ) -> Result<Vec<PlannedAgent>, ProvisionError> {
        let (runtime, template) = self.admit(cloud, label)?;
        info!(
            cloud = %cloud,
            template = %template.name,
            label = ?label,
            count,
            "Provisioning agents"
        );

        Ok((0..count)
            .map(|_| {
                let name = naming::generate(&template.name, AGENT_SUFFIX_LENGTH);
                let task = ProvisionTask {
                    inner: Arc::clone(&self.inner),
                    runtime: Arc::clone(&runtime),
                    template: Arc::clone(&template),
                    name: name.clone(),
                    cancel: self.inner.cancel.child_token(),
                };
                PlannedAgent {
                    name,
                    template: template.name.clone(),
                    handle: self.inner.tracker.spawn(task.run()),
                }
            })
            .collect())
    }

    /// Remove `node` from the scheduler and delete its remote resource.
    ///
    /// Returns `false` when the remote resource did not exist.
    ///
    /// # Errors
    /// Returns error if the cloud is unknown or the platform rejects the
    /// delete.
    pub async fn terminate(&self, node: &AgentNode) -> Result<bool, ProvisionError> {
        let runtime = self
            .inner
            .clouds
            .get(&node.cloud)
            .ok_or_else(|| ProvisionError::UnknownCloud(node.cloud.clone()))?;
        self.inner.terminate(runtime, node).await
    }

    /// Apply `node`'s retention policy to its current activity.
    ///
    /// # Errors
    /// Returns error if termination fails.
    pub async fn check_retention(
        &self,
        node: &AgentNode,
        activity: &ComputerActivity,
        now: DateTime<Utc>,
    ) -> Result<RetentionDecision, ProvisionError> {
        let decision = node.retention.check(activity, now);
        if decision == RetentionDecision::Terminate {
            info!(agent = %node.name, retention = ?node.retention, "Retention expired");
            self.terminate(node).await?;
        }
        Ok(decision)
    }

    /// Apply `node`'s retention policy after it completed a task.
    ///
    /// # Errors
    /// Returns error if termination fails.
    pub async fn task_completed(&self, node: &AgentNode) -> Result<RetentionDecision, ProvisionError> {
        let decision = node.retention.on_task_completed();
        if decision == RetentionDecision::Terminate {
            info!(agent = %node.name, "Run-once agent finished its task");
            self.terminate(node).await?;
        }
        Ok(decision)
    }

    /// Reclaimer for `cloud`.
    #[must_use]
    pub fn reclaimer(&self, cloud: &str) -> Option<Reclaimer> {
        self.cloud(cloud).map(|runtime| {
            Reclaimer::new(
                self.inner.instance_id.clone(),
                runtime,
                Arc::clone(&self.inner.events),
            )
        })
    }

    /// Start the periodic reclamation sweep of every cloud.
    ///
    /// Does nothing when reclamation is disabled. The sweeps stop on
    /// [`shutdown`](Self::shutdown).
    pub fn start_reclaimers(&self) -> usize {
        if !self.inner.reclaim_enabled {
            info!("Reclamation disabled");
            return 0;
        }
        let mut started = 0;
        for cloud in self.inner.clouds.keys() {
            let (Some(reclaimer), Some(period)) =
                (self.reclaimer(cloud), self.inner.reclaim_periods.get(cloud))
            else {
                continue;
            };
            reclaimer.spawn(
                &self.inner.tracker,
                Arc::clone(&self.inner.scheduler),
                *period,
                self.inner.cancel.child_token(),
            );
            started += 1;
        }
        started
    }

    /// Cancel in-flight provisioning and sweeps, and wait for them to unwind.
    pub async fn shutdown(&self) {
        info!(in_flight = self.inner.tracker.len(), "Shutting down provisioner");
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        for runtime in self.inner.clouds.values() {
            runtime.connection.close();
        }
    }

    fn admit(
        &self,
        cloud: &str,
        label: Option<&str>,
    ) -> Result<(Arc<CloudRuntime>, Arc<AgentTemplate>), ProvisionError> {
        if self.inner.cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled);
        }
        let runtime = self
            .inner
            .clouds
            .get(cloud)
            .ok_or_else(|| ProvisionError::UnknownCloud(cloud.to_string()))?;
        let expr = LabelExpr::parse_request(label)?;
        let template = runtime
            .registry
            .find_template(expr.as_ref())
            .ok_or_else(|| ProvisionError::NoTemplate {
                cloud: cloud.to_string(),
                label: label.unwrap_or_default().to_string(),
            })?;

        if let Some(retry_in) = runtime.breaker.retry_in(&template.name) {
            warn!(
                cloud = %cloud,
                template = %template.name,
                retry_in_secs = retry_in.as_secs(),
                "Template is backing off after failed provisioning"
            );
            return Err(ProvisionError::CircuitOpen {
                template: template.name.clone(),
                retry_in,
            });
        }
        Ok((Arc::clone(runtime), template))
    }
}

impl Inner {
    async fn terminate(&self, runtime: &CloudRuntime, node: &AgentNode) -> Result<bool, ProvisionError> {
        if let Err(e) = self.scheduler.remove_node(&node.name).await {
            warn!(agent = %node.name, error = %e, "Failed to remove agent from scheduler");
        }

        let deleted = match runtime.connection.lease().await {
            Ok(lease) => lease.delete(node.remote_id()).await,
            Err(e) => Err(e),
        };
        match deleted {
            Ok(deleted) => {
                if deleted {
                    self.events.emit(ProvisionEvent::Terminated {
                        cloud: runtime.name.clone(),
                        agent: node.name.clone(),
                    });
                } else {
                    debug!(agent = %node.name, "Remote resource already gone");
                }
                Ok(deleted)
            }
            Err(e) => {
                self.events.emit(ProvisionEvent::TerminateFailed {
                    cloud: runtime.name.clone(),
                    agent: node.name.clone(),
                    reason: e.to_string(),
                });
                Err(e.into())
            }
        }
    }
}

// ============================================================================
// Provisioning task
// ============================================================================

struct ProvisionTask {
    inner: Arc<Inner>,
    runtime: Arc<CloudRuntime>,
    template: Arc<AgentTemplate>,
    name: String,
    cancel: CancellationToken,
}

impl ProvisionTask {
    #[instrument(
        skip_all,
        fields(cloud = %self.runtime.name, template = %self.template.name, agent = %self.name)
    )]
    async fn run(self) -> Result<AgentNode, ProvisionError> {
        let mut node = AgentNode::new(&self.name, &self.runtime.name, &self.template);

        match self.provision(&mut node).await {
            Ok(online) => {
                self.runtime.breaker.success(&self.template.name);
                self.inner.events.emit(ProvisionEvent::Provisioned {
                    cloud: self.runtime.name.clone(),
                    template: self.template.name.clone(),
                    agent: node.name.clone(),
                    elapsed: online.elapsed,
                });
                Ok(node)
            }
            Err(e) => {
                if let Err(cleanup) = self.inner.terminate(&self.runtime, &node).await {
                    warn!(error = %cleanup, "Cleanup after failed provisioning failed, leaving it to reclamation");
                }
                if !matches!(e, ProvisionError::Cancelled) {
                    self.runtime.breaker.failure(&self.template.name);
                }
                self.inner.events.emit(ProvisionEvent::ProvisionFailed {
                    cloud: self.runtime.name.clone(),
                    template: self.template.name.clone(),
                    agent: node.name.clone(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn provision(&self, node: &mut AgentNode) -> Result<Online, ProvisionError> {
        let pull = self.pull_launch()?;

        self.inner.scheduler.add_node(node).await?;
        debug!("Registered pending agent");

        let context = self.inner.scheduler.agent_context(&node.name).await?;
        let tags = ResourceTags {
            instance: self.inner.instance_id.clone(),
            cloud: self.runtime.name.clone(),
            template: Some(self.template.name.clone()),
        };
        let mut spec = self.template.resource_spec(
            &node.name,
            &context,
            tags,
            self.registry_credentials().await?,
        );
        if self.runtime.is_aci() {
            spec.deployment = Some(naming::generate(&self.template.name, DEPLOYMENT_SUFFIX_LENGTH));
        }

        let resource_id = self.create(&node.name, &spec).await?;
        node.resource_id = Some(resource_id.clone());
        info!(resource = %resource_id, launch = self.template.launch.kind(), "Remote resource created");

        let poller = ReadinessPoller::new(
            &self.runtime.connection,
            self.inner.scheduler.as_ref(),
            self.runtime.poll_interval,
            self.template.startup_timeout(),
            self.cancel.clone(),
        );
        let online = poller
            .wait(&node.name, &resource_id, pull)
            .await
            .map_err(|reason| match reason {
                FailureReason::Cancelled => ProvisionError::Cancelled,
                reason => ProvisionError::Readiness {
                    agent: node.name.clone(),
                    reason,
                },
            })?;

        node.set_address(online.address.clone(), self.runtime.is_aci());
        if let Err(e) = self.inner.scheduler.add_node(node).await {
            warn!(error = %e, "Failed to record agent address");
        }
        Ok(online)
    }

    /// Submit the creation request, bounded by the startup deadline and cancellation.
    async fn create(&self, agent: &str, spec: &ResourceSpec) -> Result<String, ProvisionError> {
        let started = Instant::now();
        let deadline = self.template.startup_timeout().map(|t| started + t);
        let create = async {
            let lease = self.runtime.connection.lease().await?;
            lease.create(spec).await
        };
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(ProvisionError::Cancelled),
            () = poller::until(deadline) => Err(ProvisionError::Readiness {
                agent: agent.to_string(),
                reason: FailureReason::Timeout {
                    elapsed: started.elapsed(),
                    state: ReadinessState::Created,
                },
            }),
            created = create => Ok(created?),
        }
    }

    fn pull_launch(&self) -> Result<Option<PullLaunch<'_>>, ProvisionError> {
        let LaunchMethod::Pull {
            ssh_credentials_id,
            ssh_port,
        } = &self.template.launch
        else {
            return Ok(None);
        };
        let launcher = self.inner.launcher.as_ref().ok_or_else(|| {
            ProvisionError::Launch("pull launch requested but no transport is configured".to_string())
        })?;
        let port = u16::try_from(*ssh_port)
            .map_err(|_| ProvisionError::Launch(format!("SSH port {ssh_port} is out of range")))?;
        Ok(Some(PullLaunch {
            launcher,
            credentials_id: ssh_credentials_id,
            port,
            root_fs: &self.template.root_fs,
        }))
    }

    async fn registry_credentials(&self) -> Result<Vec<RegistryCredential>, ProvisionError> {
        let mut resolved = Vec::with_capacity(self.template.registry_credentials.len());
        for login in &self.template.registry_credentials {
            match self.inner.credentials.lookup(&login.credentials_id).await {
                Some(Credential::UsernamePassword { username, password }) => {
                    resolved.push(RegistryCredential {
                        server: login.server.clone(),
                        username,
                        password,
                    });
                }
                _ => return Err(ProvisionError::MissingCredential(login.credentials_id.clone())),
            }
        }
        Ok(resolved)
    }
}
