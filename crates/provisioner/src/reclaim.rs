//! Reclamation of orphaned remote resources.
//!
//! Provisioning can be interrupted anywhere between creating a remote
//! resource and registering or cleaning up its agent. The sweep lists every
//! resource tagged with this instance and cloud and deletes the ones no
//! known agent accounts for.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use agent_cloud::{RemoteError, ResourceTags};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::events::{EventSink, ProvisionEvent};
use crate::orchestrator::CloudRuntime;
use crate::scheduler::Scheduler;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Cloud swept.
    pub cloud: String,
    /// Resources tagged with this instance.
    pub listed: usize,
    /// Resources backed by a known agent.
    pub kept: usize,
    /// Resources without an agent.
    pub orphans: Vec<String>,
    /// Orphans actually deleted.
    pub deleted: Vec<String>,
    /// Orphans whose delete failed.
    pub failed: Vec<String>,
    /// Backoff records dropped for templates no longer configured.
    pub pruned: usize,
    /// Platform bookkeeping records removed, such as ACI deployments.
    pub records: Vec<String>,
}

/// Periodic sweep of one cloud.
pub struct Reclaimer {
    instance_id: String,
    runtime: Arc<CloudRuntime>,
    events: Arc<dyn EventSink>,
}

impl Reclaimer {
    /// Reclaimer for the cloud behind `runtime`.
    #[must_use]
    pub fn new(
        instance_id: impl Into<String>,
        runtime: Arc<CloudRuntime>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            runtime,
            events,
        }
    }

    /// Delete every resource of this instance whose name is not in `known`.
    ///
    /// Deletes run concurrently; a failed delete is logged and left for the
    /// next sweep. With `dry_run` nothing is deleted.
    ///
    /// # Errors
    /// Returns error if the resources cannot be listed.
    #[instrument(skip_all, fields(cloud = %self.runtime.name(), dry_run = dry_run))]
    pub async fn sweep(
        &self,
        known: &HashSet<String>,
        dry_run: bool,
    ) -> Result<ReclaimReport, RemoteError> {
        let owner = ResourceTags::owner(self.instance_id.as_str(), self.runtime.name());
        let resources = {
            let lease = self.runtime.connection().lease().await?;
            lease.list(&owner).await?
        };

        let mut report = ReclaimReport {
            cloud: self.runtime.name().to_string(),
            listed: resources.len(),
            ..ReclaimReport::default()
        };
        let (kept, orphans): (Vec<String>, Vec<String>) =
            resources.into_iter().partition(|name| known.contains(name));
        report.kept = kept.len();
        report.orphans.clone_from(&orphans);

        let mut deletions = JoinSet::new();
        for orphan in orphans {
            if dry_run {
                info!(resource = %orphan, "Would delete orphaned resource");
                continue;
            }
            let runtime = Arc::clone(&self.runtime);
            deletions.spawn(async move {
                let result = match runtime.connection().lease().await {
                    Ok(lease) => lease.delete(&orphan).await,
                    Err(e) => Err(e),
                };
                (orphan, result)
            });
        }

        while let Some(joined) = deletions.join_next().await {
            match joined {
                Ok((resource, Ok(true))) => {
                    self.events.emit(ProvisionEvent::Reclaimed {
                        cloud: report.cloud.clone(),
                        resource: resource.clone(),
                    });
                    report.deleted.push(resource);
                }
                Ok((resource, Ok(false))) => {
                    debug!(resource = %resource, "Orphaned resource already gone");
                }
                Ok((resource, Err(e))) => {
                    warn!(resource = %resource, error = %e, "Failed to delete orphaned resource");
                    report.failed.push(resource);
                }
                Err(e) => warn!(error = %e, "Reclamation delete task failed"),
            }
        }

        if !dry_run {
            report.records = self.prune_records(&owner).await;
        }
        report.pruned = self.runtime.breaker().prune(self.runtime.registry().names());
        info!(
            listed = report.listed,
            kept = report.kept,
            orphans = report.orphans.len(),
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            records = report.records.len(),
            "Reclamation sweep finished"
        );
        Ok(report)
    }

    /// Leftover records are best effort; a failure waits for the next sweep.
    async fn prune_records(&self, owner: &ResourceTags) -> Vec<String> {
        let result = match self.runtime.connection().lease().await {
            Ok(lease) => lease.prune_records(owner).await,
            Err(e) => Err(e),
        };
        result.unwrap_or_else(|e| {
            warn!(error = %e, "Failed to prune platform records");
            Vec::new()
        })
    }

    /// Sweep against the agents `scheduler` currently knows for this cloud.
    ///
    /// # Errors
    /// Returns error if the resources cannot be listed.
    pub async fn run_once(&self, scheduler: &dyn Scheduler) -> Result<ReclaimReport, RemoteError> {
        let known: HashSet<String> = scheduler
            .agents_for_cloud(self.runtime.name())
            .await
            .into_iter()
            .collect();
        self.sweep(&known, false).await
    }

    /// Sweep every `period` until `cancel` fires. The first sweep runs one
    /// period after start.
    pub fn spawn(
        self,
        tracker: &TaskTracker,
        scheduler: Arc<dyn Scheduler>,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tracker.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                cloud = %self.runtime.name(),
                period_secs = period.as_secs(),
                "Reclamation scheduled"
            );

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = self.run_once(scheduler.as_ref()).await {
                    warn!(cloud = %self.runtime.name(), error = %e, "Reclamation sweep failed");
                }
            }
            debug!(cloud = %self.runtime.name(), "Reclamation stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackoffConfig, CloudConfig, CloudKind, PollingConfig};
    use crate::credentials::StaticCredentials;
    use crate::events::TracingSink;
    use crate::scheduler::MockScheduler;
    use crate::template::AgentTemplate;
    use agent_cloud::{RemoteResourceClient, ResourceSpec, ResourceStatus};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Listing {
        resources: Mutex<Vec<String>>,
        fail_on: Option<String>,
        deletes: Mutex<Vec<String>>,
        owners: Mutex<Vec<ResourceTags>>,
        records: Mutex<Vec<String>>,
    }

    impl Listing {
        fn new(resources: &[&str], fail_on: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                resources: Mutex::new(resources.iter().map(ToString::to_string).collect()),
                fail_on: fail_on.map(str::to_string),
                deletes: Mutex::new(Vec::new()),
                owners: Mutex::new(Vec::new()),
                records: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RemoteResourceClient for Listing {
        fn platform(&self) -> &'static str {
            "listing"
        }

        async fn create(&self, spec: &ResourceSpec) -> Result<String, RemoteError> {
            Ok(spec.name.clone())
        }

        async fn get(&self, _id: &str) -> Result<Option<ResourceStatus>, RemoteError> {
            Ok(None)
        }

        async fn delete(&self, id: &str) -> Result<bool, RemoteError> {
            self.deletes.lock().unwrap().push(id.to_string());
            if self.fail_on.as_deref() == Some(id) {
                return Err(RemoteError::Api {
                    status: 500,
                    message: "boom".to_string(),
                });
            }
            let mut resources = self.resources.lock().unwrap();
            let before = resources.len();
            resources.retain(|r| r != id);
            Ok(resources.len() < before)
        }

        async fn list(&self, owner: &ResourceTags) -> Result<Vec<String>, RemoteError> {
            self.owners.lock().unwrap().push(owner.clone());
            Ok(self.resources.lock().unwrap().clone())
        }

        async fn logs(&self, _id: &str) -> Result<Option<String>, RemoteError> {
            Ok(None)
        }

        async fn prune_records(&self, _owner: &ResourceTags) -> Result<Vec<String>, RemoteError> {
            Ok(std::mem::take(&mut *self.records.lock().unwrap()))
        }
    }

    fn reclaimer(remote: Arc<Listing>) -> Reclaimer {
        let cloud = CloudConfig {
            name: "k8s".to_string(),
            kind: CloudKind::Kubernetes {
                namespace: "ci".to_string(),
                kubeconfig: None,
            },
            max_concurrent_requests: 8,
            templates: vec![AgentTemplate::new("t1", "img")],
        };
        let runtime = CloudRuntime::with_client(
            cloud,
            &BackoffConfig::default(),
            &PollingConfig::default(),
            Arc::new(StaticCredentials::new()),
            remote,
        );
        Reclaimer::new("ci-prod", Arc::new(runtime), Arc::new(TracingSink))
    }

    fn known(names: &[&str]) -> HashSet<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn test_sweep_lists_by_owner_and_deletes_orphans() {
        let remote = Listing::new(&["t1-aaaaa", "t1-bbbbb", "t1-ccccc"], None);
        let reclaimer = reclaimer(Arc::clone(&remote));

        let report = reclaimer
            .sweep(&known(&["t1-aaaaa", "t1-ccccc"]), false)
            .await
            .unwrap();
        assert_eq!(report.listed, 3);
        assert_eq!(report.kept, 2);
        assert_eq!(report.deleted, vec!["t1-bbbbb"]);
        assert_eq!(
            remote.owners.lock().unwrap()[0],
            ResourceTags::owner("ci-prod", "k8s")
        );
    }

    #[tokio::test]
    async fn test_dry_run_deletes_nothing() {
        let remote = Listing::new(&["t1-aaaaa", "t1-bbbbb"], None);
        let report = reclaimer(Arc::clone(&remote))
            .sweep(&known(&[]), true)
            .await
            .unwrap();
        assert_eq!(report.orphans.len(), 2);
        assert!(report.deleted.is_empty());
        assert!(remote.deletes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_delete_does_not_abort_sweep() {
        let remote = Listing::new(&["t1-aaaaa", "t1-bbbbb", "t1-ccccc"], Some("t1-bbbbb"));
        let report = reclaimer(Arc::clone(&remote))
            .sweep(&known(&[]), false)
            .await
            .unwrap();
        assert_eq!(report.failed, vec!["t1-bbbbb"]);
        assert_eq!(report.deleted.len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_prunes_backoff_of_removed_templates() {
        let reclaimer = reclaimer(Listing::new(&[], None));
        reclaimer.runtime.breaker().failure("t1");
        reclaimer.runtime.breaker().failure("removed");

        let report = reclaimer.sweep(&known(&[]), false).await.unwrap();
        assert_eq!(report.pruned, 1);
        assert!(reclaimer.runtime.breaker().record("t1").is_some());
    }

    #[tokio::test]
    async fn test_sweep_prunes_platform_records() {
        let remote = Listing::new(&[], None);
        remote.records.lock().unwrap().push("linux-q8r4tz9m".to_string());
        let reclaimer = reclaimer(Arc::clone(&remote));

        let report = reclaimer.sweep(&known(&[]), true).await.unwrap();
        assert!(report.records.is_empty());
        assert_eq!(remote.records.lock().unwrap().len(), 1);

        let report = reclaimer.sweep(&known(&[]), false).await.unwrap();
        assert_eq!(report.records, vec!["linux-q8r4tz9m"]);
        assert!(remote.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_once_uses_scheduler_agents() {
        let remote = Listing::new(&["t1-aaaaa", "t1-bbbbb"], None);
        let reclaimer = reclaimer(Arc::clone(&remote));
        let mut scheduler = MockScheduler::new();
        scheduler.expect_agents_for_cloud().returning(|cloud| {
            assert_eq!(cloud, "k8s");
            vec!["t1-aaaaa".to_string()]
        });

        let report = reclaimer.run_once(&scheduler).await.unwrap();
        assert_eq!(report.deleted, vec!["t1-bbbbb"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sweep_stops_on_cancel() {
        let remote = Listing::new(&["t1-aaaaa"], None);
        let mut scheduler = MockScheduler::new();
        scheduler.expect_agents_for_cloud().returning(|_| Vec::new());
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();

        let handle = reclaimer(Arc::clone(&remote)).spawn(
            &tracker,
            Arc::new(scheduler),
            Duration::from_secs(60),
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(remote.deletes.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(*remote.deletes.lock().unwrap(), vec!["t1-aaaaa"]);

        cancel.cancel();
        handle.await.unwrap();
    }
}
