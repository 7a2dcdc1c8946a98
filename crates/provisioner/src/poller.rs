//! Readiness state machine.
//!
//! ```text
//! Created -> WaitingRemoteRunning -> WaitingAgentOnline -> Online
//!                  |                        |
//!                  +-------> Failed <-------+
//! ```
//!
//! Every remote and scheduler call races the startup deadline and the
//! cancellation token, so a hung platform call cannot outlive either.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use agent_cloud::{RemoteError, ResourcePhase, ResourceStatus};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::CloudConnection;
use crate::launch::{LaunchError, SshLauncher};
use crate::scheduler::Scheduler;

/// Where a provisioning attempt currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessState {
    /// Remote creation was requested.
    Created,
    /// Waiting for the remote resource to run.
    WaitingRemoteRunning,
    /// Waiting for the agent to connect to the scheduler.
    WaitingAgentOnline,
    /// Agent is connected and accepting tasks.
    Online,
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::WaitingRemoteRunning => write!(f, "waiting for remote resource"),
            Self::WaitingAgentOnline => write!(f, "waiting for agent to connect"),
            Self::Online => write!(f, "online"),
        }
    }
}

/// Why an agent never became ready.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The startup deadline passed.
    #[error("timed out after {elapsed:?} while {state}")]
    Timeout {
        elapsed: Duration,
        state: ReadinessState,
    },

    /// The workload exited or could not start.
    #[error("remote resource {phase}: {detail}")]
    RemoteFailed { phase: ResourcePhase, detail: String },

    /// The remote resource disappeared.
    #[error("remote resource no longer exists")]
    RemoteVanished,

    /// The agent record disappeared from the scheduler.
    #[error("agent was removed from the scheduler")]
    AgentVanished,

    /// Pull-style launch failed.
    #[error("launch failed: {0}")]
    Launch(String),

    /// The platform rejected a status call.
    #[error("remote platform error: {0}")]
    Remote(String),

    /// Provisioning was cancelled.
    #[error("cancelled")]
    Cancelled,
}

impl FailureReason {
    /// Whether the attempt failed on its deadline.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Successful readiness result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Online {
    /// Address reported by the platform.
    pub address: Option<String>,
    /// Time from creation to online.
    pub elapsed: Duration,
}

/// Pull-style launch parameters.
#[derive(Clone, Copy)]
pub struct PullLaunch<'a> {
    pub launcher: &'a SshLauncher,
    pub credentials_id: &'a str,
    pub port: u16,
    pub root_fs: &'a str,
}

/// Drives one agent through the readiness states.
pub struct ReadinessPoller<'a> {
    connection: &'a CloudConnection,
    scheduler: &'a dyn Scheduler,
    interval: Duration,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl<'a> ReadinessPoller<'a> {
    /// Poller checking every `interval`, giving up after `timeout`.
    #[must_use]
    pub fn new(
        connection: &'a CloudConnection,
        scheduler: &'a dyn Scheduler,
        interval: Duration,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connection,
            scheduler,
            interval,
            timeout,
            cancel,
        }
    }

    /// Wait until `agent`, backed by `resource_id`, is online.
    ///
    /// # Errors
    /// Returns the reason the agent could not be brought online.
    pub async fn wait(
        &self,
        agent: &str,
        resource_id: &str,
        pull: Option<PullLaunch<'_>>,
    ) -> Result<Online, FailureReason> {
        let started = Instant::now();
        let mut state = ReadinessState::Created;
        debug!(agent = %agent, state = %state, "Remote resource created");

        state = ReadinessState::WaitingRemoteRunning;
        let half_timeout = self.timeout.map(|t| started + t / 2);
        let mut logs_captured = false;

        let address = loop {
            self.check_deadline(started, state)?;
            match self.bounded(started, state, self.remote_status(resource_id)).await? {
                Ok(Some(status)) => match status.phase {
                    ResourcePhase::Running => break status.address,
                    ResourcePhase::Failed | ResourcePhase::Succeeded => {
                        return Err(remote_failed(status));
                    }
                    ResourcePhase::Pending | ResourcePhase::Unknown => {
                        debug!(agent = %agent, phase = %status.phase, "Waiting for remote resource");
                    }
                },
                Ok(None) => return Err(FailureReason::RemoteVanished),
                Err(e) if e.is_transient() => {
                    warn!(agent = %agent, error = %e, "Transient error while polling remote resource");
                }
                Err(e) => return Err(FailureReason::Remote(e.to_string())),
            }

            if !logs_captured && half_timeout.is_some_and(|at| Instant::now() >= at) {
                logs_captured = true;
                self.bounded(started, state, self.capture_logs(agent, resource_id))
                    .await?;
            }
            self.sleep().await?;
        };

        state = ReadinessState::WaitingAgentOnline;
        debug!(agent = %agent, state = %state, address = ?address, "Remote resource running");

        if let Some(pull) = pull {
            self.check_deadline(started, state)?;
            let host = address
                .as_deref()
                .ok_or_else(|| FailureReason::Launch("remote resource has no address".to_string()))?;
            self.launch(agent, host, pull, started, state).await?;
        }

        loop {
            self.check_deadline(started, state)?;
            match self.bounded(started, state, self.scheduler.computer(agent)).await? {
                None => return Err(FailureReason::AgentVanished),
                Some(computer) if computer.is_ready() => break,
                Some(_) => {}
            }
            match self.bounded(started, state, self.remote_status(resource_id)).await? {
                Ok(Some(status))
                    if matches!(status.phase, ResourcePhase::Failed | ResourcePhase::Succeeded) =>
                {
                    return Err(remote_failed(status));
                }
                Ok(None) => return Err(FailureReason::RemoteVanished),
                Ok(Some(_)) => {}
                Err(e) => warn!(agent = %agent, error = %e, "Failed to re-check remote resource"),
            }
            self.sleep().await?;
        }

        let elapsed = started.elapsed();
        info!(
            agent = %agent,
            state = %ReadinessState::Online,
            elapsed_secs = elapsed.as_secs(),
            "Agent online"
        );
        Ok(Online { address, elapsed })
    }

    async fn launch(
        &self,
        agent: &str,
        host: &str,
        pull: PullLaunch<'_>,
        started: Instant,
        state: ReadinessState,
    ) -> Result<(), FailureReason> {
        let launch = pull.launcher.launch(
            agent,
            host,
            pull.port,
            pull.credentials_id,
            pull.root_fs,
            &self.cancel,
        );
        self.bounded(started, state, launch).await?.map_err(|e| match e {
            LaunchError::Cancelled => FailureReason::Cancelled,
            e => FailureReason::Launch(e.to_string()),
        })
    }

    async fn remote_status(&self, resource_id: &str) -> Result<Option<ResourceStatus>, RemoteError> {
        let lease = self.connection.lease().await?;
        lease.get(resource_id).await
    }

    async fn capture_logs(&self, agent: &str, resource_id: &str) {
        let logs = match self.connection.lease().await {
            Ok(lease) => lease.logs(resource_id).await,
            Err(e) => Err(e),
        };
        match logs {
            Ok(Some(logs)) => info!(agent = %agent, "Container output so far:\n{logs}"),
            Ok(None) => debug!(agent = %agent, "No container output yet"),
            Err(e) => debug!(agent = %agent, error = %e, "Could not fetch container output"),
        }
    }

    fn check_deadline(&self, started: Instant, state: ReadinessState) -> Result<(), FailureReason> {
        let elapsed = started.elapsed();
        match self.timeout {
            Some(timeout) if elapsed >= timeout => Err(FailureReason::Timeout { elapsed, state }),
            _ => Ok(()),
        }
    }

    /// Run `call` unless the deadline passes or provisioning is cancelled first.
    async fn bounded<F: Future>(
        &self,
        started: Instant,
        state: ReadinessState,
        call: F,
    ) -> Result<F::Output, FailureReason> {
        let deadline = self.timeout.map(|t| started + t);
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(FailureReason::Cancelled),
            () = until(deadline) => Err(FailureReason::Timeout {
                elapsed: started.elapsed(),
                state,
            }),
            output = call => Ok(output),
        }
    }

    async fn sleep(&self) -> Result<(), FailureReason> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(FailureReason::Cancelled),
            () = tokio::time::sleep(self.interval) => Ok(()),
        }
    }
}

/// Resolves at `deadline`, or never when there is none.
pub(crate) async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn remote_failed(status: ResourceStatus) -> FailureReason {
    FailureReason::RemoteFailed {
        phase: status.phase,
        detail: status.detail.unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CloudConfig, CloudKind};
    use crate::credentials::StaticCredentials;
    use crate::scheduler::{ComputerState, MockScheduler};
    use agent_cloud::{RemoteResourceClient, ResourceSpec, ResourceTags};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// A status reply, or the HTTP status of a failed call.
    type Reply = Result<Option<ResourceStatus>, u16>;

    /// Replays replies, repeating the last one forever.
    struct Scripted {
        replies: Mutex<VecDeque<Reply>>,
        log_fetches: AtomicUsize,
    }

    impl Scripted {
        fn new(statuses: Vec<Option<ResourceStatus>>) -> Arc<Self> {
            Self::replying(statuses.into_iter().map(Ok).collect())
        }

        fn replying(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                log_fetches: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RemoteResourceClient for Scripted {
        fn platform(&self) -> &'static str {
            "scripted"
        }

        async fn create(&self, spec: &ResourceSpec) -> Result<String, RemoteError> {
            Ok(spec.name.clone())
        }

        async fn get(&self, _id: &str) -> Result<Option<ResourceStatus>, RemoteError> {
            let mut replies = self.replies.lock().unwrap();
            let reply = if replies.len() > 1 {
                replies.pop_front().unwrap_or(Ok(None))
            } else {
                replies.front().cloned().unwrap_or(Ok(None))
            };
            reply.map_err(|status| match status {
                401 | 403 => RemoteError::Auth("denied".to_string()),
                status => RemoteError::Api {
                    status,
                    message: "unavailable".to_string(),
                },
            })
        }

        async fn delete(&self, _id: &str) -> Result<bool, RemoteError> {
            Ok(true)
        }

        async fn list(&self, _owner: &ResourceTags) -> Result<Vec<String>, RemoteError> {
            Ok(Vec::new())
        }

        async fn logs(&self, _id: &str) -> Result<Option<String>, RemoteError> {
            self.log_fetches.fetch_add(1, Ordering::SeqCst);
            Ok(Some("starting".to_string()))
        }
    }

    /// Platform whose calls never complete.
    struct Hanging;

    #[async_trait]
    impl RemoteResourceClient for Hanging {
        fn platform(&self) -> &'static str {
            "hanging"
        }

        async fn create(&self, _spec: &ResourceSpec) -> Result<String, RemoteError> {
            std::future::pending().await
        }

        async fn get(&self, _id: &str) -> Result<Option<ResourceStatus>, RemoteError> {
            std::future::pending().await
        }

        async fn delete(&self, _id: &str) -> Result<bool, RemoteError> {
            std::future::pending().await
        }

        async fn list(&self, _owner: &ResourceTags) -> Result<Vec<String>, RemoteError> {
            std::future::pending().await
        }

        async fn logs(&self, _id: &str) -> Result<Option<String>, RemoteError> {
            std::future::pending().await
        }
    }

    fn connection(remote: Arc<dyn RemoteResourceClient>) -> CloudConnection {
        let cloud = CloudConfig {
            name: "k8s".to_string(),
            kind: CloudKind::Kubernetes {
                namespace: "ci".to_string(),
                kubeconfig: None,
            },
            max_concurrent_requests: 4,
            templates: Vec::new(),
        };
        CloudConnection::with_client(cloud, Arc::new(StaticCredentials::new()), remote)
    }

    fn pending() -> Option<ResourceStatus> {
        Some(ResourceStatus::new(ResourcePhase::Pending))
    }

    fn running() -> Option<ResourceStatus> {
        Some(ResourceStatus::new(ResourcePhase::Running).with_address(Some("10.1.2.3".to_string())))
    }

    fn ready_scheduler(polls_before_ready: usize) -> MockScheduler {
        let mut scheduler = MockScheduler::new();
        let mut polls = 0;
        scheduler.expect_computer().returning(move |_| {
            polls += 1;
            Some(ComputerState {
                online: polls > polls_before_ready,
                accepting_tasks: true,
            })
        });
        scheduler
    }

    const SECOND: Duration = Duration::from_secs(1);
    const FIVE_MINUTES: Duration = Duration::from_secs(300);

    #[tokio::test(start_paused = true)]
    async fn test_pending_running_online() {
        let remote = Scripted::new(vec![pending(), pending(), running()]);
        let connection = connection(remote);
        let scheduler = ready_scheduler(3);
        let poller = ReadinessPoller::new(
            &connection,
            &scheduler,
            SECOND,
            Some(FIVE_MINUTES),
            CancellationToken::new(),
        );

        let online = poller.wait("t1-abcde", "t1-abcde", None).await.unwrap();
        assert_eq!(online.address.as_deref(), Some("10.1.2.3"));
        assert!(online.elapsed < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_forever_times_out_and_snapshots_logs_once() {
        let remote = Scripted::new(vec![pending()]);
        let connection = connection(Arc::<Scripted>::clone(&remote));
        let scheduler = MockScheduler::new();
        let poller = ReadinessPoller::new(
            &connection,
            &scheduler,
            SECOND,
            Some(FIVE_MINUTES),
            CancellationToken::new(),
        );

        let reason = poller.wait("t1-abcde", "t1-abcde", None).await.unwrap_err();
        match reason {
            FailureReason::Timeout { elapsed, state } => {
                assert!(elapsed >= FIVE_MINUTES);
                assert_eq!(state, ReadinessState::WaitingRemoteRunning);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(remote.log_fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_phase_fails_immediately() {
        let failed = Some(ResourceStatus::new(ResourcePhase::Failed).with_detail("ErrImagePull"));
        let connection = connection(Scripted::new(vec![pending(), failed]));
        let scheduler = MockScheduler::new();
        let poller = ReadinessPoller::new(&connection, &scheduler, SECOND, None, CancellationToken::new());

        let reason = poller.wait("a", "a", None).await.unwrap_err();
        assert_eq!(
            reason,
            FailureReason::RemoteFailed {
                phase: ResourcePhase::Failed,
                detail: "ErrImagePull".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeded_phase_is_a_failure() {
        let done = Some(ResourceStatus::new(ResourcePhase::Succeeded));
        let connection = connection(Scripted::new(vec![done]));
        let scheduler = MockScheduler::new();
        let poller = ReadinessPoller::new(&connection, &scheduler, SECOND, None, CancellationToken::new());

        assert!(matches!(
            poller.wait("a", "a", None).await,
            Err(FailureReason::RemoteFailed { phase: ResourcePhase::Succeeded, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_resource() {
        let connection = connection(Scripted::new(vec![pending(), None]));
        let scheduler = MockScheduler::new();
        let poller = ReadinessPoller::new(&connection, &scheduler, SECOND, None, CancellationToken::new());

        assert_eq!(
            poller.wait("a", "a", None).await,
            Err(FailureReason::RemoteVanished)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_agent() {
        let connection = connection(Scripted::new(vec![running()]));
        let mut scheduler = MockScheduler::new();
        scheduler.expect_computer().returning(|_| None);
        let poller = ReadinessPoller::new(&connection, &scheduler, SECOND, None, CancellationToken::new());

        assert_eq!(
            poller.wait("a", "a", None).await,
            Err(FailureReason::AgentVanished)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_never_connects_times_out_in_second_phase() {
        let connection = connection(Scripted::new(vec![running()]));
        let scheduler = ready_scheduler(usize::MAX);
        let poller = ReadinessPoller::new(
            &connection,
            &scheduler,
            SECOND,
            Some(Duration::from_secs(30)),
            CancellationToken::new(),
        );

        assert!(matches!(
            poller.wait("a", "a", None).await,
            Err(FailureReason::Timeout {
                state: ReadinessState::WaitingAgentOnline,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_polling() {
        let connection = connection(Scripted::new(vec![pending()]));
        let scheduler = MockScheduler::new();
        let cancel = CancellationToken::new();
        let poller = ReadinessPoller::new(&connection, &scheduler, SECOND, None, cancel.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            cancel.cancel();
        });
        assert_eq!(poller.wait("a", "a", None).await, Err(FailureReason::Cancelled));
        canceller.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_status_error_keeps_polling() {
        let connection = connection(Scripted::replying(vec![
            Ok(pending()),
            Err(503),
            Err(429),
            Ok(running()),
        ]));
        let scheduler = ready_scheduler(0);
        let poller = ReadinessPoller::new(
            &connection,
            &scheduler,
            SECOND,
            Some(FIVE_MINUTES),
            CancellationToken::new(),
        );

        let online = poller.wait("a", "a", None).await.unwrap();
        assert_eq!(online.address.as_deref(), Some("10.1.2.3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_until_deadline_time_out() {
        let connection = connection(Scripted::replying(vec![Err(503)]));
        let scheduler = MockScheduler::new();
        let poller = ReadinessPoller::new(
            &connection,
            &scheduler,
            SECOND,
            Some(Duration::from_secs(30)),
            CancellationToken::new(),
        );

        assert!(matches!(
            poller.wait("a", "a", None).await,
            Err(FailureReason::Timeout {
                state: ReadinessState::WaitingRemoteRunning,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_error_fails_attempt() {
        let connection = connection(Scripted::replying(vec![Ok(pending()), Err(403)]));
        let scheduler = MockScheduler::new();
        let poller = ReadinessPoller::new(
            &connection,
            &scheduler,
            SECOND,
            Some(FIVE_MINUTES),
            CancellationToken::new(),
        );

        match poller.wait("a", "a", None).await {
            Err(FailureReason::Remote(message)) => assert!(message.contains("denied")),
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_status_call_times_out() {
        let connection = connection(Arc::new(Hanging));
        let scheduler = MockScheduler::new();
        let timeout = Duration::from_secs(30);
        let poller = ReadinessPoller::new(
            &connection,
            &scheduler,
            SECOND,
            Some(timeout),
            CancellationToken::new(),
        );

        let result = tokio::time::timeout(Duration::from_secs(3600), poller.wait("a", "a", None))
            .await
            .expect("poller must give up on its own deadline");
        match result {
            Err(FailureReason::Timeout { elapsed, state }) => {
                assert!(elapsed >= timeout);
                assert!(elapsed < timeout + SECOND);
                assert_eq!(state, ReadinessState::WaitingRemoteRunning);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_hung_status_call() {
        let connection = connection(Arc::new(Hanging));
        let scheduler = MockScheduler::new();
        let cancel = CancellationToken::new();
        let poller = ReadinessPoller::new(&connection, &scheduler, SECOND, None, cancel.clone());

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(3600), poller.wait("a", "a", None))
            .await
            .expect("cancelled poller must return");
        assert_eq!(result, Err(FailureReason::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_status_call_without_deadline_stops_on_cancel() {
        let connection = connection(Arc::new(Hanging));
        let scheduler = MockScheduler::new();
        let cancel = CancellationToken::new();
        let poller = ReadinessPoller::new(&connection, &scheduler, SECOND, None, cancel.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            cancel.cancel();
        });
        assert_eq!(poller.wait("a", "a", None).await, Err(FailureReason::Cancelled));
        canceller.await.unwrap();
    }
}
