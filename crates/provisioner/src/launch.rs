//! Pull-style launch: connect into the container and start the agent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::credentials::{Credential, CredentialStore};

/// File name of the agent executable on the remote side.
pub const AGENT_JAR: &str = "agent.jar";

/// Errors raised by a transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Host unreachable or refused the connection.
    #[error("connection failed: {0}")]
    Connect(String),

    /// Credentials rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Remote command exited non-zero.
    #[error("command '{command}' exited with {status}")]
    Command { command: String, status: i32 },

    /// Transfer or channel failure.
    #[error("I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// Only connection failures are worth another attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connect(_))
    }
}

/// Errors raised while launching an agent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    /// The SSH credential is missing or unusable.
    #[error("credential '{0}' not found or not usable for SSH")]
    Credential(String),

    /// Transport failure after retries.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Launch was cancelled.
    #[error("launch cancelled")]
    Cancelled,
}

/// An open remote shell.
#[async_trait]
pub trait Session: Send {
    /// Write `contents` to `path` on the remote host.
    async fn copy_file(&mut self, path: &str, contents: &[u8]) -> Result<(), TransportError>;

    /// Start `command` on the remote host without waiting for it to exit.
    async fn exec(&mut self, command: &str) -> Result<(), TransportError>;
}

/// Opens remote shells.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to `host:port` as the credential's user.
    async fn connect(
        &self,
        host: &str,
        port: u16,
        credential: &Credential,
    ) -> Result<Box<dyn Session>, TransportError>;
}

/// Connection retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            interval: Duration::from_secs(10),
        }
    }
}

/// Starts agents over a [`Transport`].
#[derive(Clone)]
pub struct SshLauncher {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    agent_jar: Arc<[u8]>,
    retry: RetryConfig,
}

impl SshLauncher {
    /// Launcher pushing `agent_jar` to every agent.
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialStore>,
        agent_jar: impl Into<Arc<[u8]>>,
    ) -> Self {
        Self {
            transport,
            credentials,
            agent_jar: agent_jar.into(),
            retry: RetryConfig::default(),
        }
    }

    /// Override the connection retry settings.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Copy the agent into `root_fs` on `host` and start it.
    ///
    /// # Errors
    /// Returns error if the credential is unusable, the host cannot be
    /// reached after retries, or a remote step fails.
    pub async fn launch(
        &self,
        agent: &str,
        host: &str,
        port: u16,
        credentials_id: &str,
        root_fs: &str,
        cancel: &CancellationToken,
    ) -> Result<(), LaunchError> {
        let credential = self
            .credentials
            .lookup(credentials_id)
            .await
            .filter(|c| c.username().is_some())
            .ok_or_else(|| LaunchError::Credential(credentials_id.to_string()))?;

        let mut session = self.connect(agent, host, port, &credential, cancel).await?;

        let root = root_fs.trim_end_matches('/');
        let jar_path = format!("{root}/{AGENT_JAR}");
        session.copy_file(&jar_path, &self.agent_jar).await?;
        info!(agent = %agent, path = %jar_path, "Copied agent executable");

        let command = format!("cd \"{root}\" && java -jar {AGENT_JAR}");
        session.exec(&command).await?;
        info!(agent = %agent, host = %host, "Started agent process");
        Ok(())
    }

    async fn connect(
        &self,
        agent: &str,
        host: &str,
        port: u16,
        credential: &Credential,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Session>, LaunchError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.transport.connect(host, port, credential).await {
                Ok(session) => return Ok(session),
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    warn!(
                        agent = %agent,
                        host = %host,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        error = %e,
                        "SSH connection failed, retrying in {:?}",
                        self.retry.interval
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Err(LaunchError::Cancelled),
                        () = tokio::time::sleep(self.retry.interval) => {}
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
