//! Provisioning errors.

use std::time::Duration;

use agent_cloud::RemoteError;
use thiserror::Error;

use crate::label::LabelParseError;
use crate::poller::FailureReason;
use crate::scheduler::SchedulerError;

/// Errors surfaced by the provisioner.
///
/// Admission errors (`UnknownCloud`, `InvalidLabel`, `NoTemplate`,
/// `CircuitOpen`) are returned synchronously and never reach the backoff
/// gate. Everything else ends a single provisioning task.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// No cloud with that name is configured.
    #[error("unknown cloud '{0}'")]
    UnknownCloud(String),

    /// The requested label expression does not parse.
    #[error("invalid label expression: {0}")]
    InvalidLabel(#[from] LabelParseError),

    /// No template of the cloud matches the requested label.
    #[error("no template in cloud '{cloud}' matches label '{label}'")]
    NoTemplate { cloud: String, label: String },

    /// The template is backing off after recent failures.
    #[error("template '{template}' is backing off, retry in {retry_in:?}")]
    CircuitOpen { template: String, retry_in: Duration },

    /// The scheduler refused the agent record.
    #[error("failed to register agent: {0}")]
    Registration(#[from] SchedulerError),

    /// A credential referenced by the template is missing.
    #[error("credential '{0}' not found")]
    MissingCredential(String),

    /// The remote platform rejected a call.
    #[error("remote platform error: {0}")]
    Remote(#[from] RemoteError),

    /// The agent never became ready.
    #[error("agent '{agent}' failed to start: {reason}")]
    Readiness { agent: String, reason: FailureReason },

    /// The launch method cannot be carried out.
    #[error("launch failed: {0}")]
    Launch(String),

    /// The provisioner is shutting down.
    #[error("provisioning cancelled")]
    Cancelled,
}

impl ProvisionError {
    /// Whether the error was raised before any task was scheduled.
    #[must_use]
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            Self::UnknownCloud(_)
                | Self::InvalidLabel(_)
                | Self::NoTemplate { .. }
                | Self::CircuitOpen { .. }
        )
    }
}
