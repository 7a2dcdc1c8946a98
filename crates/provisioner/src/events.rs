//! Provisioning outcome events.
//!
//! Failures never propagate to whoever asked for capacity, so every outcome
//! is reported here instead.

use std::time::Duration;

use tracing::{error, info, warn};

/// Something worth telling operators about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionEvent {
    /// An agent came online.
    Provisioned {
        cloud: String,
        template: String,
        agent: String,
        elapsed: Duration,
    },
    /// A provisioning attempt failed and was unwound.
    ProvisionFailed {
        cloud: String,
        template: String,
        agent: String,
        reason: String,
    },
    /// An agent and its resource were removed.
    Terminated { cloud: String, agent: String },
    /// Removing an agent's resource failed.
    TerminateFailed {
        cloud: String,
        agent: String,
        reason: String,
    },
    /// A leaked resource was deleted by reclamation.
    Reclaimed { cloud: String, resource: String },
}

/// Receiver of provisioning events.
pub trait EventSink: Send + Sync {
    /// Handle one event. Must not block.
    fn emit(&self, event: ProvisionEvent);
}

/// Sink writing events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: ProvisionEvent) {
        match event {
            ProvisionEvent::Provisioned {
                cloud,
                template,
                agent,
                elapsed,
            } => info!(
                cloud = %cloud,
                template = %template,
                agent = %agent,
                elapsed_secs = elapsed.as_secs(),
                "Agent provisioned"
            ),
            ProvisionEvent::ProvisionFailed {
                cloud,
                template,
                agent,
                reason,
            } => error!(
                cloud = %cloud,
                template = %template,
                agent = %agent,
                reason = %reason,
                "Agent provisioning failed"
            ),
            ProvisionEvent::Terminated { cloud, agent } => {
                info!(cloud = %cloud, agent = %agent, "Agent terminated");
            }
            ProvisionEvent::TerminateFailed {
                cloud,
                agent,
                reason,
            } => warn!(cloud = %cloud, agent = %agent, reason = %reason, "Agent termination failed"),
            ProvisionEvent::Reclaimed { cloud, resource } => {
                info!(cloud = %cloud, resource = %resource, "Reclaimed orphaned resource");
            }
        }
    }
}
