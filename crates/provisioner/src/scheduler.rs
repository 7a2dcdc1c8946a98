//! Interface to the host job scheduler.
//!
//! The provisioner never owns agent bookkeeping: it registers nodes with the
//! scheduler, asks it whether they are online, and removes them again.

use async_trait::async_trait;
use thiserror::Error;

use crate::agent::AgentNode;

/// Errors reported by the scheduler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// The scheduler refused the request.
    #[error("scheduler rejected {operation} for {node}: {message}")]
    Rejected {
        operation: &'static str,
        node: String,
        message: String,
    },

    /// The scheduler could not be reached.
    #[error("scheduler unavailable: {0}")]
    Unavailable(String),
}

/// Connection state of an agent as seen by the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComputerState {
    /// Connection channel is open.
    pub online: bool,
    /// Agent accepts new tasks.
    pub accepting_tasks: bool,
}

impl ComputerState {
    /// Online and accepting work.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.online && self.accepting_tasks
    }
}

/// Values substituted into template commands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentContext {
    /// Public URL of the scheduler.
    pub root_url: String,
    /// Agent name.
    pub node_name: String,
    /// Secret the agent presents when connecting back.
    pub secret: String,
    /// Encoded public identity of the scheduler instance.
    pub instance_identity: String,
}

impl AgentContext {
    /// Replace `${rootUrl}`, `${nodeName}`, `${secret}` and
    /// `${instanceIdentity}` in `input`. Other placeholders are left alone.
    #[must_use]
    pub fn expand(&self, input: &str) -> String {
        [
            ("${rootUrl}", self.root_url.as_str()),
            ("${nodeName}", self.node_name.as_str()),
            ("${secret}", self.secret.as_str()),
            ("${instanceIdentity}", self.instance_identity.as_str()),
        ]
        .iter()
        .fold(input.to_string(), |acc, (placeholder, value)| {
            if acc.contains(placeholder) {
                acc.replace(placeholder, value)
            } else {
                acc
            }
        })
    }
}

/// The host scheduler.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Register a node, replacing any node with the same name.
    async fn add_node(&self, node: &AgentNode) -> Result<(), SchedulerError>;

    /// Remove a node. Returns `false` when it did not exist.
    async fn remove_node(&self, name: &str) -> Result<bool, SchedulerError>;

    /// Connection state of a node, `None` when the node is unknown.
    async fn computer(&self, name: &str) -> Option<ComputerState>;

    /// Substitution values for a registered node.
    async fn agent_context(&self, name: &str) -> Result<AgentContext, SchedulerError>;

    /// Names of all nodes owned by `cloud`.
    async fn agents_for_cloud(&self, cloud: &str) -> Vec<String>;
}
