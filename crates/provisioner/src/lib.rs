/*
 * Container Agents - On-demand build agents for container platforms
 * Copyright (C) 2025 Container Agents team
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Agent provisioning engine
//!
//! Turns "we need more agents with label X" into running, connected agents
//! on Kubernetes or Azure Container Instances, and cleans up after them:
//!
//! - [`registry`] resolves a label to a template
//! - [`orchestrator`] runs one task per requested agent
//! - [`poller`] waits for the resource and the agent to come up
//! - [`breaker`] backs off templates that keep failing
//! - [`reclaim`] deletes resources nobody owns anymore

pub mod agent;
pub mod breaker;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod events;
pub mod label;
pub mod launch;
pub mod naming;
pub mod orchestrator;
pub mod poller;
pub mod reclaim;
pub mod registry;
pub mod retention;
pub mod scheduler;
pub mod template;

pub use agent::AgentNode;
pub use breaker::ProvisionBackoff;
pub use config::{CloudConfig, CloudKind, ConfigError, ProvisionerConfig};
pub use credentials::{Credential, CredentialStore, EnvCredentials, StaticCredentials};
pub use error::ProvisionError;
pub use events::{EventSink, ProvisionEvent, TracingSink};
pub use label::LabelExpr;
pub use launch::{Session, SshLauncher, Transport, TransportError};
pub use orchestrator::{CloudRuntime, PlannedAgent, Provisioner, ProvisionerBuilder};
pub use poller::{FailureReason, ReadinessState};
pub use reclaim::{ReclaimReport, Reclaimer};
pub use registry::TemplateRegistry;
pub use retention::{ComputerActivity, RetentionDecision, RetentionPolicy};
pub use scheduler::{AgentContext, ComputerState, Scheduler, SchedulerError};
pub use template::{AgentTemplate, LaunchMethod};
