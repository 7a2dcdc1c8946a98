//! Azure Container Instances platform.
//!
//! Each agent is a container group deployed through an ARM template. Groups
//! are tagged with `agentInstance`, `agentCloud` and `agentTemplate` so that
//! reclamation can find them.
//!
//! ## Deployment records
//!
//! Every creation leaves a deployment record in the resource group, tagged
//! like its group. The record is removed together with its group when it
//! reached `Succeeded`. Records left behind by a restart, and failed ones,
//! are removed by the reclamation sweep once they are older than 60 minutes
//! (succeeded) or 8 hours (failed). A record that cannot be deleted after
//! three sweeps is left alone.

mod auth;
mod client;
mod models;

pub use auth::{StaticToken, TokenSource};
pub use client::ContainerInstances;
pub use models::*;
