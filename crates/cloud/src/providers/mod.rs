//! Remote platform abstractions.
//!
//! This module defines the common trait and types shared by every platform.

pub mod aci;
pub mod kubernetes;
mod traits;

pub use traits::{
    EnvVar, RegistryCredential, RemoteError, RemoteResourceClient, ResourcePhase, ResourceSpec,
    ResourceStatus, ResourceTags, VolumeSpec,
};

// Re-export platform clients
pub use aci::{ContainerInstances, TokenSource};
pub use kubernetes::KubernetesPods;
