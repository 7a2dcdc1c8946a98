//! Remote container platforms used to host build agents.
//!
//! This crate hides the platform-specific request construction behind a
//! single [`RemoteResourceClient`] trait:
//!
//! - **Kubernetes** - one pod per agent, optionally with a registry pull secret
//! - **ACI** - Azure Container Instances, created through ARM template deployments
//!
//! The provisioner only ever sees [`ResourceSpec`] going in and
//! [`ResourceStatus`] coming back.

pub mod providers;

pub use providers::{
    aci, kubernetes, ContainerInstances, EnvVar, KubernetesPods, RegistryCredential, RemoteError,
    RemoteResourceClient, ResourcePhase, ResourceSpec, ResourceStatus, ResourceTags, TokenSource,
    VolumeSpec,
};
