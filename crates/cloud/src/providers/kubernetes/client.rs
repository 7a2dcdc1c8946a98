//! Kubernetes pod client.

use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::{
    api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config, Error as KubeError,
};
use tracing::{debug, info, warn};

use super::models::{
    build_pod, build_registry_secret, owner_selector, pod_status, registry_secret_name,
};
use crate::providers::traits::{
    RemoteError, RemoteResourceClient, ResourceSpec, ResourceStatus, ResourceTags,
};

/// Field manager used for server-side apply.
const FIELD_MANAGER: &str = "agent-provisioner";

/// Lines of container output fetched for diagnostics.
const LOG_TAIL_LINES: i64 = 100;

/// Kubernetes platform: one pod per agent.
#[derive(Clone)]
pub struct KubernetesPods {
    /// Kubernetes client.
    client: Client,
    /// Namespace agents live in.
    namespace: String,
}

impl KubernetesPods {
    /// Create a platform client from an existing kube client.
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Connect using the in-cluster config or the default kubeconfig.
    ///
    /// # Errors
    /// Returns error if no usable configuration is found.
    pub async fn try_default(namespace: impl Into<String>) -> Result<Self, RemoteError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, namespace))
    }

    /// Connect using an explicit kubeconfig file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or does not describe a cluster.
    pub async fn from_kubeconfig(
        path: &Path,
        namespace: impl Into<String>,
    ) -> Result<Self, RemoteError> {
        let kubeconfig = Kubeconfig::read_from(path)
            .map_err(|e| RemoteError::Config(format!("{}: {e}", path.display())))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| RemoteError::Config(format!("{}: {e}", path.display())))?;
        let client = Client::try_from(config)?;
        Ok(Self::new(client, namespace))
    }

    /// Namespace agents are created in.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Create or replace the pull secret for a spec's registry logins.
    async fn apply_registry_secret(&self, spec: &ResourceSpec) -> Result<String, RemoteError> {
        let name = registry_secret_name(spec);
        let secret = build_registry_secret(&name, &self.namespace, &spec.registry_credentials)?;
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        secrets
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&secret),
            )
            .await?;
        debug!(secret = %name, "Applied registry secret");
        Ok(name)
    }
}

#[async_trait]
impl RemoteResourceClient for KubernetesPods {
    fn platform(&self) -> &'static str {
        "kubernetes"
    }

    async fn create(&self, spec: &ResourceSpec) -> Result<String, RemoteError> {
        if !spec.registry_credentials.is_empty() {
            self.apply_registry_secret(spec).await?;
        }

        let pod = build_pod(spec, &self.namespace)?;
        info!(pod = %spec.name, namespace = %self.namespace, image = %spec.image, "Creating agent pod");

        match self.pods().create(&PostParams::default(), &pod).await {
            Ok(_) => Ok(spec.name.clone()),
            Err(KubeError::Api(err)) => Err(RemoteError::Api {
                status: err.code,
                message: err.message,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<ResourceStatus>, RemoteError> {
        let pod = self.pods().get_opt(id).await?;
        Ok(pod.as_ref().map(pod_status))
    }

    async fn delete(&self, id: &str) -> Result<bool, RemoteError> {
        match self.pods().delete(id, &DeleteParams::default()).await {
            Ok(_) => {
                info!(pod = %id, "Deleted agent pod");
                Ok(true)
            }
            Err(KubeError::Api(err)) if err.code == 404 => {
                debug!(pod = %id, "Agent pod already gone");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, owner: &ResourceTags) -> Result<Vec<String>, RemoteError> {
        let selector = owner_selector(owner);
        let pods = self
            .pods()
            .list(&ListParams::default().labels(&selector))
            .await?;
        Ok(pods
            .items
            .into_iter()
            .filter_map(|pod| pod.metadata.name)
            .collect())
    }

    async fn logs(&self, id: &str) -> Result<Option<String>, RemoteError> {
        let params = LogParams {
            tail_lines: Some(LOG_TAIL_LINES),
            ..LogParams::default()
        };
        match self.pods().logs(id, &params).await {
            Ok(text) => Ok(Some(text)),
            Err(KubeError::Api(err)) if err.code == 404 || err.code == 400 => {
                // 400 means the container has not started yet
                warn!(pod = %id, code = err.code, "Pod logs unavailable");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}
