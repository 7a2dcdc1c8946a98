//! Azure Container Instances client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::auth::{StaticToken, TokenCache, TokenSource};
use super::models::{
    deployment_request, ContainerGroup, ContainerGroupListResponse, ContainerLogs, Deployment,
    DeploymentListResponse, ACI_API_VERSION, DEPLOYMENT_API_VERSION,
};
use crate::providers::traits::{
    RemoteError, RemoteResourceClient, ResourcePhase, ResourceSpec, ResourceStatus, ResourceTags,
};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Azure Resource Manager endpoint.
const ARM_ENDPOINT: &str = "https://management.azure.com";

/// Lines of container output fetched for diagnostics.
const LOG_TAIL_LINES: u32 = 100;

/// Sweeps that may fail to delete a deployment record before it is left alone.
pub const MAX_DEPLOYMENT_DELETE_ATTEMPTS: u32 = 3;

/// Azure Container Instances platform.
///
/// Container groups are created through resource group deployments. The
/// deployment record created for each group is remembered so that it can be
/// cleaned up together with the group. Records this process no longer knows
/// about are found by their tags in [`RemoteResourceClient::prune_records`].
#[derive(Clone)]
pub struct ContainerInstances {
    /// HTTP client.
    client: Client,
    /// ARM endpoint, overridable for tests.
    base_url: String,
    /// Subscription ID.
    subscription_id: String,
    /// Resource group.
    resource_group: String,
    /// Where access tokens come from.
    tokens: Arc<dyn TokenSource>,
    /// Token currently in use.
    token: Arc<TokenCache>,
    /// Location new groups are created in.
    location: String,
    /// Container group name to deployment name.
    deployments: Arc<DashMap<String, String>>,
    /// Failed deletes per deployment record.
    delete_attempts: Arc<DashMap<String, u32>>,
}

impl ContainerInstances {
    /// Create a new ACI client with a fixed access token.
    ///
    /// # Arguments
    /// * `subscription_id` - Azure subscription ID
    /// * `resource_group` - Resource group name
    /// * `access_token` - `OAuth2` access token
    /// * `location` - Location for new container groups (e.g., "eastus")
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(
        subscription_id: impl Into<String>,
        resource_group: impl Into<String>,
        access_token: impl Into<String>,
        location: impl Into<String>,
    ) -> Result<Self, RemoteError> {
        Self::with_token_source(
            subscription_id,
            resource_group,
            Arc::new(StaticToken::new(access_token)),
            location,
        )
    }

    /// Create a new ACI client that fetches tokens from `tokens`, asking
    /// again whenever ARM answers 401.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn with_token_source(
        subscription_id: impl Into<String>,
        resource_group: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
        location: impl Into<String>,
    ) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(RemoteError::Http)?;

        Ok(Self {
            client,
            base_url: ARM_ENDPOINT.to_string(),
            subscription_id: subscription_id.into(),
            resource_group: resource_group.into(),
            tokens,
            token: Arc::new(TokenCache::default()),
            location: location.into(),
            deployments: Arc::new(DashMap::new()),
            delete_attempts: Arc::new(DashMap::new()),
        })
    }

    /// Point the client at a different ARM endpoint.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Deployment recorded for a container group, if any.
    #[must_use]
    pub fn deployment_for(&self, group: &str) -> Option<String> {
        self.deployments.get(group).map(|d| d.value().clone())
    }

    /// Get Azure Resource Manager base URL.
    fn arm_base_url(&self) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}",
            self.base_url, self.subscription_id, self.resource_group
        )
    }

    fn group_path(&self, name: &str) -> String {
        format!(
            "{}/providers/Microsoft.ContainerInstance/containerGroups/{name}",
            self.arm_base_url()
        )
    }

    fn group_url(&self, name: &str) -> String {
        format!("{}?api-version={ACI_API_VERSION}", self.group_path(name))
    }

    fn deployment_url(&self, name: &str) -> String {
        format!(
            "{}/providers/Microsoft.Resources/deployments/{name}?api-version={DEPLOYMENT_API_VERSION}",
            self.arm_base_url()
        )
    }

    /// Send an authenticated request, refreshing the token once on 401.
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, RemoteError> {
        debug!(method = %method, url = %url, "ARM request");

        let mut refresh = false;
        loop {
            let token = self.token.get(self.tokens.as_ref(), refresh).await?;
            let mut request = self.client.request(method.clone(), url).bearer_auth(token);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await?;

            if response.status() == StatusCode::UNAUTHORIZED && !refresh {
                warn!(url = %url, "Access token rejected, fetching a new one");
                refresh = true;
                continue;
            }
            return Ok(response);
        }
    }

    /// Make an authenticated GET request.
    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, RemoteError> {
        let response = self.send(Method::GET, url, None).await?;
        Self::handle_response(response).await
    }

    /// Make an authenticated PUT request.
    async fn put<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        body: &Value,
    ) -> Result<T, RemoteError> {
        let response = self.send(Method::PUT, url, Some(body)).await?;
        Self::handle_response(response).await
    }

    /// Make an authenticated DELETE request. Returns `false` on 404.
    async fn delete_url(&self, url: &str) -> Result<bool, RemoteError> {
        let response = self.send(Method::DELETE, url, None).await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            Ok(false)
        } else if status.is_success() {
            Ok(true)
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(Self::error_for(status, text))
        }
    }

    fn error_for(status: StatusCode, text: String) -> RemoteError {
        if status == StatusCode::NOT_FOUND {
            RemoteError::NotFound(text)
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            RemoteError::Auth(text)
        } else {
            RemoteError::Api {
                status: status.as_u16(),
                message: text,
            }
        }
    }

    /// Handle API response.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, RemoteError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                RemoteError::Serialization(e)
            })
        } else {
            Err(Self::error_for(status, text))
        }
    }

    /// Status of a group that does not exist yet, judged by its deployment.
    async fn deployment_status(&self, group: &str) -> Result<Option<ResourceStatus>, RemoteError> {
        let Some(name) = self.deployment_for(group) else {
            return Ok(None);
        };

        match self.get_json::<Deployment>(&self.deployment_url(&name)).await {
            Ok(deployment) if deployment.failed() => {
                let message = deployment
                    .properties
                    .error
                    .map(|e| e.message)
                    .unwrap_or_default();
                Ok(Some(
                    ResourceStatus::new(ResourcePhase::Failed)
                        .with_detail(format!("deployment {name} failed: {message}")),
                ))
            }
            // Deployment finished but the group is gone.
            Ok(deployment) if deployment.succeeded() => Ok(None),
            Ok(_) => Ok(Some(ResourceStatus::new(ResourcePhase::Pending))),
            Err(RemoteError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete a deployment record, but only once it has succeeded.
    async fn cleanup_deployment(&self, name: &str) -> Result<(), RemoteError> {
        let url = self.deployment_url(name);
        let deployment = match self.get_json::<Deployment>(&url).await {
            Ok(d) => d,
            Err(RemoteError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        if deployment.succeeded() {
            self.delete_url(&url).await?;
            info!(deployment = %name, "Deleted deployment record");
        } else {
            debug!(
                deployment = %name,
                state = %deployment.properties.provisioning_state,
                "Keeping deployment record"
            );
        }
        Ok(())
    }

    fn has_attempts_left(&self, deployment: &str) -> bool {
        self.delete_attempts
            .get(deployment)
            .is_none_or(|a| *a < MAX_DEPLOYMENT_DELETE_ATTEMPTS)
    }

    /// Delete finished deployment records of `owner` past their retention.
    async fn sweep_deployments(&self, owner: &ResourceTags) -> Result<Vec<String>, RemoteError> {
        let now = Utc::now();
        let mut url = Some(format!(
            "{}/providers/Microsoft.Resources/deployments?api-version={DEPLOYMENT_API_VERSION}",
            self.arm_base_url()
        ));
        let mut expired = Vec::new();

        while let Some(page_url) = url.take() {
            let page: DeploymentListResponse = self.get_json(&page_url).await?;
            expired.extend(
                page.value
                    .into_iter()
                    .filter(|d| d.is_owned_by(owner) && d.is_expired(now))
                    .map(|d| d.name)
                    .filter(|name| self.has_attempts_left(name)),
            );
            url = page.next_link;
        }

        let mut removed = Vec::new();
        for name in expired {
            match self.delete_url(&self.deployment_url(&name)).await {
                Ok(_) => {
                    info!(deployment = %name, "Deleted expired deployment record");
                    self.delete_attempts.remove(&name);
                    self.deployments.retain(|_, d| d != &name);
                    removed.push(name);
                }
                Err(e) => {
                    let attempts = {
                        let mut attempts = self.delete_attempts.entry(name.clone()).or_insert(0);
                        *attempts += 1;
                        *attempts
                    };
                    let message = if attempts >= MAX_DEPLOYMENT_DELETE_ATTEMPTS {
                        "Giving up on deployment record"
                    } else {
                        "Failed to delete deployment record"
                    };
                    warn!(deployment = %name, error = %e, attempts, "{message}");
                }
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl RemoteResourceClient for ContainerInstances {
    fn platform(&self) -> &'static str {
        "aci"
    }

    async fn create(&self, spec: &ResourceSpec) -> Result<String, RemoteError> {
        let deployment = spec
            .deployment
            .clone()
            .unwrap_or_else(|| format!("{}-deployment", spec.name));

        info!(
            group = %spec.name,
            deployment = %deployment,
            location = %self.location,
            image = %spec.image,
            "Deploying container group"
        );

        let body = deployment_request(spec, &self.location);
        let _: Value = self.put(&self.deployment_url(&deployment), &body).await?;

        self.deployments.insert(spec.name.clone(), deployment);
        Ok(spec.name.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<ResourceStatus>, RemoteError> {
        match self.get_json::<ContainerGroup>(&self.group_url(id)).await {
            Ok(group) => Ok(Some(group.status())),
            Err(RemoteError::NotFound(_)) => self.deployment_status(id).await,
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool, RemoteError> {
        let existed = self.delete_url(&self.group_url(id)).await?;
        if existed {
            info!(group = %id, "Deleted container group");
        }

        if let Some((_, deployment)) = self.deployments.remove(id) {
            if let Err(e) = self.cleanup_deployment(&deployment).await {
                warn!(deployment = %deployment, error = %e, "Failed to clean up deployment record");
            }
        }
        Ok(existed)
    }

    async fn list(&self, owner: &ResourceTags) -> Result<Vec<String>, RemoteError> {
        let mut url = Some(format!(
            "{}/providers/Microsoft.ContainerInstance/containerGroups?api-version={ACI_API_VERSION}",
            self.arm_base_url()
        ));
        let mut names = Vec::new();

        while let Some(page_url) = url.take() {
            let page: ContainerGroupListResponse = self.get_json(&page_url).await?;
            names.extend(
                page.value
                    .into_iter()
                    .filter(|g| g.is_owned_by(owner))
                    .map(|g| g.name),
            );
            url = page.next_link;
        }

        Ok(names)
    }

    async fn logs(&self, id: &str) -> Result<Option<String>, RemoteError> {
        let url = format!(
            "{}/containers/{id}/logs?api-version={ACI_API_VERSION}&tail={LOG_TAIL_LINES}",
            self.group_path(id)
        );
        match self.get_json::<ContainerLogs>(&url).await {
            Ok(logs) => Ok(Some(logs.content)),
            Err(RemoteError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn prune_records(&self, owner: &ResourceTags) -> Result<Vec<String>, RemoteError> {
        self.sweep_deployments(owner).await
    }
}
