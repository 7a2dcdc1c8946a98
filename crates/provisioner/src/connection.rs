//! Shared per-cloud connection to the remote platform.
//!
//! The client is built on first use and never replaced. Every remote call
//! checks out a [`ConnectionLease`], which holds one of the cloud's
//! `maxConcurrentRequests` permits until dropped. ACI access tokens are read
//! from the credential store again whenever ARM rejects the current one.

use std::ops::Deref;
use std::sync::Arc;

use agent_cloud::{
    ContainerInstances, KubernetesPods, RemoteError, RemoteResourceClient, TokenSource,
};
use async_trait::async_trait;
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore};
use tracing::info;

use crate::config::{CloudConfig, CloudKind};
use crate::credentials::{Credential, CredentialStore};

/// Lazily built client plus its concurrency limit.
pub struct CloudConnection {
    cloud: CloudConfig,
    client: OnceCell<Arc<dyn RemoteResourceClient>>,
    permits: Arc<Semaphore>,
    credentials: Arc<dyn CredentialStore>,
}

/// A checked-out client. Releases its permit on drop.
pub struct ConnectionLease {
    client: Arc<dyn RemoteResourceClient>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for ConnectionLease {
    type Target = dyn RemoteResourceClient;

    fn deref(&self) -> &Self::Target {
        self.client.as_ref()
    }
}

impl CloudConnection {
    /// Connection built from `cloud` on first lease.
    #[must_use]
    pub fn new(cloud: CloudConfig, credentials: Arc<dyn CredentialStore>) -> Self {
        let permits = Arc::new(Semaphore::new(cloud.max_concurrent_requests.max(1)));
        Self {
            cloud,
            client: OnceCell::new(),
            permits,
            credentials,
        }
    }

    /// Connection around an already built client.
    #[must_use]
    pub fn with_client(
        cloud: CloudConfig,
        credentials: Arc<dyn CredentialStore>,
        client: Arc<dyn RemoteResourceClient>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(cloud.max_concurrent_requests.max(1)));
        Self {
            cloud,
            client: OnceCell::from(client),
            permits,
            credentials,
        }
    }

    /// Whether the client has been built.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.client.initialized()
    }

    /// Permits currently free.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Check out the client, building it if needed.
    ///
    /// # Errors
    /// Returns error if the client cannot be built.
    pub async fn lease(&self) -> Result<ConnectionLease, RemoteError> {
        let client = self
            .client
            .get_or_try_init(|| self.connect())
            .await?
            .clone();
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| RemoteError::Config(format!("connection to {} closed", self.cloud.name)))?;
        Ok(ConnectionLease {
            client,
            _permit: permit,
        })
    }

    /// Stop handing out leases.
    pub fn close(&self) {
        self.permits.close();
    }

    async fn connect(&self) -> Result<Arc<dyn RemoteResourceClient>, RemoteError> {
        let client: Arc<dyn RemoteResourceClient> = match &self.cloud.kind {
            CloudKind::Kubernetes {
                namespace,
                kubeconfig: Some(path),
            } => Arc::new(KubernetesPods::from_kubeconfig(path, namespace.clone()).await?),
            CloudKind::Kubernetes {
                namespace,
                kubeconfig: None,
            } => Arc::new(KubernetesPods::try_default(namespace.clone()).await?),
            CloudKind::Aci {
                subscription_id,
                resource_group,
                location,
                credentials_id,
            } => {
                let tokens = StoredToken {
                    credentials: Arc::clone(&self.credentials),
                    id: credentials_id.clone(),
                };
                tokens.token().await?;
                Arc::new(ContainerInstances::with_token_source(
                    subscription_id.clone(),
                    resource_group.clone(),
                    Arc::new(tokens),
                    location.clone(),
                )?)
            }
        };
        info!(
            cloud = %self.cloud.name,
            platform = client.platform(),
            "Connected to remote platform"
        );
        Ok(client)
    }
}

/// ARM token looked up by credential id each time one is needed.
struct StoredToken {
    credentials: Arc<dyn CredentialStore>,
    id: String,
}

#[async_trait]
impl TokenSource for StoredToken {
    async fn token(&self) -> Result<String, RemoteError> {
        match self.credentials.lookup(&self.id).await {
            Some(Credential::Token(token)) => Ok(token),
            Some(_) => Err(RemoteError::Auth(format!(
                "credential {} is not a bearer token",
                self.id
            ))),
            None => Err(RemoteError::Auth(format!("credential {} not found", self.id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;

    fn aci_cloud(max: usize) -> CloudConfig {
        CloudConfig {
            name: "aci".to_string(),
            kind: CloudKind::Aci {
                subscription_id: "sub".to_string(),
                resource_group: "rg".to_string(),
                location: "eastus".to_string(),
                credentials_id: "azure".to_string(),
            },
            max_concurrent_requests: max,
            templates: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_lease_builds_client_once_and_releases_permit() {
        let store = StaticCredentials::new().with("azure", Credential::Token("t".to_string()));
        let connection = CloudConnection::new(aci_cloud(2), Arc::new(store));
        assert!(!connection.is_initialized());

        {
            let lease = connection.lease().await.unwrap();
            assert_eq!(lease.platform(), "aci");
            assert_eq!(connection.available_permits(), 1);
        }
        assert!(connection.is_initialized());
        assert_eq!(connection.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_missing_token_fails_without_caching() {
        let connection = CloudConnection::new(aci_cloud(1), Arc::new(StaticCredentials::new()));
        assert!(matches!(connection.lease().await, Err(RemoteError::Auth(_))));
        assert!(!connection.is_initialized());
    }

    /// Store whose token can be rotated.
    struct Rotating(std::sync::Mutex<String>);

    #[async_trait]
    impl CredentialStore for Rotating {
        async fn lookup(&self, _id: &str) -> Option<Credential> {
            Some(Credential::Token(self.0.lock().unwrap().clone()))
        }
    }

    #[tokio::test]
    async fn test_stored_token_follows_rotation() {
        let store = Arc::new(Rotating(std::sync::Mutex::new("first".to_string())));
        let tokens = StoredToken {
            credentials: store.clone(),
            id: "azure".to_string(),
        };
        assert_eq!(tokens.token().await.unwrap(), "first");

        *store.0.lock().unwrap() = "second".to_string();
        assert_eq!(tokens.token().await.unwrap(), "second");
    }

    #[tokio::test]
    async fn test_non_token_credential_is_rejected() {
        let store = StaticCredentials::new().with(
            "azure",
            Credential::UsernamePassword {
                username: "u".to_string(),
                password: "p".to_string(),
            },
        );
        let connection = CloudConnection::new(aci_cloud(1), Arc::new(store));
        match connection.lease().await {
            Err(RemoteError::Auth(message)) => assert!(message.contains("not a bearer token")),
            Err(other) => panic!("expected auth error, got {other}"),
            Ok(_) => panic!("expected auth error"),
        }
    }

    #[tokio::test]
    async fn test_closed_connection_refuses_leases() {
        let store = StaticCredentials::new().with("azure", Credential::Token("t".to_string()));
        let connection = CloudConnection::new(aci_cloud(1), Arc::new(store));
        connection.close();
        assert!(connection.lease().await.is_err());
    }
}
