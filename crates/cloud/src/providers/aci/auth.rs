//! Bearer tokens for the ARM API.

use std::sync::RwLock;

use async_trait::async_trait;

use crate::providers::traits::RemoteError;

/// Source of ARM access tokens.
///
/// Tokens expire, so the client asks again whenever ARM rejects the one it
/// holds.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// A currently valid access token.
    async fn token(&self) -> Result<String, RemoteError>;
}

/// A fixed token that is never refreshed.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    /// Wrap `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<String, RemoteError> {
        Ok(self.0.clone())
    }
}

/// Last token handed out by a [`TokenSource`].
#[derive(Default)]
pub(crate) struct TokenCache {
    current: RwLock<Option<String>>,
}

impl TokenCache {
    /// Cached token, fetching a new one when empty or when `refresh` is set.
    pub(crate) async fn get(
        &self,
        source: &dyn TokenSource,
        refresh: bool,
    ) -> Result<String, RemoteError> {
        if !refresh {
            if let Some(token) = self.current.read().ok().and_then(|t| t.clone()) {
                return Ok(token);
            }
        }
        let token = source.token().await?;
        if let Ok(mut current) = self.current.write() {
            *current = Some(token.clone());
        }
        Ok(token)
    }
}
