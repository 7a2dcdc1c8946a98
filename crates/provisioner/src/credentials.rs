//! Credential lookup.
//!
//! Credentials are owned by the host scheduler; the provisioner only asks for
//! them by id when building a resource or opening a launch session.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;

/// Prefix of environment variables read by [`EnvCredentials`].
pub const CREDENTIAL_ENV_PREFIX: &str = "AGENT_CREDENTIAL_";

/// A resolved secret.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Login and password, used for registries and SSH.
    UsernamePassword { username: String, password: String },
    /// SSH private key.
    SshKey {
        username: String,
        private_key: String,
        passphrase: Option<String>,
    },
    /// Bearer token, used for the ARM API.
    Token(String),
}

impl Credential {
    /// Login name, when the credential has one.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        match self {
            Self::UsernamePassword { username, .. } | Self::SshKey { username, .. } => {
                Some(username)
            }
            Self::Token(_) => None,
        }
    }
}

// Secrets stay out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UsernamePassword { username, .. } => f
                .debug_struct("UsernamePassword")
                .field("username", username)
                .finish_non_exhaustive(),
            Self::SshKey { username, .. } => f
                .debug_struct("SshKey")
                .field("username", username)
                .finish_non_exhaustive(),
            Self::Token(_) => f.write_str("Token(..)"),
        }
    }
}

/// Lookup of credentials by id.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Resolve `id`, `None` when unknown.
    async fn lookup(&self, id: &str) -> Option<Credential>;
}

/// Fixed in-memory credentials.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    entries: HashMap<String, Credential>,
}

impl StaticCredentials {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a credential.
    #[must_use]
    pub fn with(mut self, id: impl Into<String>, credential: Credential) -> Self {
        self.entries.insert(id.into(), credential);
        self
    }
}

#[async_trait]
impl CredentialStore for StaticCredentials {
    async fn lookup(&self, id: &str) -> Option<Credential> {
        self.entries.get(id).cloned()
    }
}

/// Credentials read from `AGENT_CREDENTIAL_<ID>` environment variables.
///
/// The id is uppercased with `-` and `.` mapped to `_`. A value of the form
/// `user:password` becomes [`Credential::UsernamePassword`]; anything else
/// is a [`Credential::Token`].
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentials;

impl EnvCredentials {
    /// Environment variable consulted for `id`.
    #[must_use]
    pub fn variable(id: &str) -> String {
        let key: String = id
            .chars()
            .map(|c| match c {
                '-' | '.' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        format!("{CREDENTIAL_ENV_PREFIX}{key}")
    }

    fn parse(value: String) -> Credential {
        match value.split_once(':') {
            Some((username, password)) if !username.is_empty() => Credential::UsernamePassword {
                username: username.to_string(),
                password: password.to_string(),
            },
            _ => Credential::Token(value),
        }
    }
}

#[async_trait]
impl CredentialStore for EnvCredentials {
    async fn lookup(&self, id: &str) -> Option<Credential> {
        std::env::var(Self::variable(id)).ok().map(Self::parse)
    }
}
