//! Shared-secret handshake
//!
//! A client presents `{username, secretkey}`. If the pair matches the
//! credential store, the server answers with its own identity assertion and
//! the connection is authenticated. There are no tokens and no expiry: the
//! flag lives as long as the connection.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::error::BackupError;
use crate::protocol::Credentials;
use crate::session::ConnectionContext;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Secret registered for `username`, if any
    async fn lookup(&self, username: &str) -> Result<Option<String>, BackupError>;
}

/// Fixed user map, typically from configuration
#[derive(Default)]
pub struct StaticCredentials {
    users: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new(users: HashMap<String, String>) -> Self {
        StaticCredentials { users }
    }
}

#[async_trait]
impl CredentialStore for StaticCredentials {
    async fn lookup(&self, username: &str) -> Result<Option<String>, BackupError> {
        Ok(self.users.get(username).cloned())
    }
}

/// Users table of the catalog
pub struct StoreCredentials {
    catalog: Catalog,
}

impl StoreCredentials {
    pub fn new(catalog: Catalog) -> Self {
        StoreCredentials { catalog }
    }
}

#[async_trait]
impl CredentialStore for StoreCredentials {
    async fn lookup(&self, username: &str) -> Result<Option<String>, BackupError> {
        Ok(self.catalog.user_secret(username).await?)
    }
}

/// Consults each layer in order; the first one that knows the user wins
pub struct LayeredCredentials {
    layers: Vec<Arc<dyn CredentialStore>>,
}

impl LayeredCredentials {
    pub fn new(layers: Vec<Arc<dyn CredentialStore>>) -> Self {
        LayeredCredentials { layers }
    }
}

#[async_trait]
impl CredentialStore for LayeredCredentials {
    async fn lookup(&self, username: &str) -> Result<Option<String>, BackupError> {
        for layer in &self.layers {
            if let Some(secret) = layer.lookup(username).await? {
                return Ok(Some(secret));
            }
        }
        Ok(None)
    }
}

/// Constant-time comparison of two secrets
pub fn secrets_match(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

/// Validate `presented` and, on success, send `identity` back over the
/// connection and mark it authenticated. The connection is left untouched on
/// failure; answering and closing is up to the caller.
pub async fn perform_handshake(
    ctx: &mut ConnectionContext,
    credentials: &dyn CredentialStore,
    identity: &Credentials,
    presented: &Credentials,
) -> Result<(), BackupError> {
    let known = credentials.lookup(&presented.username).await?;
    let valid = match &known {
        Some(secret) => secrets_match(secret, &presented.secretkey),
        None => false,
    };
    if !valid {
        debug!(
            conn = %ctx.id,
            username = %presented.username,
            known_user = known.is_some(),
            "handshake rejected"
        );
        return Err(BackupError::Authentication("invalid credentials".into()));
    }

    ctx.stream.send_message(identity).await?;
    ctx.authenticated = true;
    info!(conn = %ctx.id, peer = %ctx.peer, username = %presented.username, "client authenticated");
    Ok(())
}
