//! Per-owner credentials supplied by an external vault.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::events::{EventBus, GatewayEvent};
use crate::oauth::{OAuthCredential, RefreshObserver};
use crate::ApiError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VaultError {
    #[error("credential vault unavailable: {0}")]
    Unavailable(String),
}

impl From<VaultError> for ApiError {
    fn from(error: VaultError) -> Self {
        ApiError::internal(error.to_string()).with_retryable(true)
    }
}

pub type VaultFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, VaultError>> + Send + 'a>>;

/// Source of API keys and OAuth credentials, keyed by owner.
pub trait CredentialVault: Send + Sync {
    fn api_key_for_owner<'a>(&'a self, owner_id: &'a str) -> VaultFuture<'a, Option<String>>;

    fn oauth_credential<'a>(
        &'a self,
        owner_id: &'a str,
    ) -> VaultFuture<'a, Option<OAuthCredential>>;

    /// Store a credential produced by a refresh so later calls start from it.
    fn persist_refreshed_credential<'a>(
        &'a self,
        owner_id: &'a str,
        credential: OAuthCredential,
    ) -> VaultFuture<'a, ()>;
}

#[derive(Debug, Default)]
struct VaultEntries {
    api_keys: HashMap<String, String>,
    oauth: HashMap<String, OAuthCredential>,
    persisted: usize,
}

/// Vault kept in process memory. Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct InMemoryVault {
    entries: Arc<RwLock<VaultEntries>>,
}

impl InMemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_api_key(self, owner_id: impl Into<String>, key: impl Into<String>) -> Self {
        self.write().api_keys.insert(owner_id.into(), key.into());
        self
    }

    #[must_use]
    pub fn with_oauth_credential(
        self,
        owner_id: impl Into<String>,
        credential: OAuthCredential,
    ) -> Self {
        self.write().oauth.insert(owner_id.into(), credential);
        self
    }

    /// Number of refreshed credentials written back so far.
    pub fn persisted_count(&self) -> usize {
        self.read().persisted
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, VaultEntries> {
        self.entries
            .read()
            .expect("vault lock should not be poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, VaultEntries> {
        self.entries
            .write()
            .expect("vault lock should not be poisoned")
    }
}

impl CredentialVault for InMemoryVault {
    fn api_key_for_owner<'a>(&'a self, owner_id: &'a str) -> VaultFuture<'a, Option<String>> {
        let key = self.read().api_keys.get(owner_id).cloned();
        Box::pin(async move { Ok(key) })
    }

    fn oauth_credential<'a>(
        &'a self,
        owner_id: &'a str,
    ) -> VaultFuture<'a, Option<OAuthCredential>> {
        let credential = self.read().oauth.get(owner_id).cloned();
        Box::pin(async move { Ok(credential) })
    }

    fn persist_refreshed_credential<'a>(
        &'a self,
        owner_id: &'a str,
        credential: OAuthCredential,
    ) -> VaultFuture<'a, ()> {
        {
            let mut entries = self.write();
            entries.oauth.insert(owner_id.to_owned(), credential);
            entries.persisted += 1;
        }
        Box::pin(async { Ok(()) })
    }
}

/// Writes refreshed credentials back to the vault and announces them.
pub struct VaultRefreshObserver {
    vault: Arc<dyn CredentialVault>,
    owner_id: String,
    events: EventBus,
}

impl VaultRefreshObserver {
    pub fn new(
        vault: Arc<dyn CredentialVault>,
        owner_id: impl Into<String>,
        events: EventBus,
    ) -> Self {
        Self {
            vault,
            owner_id: owner_id.into(),
            events,
        }
    }
}

impl RefreshObserver for VaultRefreshObserver {
    fn on_refresh<'a>(
        &'a self,
        credential: &'a OAuthCredential,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if let Err(error) = self
                .vault
                .persist_refreshed_credential(&self.owner_id, credential.clone())
                .await
            {
                // The refreshed token still works for this call.
                tracing::warn!(
                    owner_id = %self.owner_id,
                    %error,
                    "failed to persist refreshed credential"
                );
            }
            self.events.publish(GatewayEvent::CredentialRefreshed {
                owner_id: Some(self.owner_id.clone()),
            });
        })
    }
}
