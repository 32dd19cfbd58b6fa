//! Host repository
//!
//! Persistence seam for registered hosts. Registration goes through the async
//! [`HostRepository`]; request authentication only needs the synchronous
//! [`CredentialStore`] lookup.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, info};

use super::record::HostRecord;

/// Result of persisting a verified host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Created,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    /// The key or base URL is already held with a different credential
    #[error("host already registered with a different credential")]
    CredentialConflict,

    #[error("repository backend failure: {0}")]
    Backend(String),
}

/// Storage for registered hosts
#[async_trait]
pub trait HostRepository: Send + Sync {
    async fn find_by_key(&self, key: &str) -> Result<Option<HostRecord>, RepositoryError>;

    async fn find_by_base_url(&self, base_url: &str)
        -> Result<Option<HostRecord>, RepositoryError>;

    /// Persist a record whose credential has already been verified.
    ///
    /// Must check for a conflicting credential and write in one atomic step:
    /// an existing record under the same key or base URL with a different
    /// credential is left untouched and `CredentialConflict` returned.
    /// Moving a key to another base URL, or taking over a base URL held by
    /// another key, is also a conflict unless the credential is a matching
    /// shared secret.
    async fn save_verified(&self, record: HostRecord) -> Result<SaveOutcome, RepositoryError>;

    async fn remove(&self, key: &str) -> Result<bool, RepositoryError>;
}

/// Issuer lookup used while authenticating inbound requests
pub trait CredentialStore: Send + Sync {
    /// Host registered under `issuer`, if any
    fn find_host(&self, issuer: &str) -> Option<HostRecord>;
}

#[derive(Default)]
struct Hosts {
    by_key: HashMap<String, HostRecord>,
    key_by_base_url: HashMap<String, String>,
}

/// Process-local repository
#[derive(Default)]
pub struct InMemoryHostRepository {
    hosts: RwLock<Hosts>,
}

impl InMemoryHostRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.hosts.read().map(|h| h.by_key.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> RepositoryError {
    RepositoryError::Backend("host repository lock poisoned".into())
}

#[async_trait]
impl HostRepository for InMemoryHostRepository {
    async fn find_by_key(&self, key: &str) -> Result<Option<HostRecord>, RepositoryError> {
        let hosts = self.hosts.read().map_err(|_| poisoned())?;
        Ok(hosts.by_key.get(key).cloned())
    }

    async fn find_by_base_url(
        &self,
        base_url: &str,
    ) -> Result<Option<HostRecord>, RepositoryError> {
        let hosts = self.hosts.read().map_err(|_| poisoned())?;
        Ok(hosts
            .key_by_base_url
            .get(base_url)
            .and_then(|key| hosts.by_key.get(key))
            .cloned())
    }

    async fn save_verified(&self, mut record: HostRecord) -> Result<SaveOutcome, RepositoryError> {
        let mut hosts = self.hosts.write().map_err(|_| poisoned())?;

        let existing = hosts.by_key.get(&record.key).cloned();
        let url_owner = hosts
            .key_by_base_url
            .get(&record.base_url)
            .filter(|owner| **owner != record.key)
            .and_then(|owner| hosts.by_key.get(owner))
            .cloned();

        for held in existing.iter().chain(url_owner.iter()) {
            if !held.credential.matches(&record.credential) {
                debug!(
                    key = %record.key,
                    base_url = %record.base_url,
                    held_by = %held.key,
                    "Refusing to overwrite host credential"
                );
                return Err(RepositoryError::CredentialConflict);
            }
        }

        let moved = existing
            .as_ref()
            .is_some_and(|current| current.base_url != record.base_url);
        if (moved || url_owner.is_some()) && !record.credential.proves_ownership() {
            debug!(
                key = %record.key,
                base_url = %record.base_url,
                "Refusing to move host without a shared secret"
            );
            return Err(RepositoryError::CredentialConflict);
        }

        // Same shared secret under a new install key: the old key is retired
        if let Some(previous) = &url_owner {
            hosts.by_key.remove(&previous.key);
            info!(old_key = %previous.key, new_key = %record.key, "Host re-keyed");
        }

        let outcome = match &existing {
            Some(current) => {
                record.registered_at = current.registered_at;
                if current.base_url != record.base_url {
                    hosts.key_by_base_url.remove(&current.base_url);
                }
                SaveOutcome::Updated
            }
            None if url_owner.is_some() => SaveOutcome::Updated,
            None => SaveOutcome::Created,
        };
        record.updated_at = Utc::now();

        hosts
            .key_by_base_url
            .insert(record.base_url.clone(), record.key.clone());
        hosts.by_key.insert(record.key.clone(), record);

        Ok(outcome)
    }

    async fn remove(&self, key: &str) -> Result<bool, RepositoryError> {
        let mut hosts = self.hosts.write().map_err(|_| poisoned())?;
        match hosts.by_key.remove(key) {
            Some(record) => {
                hosts.key_by_base_url.remove(&record.base_url);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl CredentialStore for InMemoryHostRepository {
    fn find_host(&self, issuer: &str) -> Option<HostRecord> {
        self.hosts.read().ok()?.by_key.get(issuer).cloned()
    }
}
