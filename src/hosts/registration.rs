//! Host registration handshake
//!
//! A host installing the add-on claims a key, base URL and public key. The
//! claim is only trusted once the host's own consumer info endpoint publishes
//! the same public key:
//!
//! 1. Validate and normalize the claim
//! 2. Fetch the consumer info from `{base_url}/plugins/servlet/oauth/consumer-info`
//! 3. Compare the published key with the claimed one
//! 4. Persist, unless the key or base URL is already held with a different
//!    credential, or would move without a matching shared secret
//!
//! Registrations for the same base URL are serialized.

use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use url::Url;

use super::consumer_info::{consumer_info_url, parse_consumer_info, ConsumerInfoClient};
use super::record::{public_keys_match, Credential, HostRecord};
use super::registry::{HostRepository, RepositoryError, SaveOutcome};
use crate::types::RegistrationError;

/// Default bound on the consumer info fetch
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// An install callback's claim
#[derive(Clone, Default)]
pub struct HostRegistration {
    pub key: String,
    pub base_url: String,
    pub public_key: String,
    pub shared_secret: Option<String>,
    pub product_type: Option<String>,
    pub display_name: Option<String>,
}

impl HostRegistration {
    pub fn new(
        key: impl Into<String>,
        base_url: impl Into<String>,
        public_key: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            base_url: base_url.into(),
            public_key: public_key.into(),
            ..Default::default()
        }
    }

    pub fn with_shared_secret(mut self, secret: impl Into<String>) -> Self {
        self.shared_secret = Some(secret.into());
        self
    }

    pub fn with_product_type(mut self, product_type: impl Into<String>) -> Self {
        self.product_type = Some(product_type.into());
        self
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    /// Trim fields and check the claim is well formed
    fn validated(mut self) -> Result<Self, RegistrationError> {
        self.key = self.key.trim().to_string();
        self.public_key = self.public_key.trim().to_string();
        self.base_url = normalize_base_url(&self.base_url)?;
        self.shared_secret = self.shared_secret.filter(|s| !s.is_empty());

        if self.key.is_empty() {
            return Err(RegistrationError::InvalidRegistration(
                "key is required".into(),
            ));
        }
        if self.public_key.is_empty() {
            return Err(RegistrationError::InvalidRegistration(
                "public key is required".into(),
            ));
        }

        Ok(self)
    }

    fn credential(&self) -> Credential {
        match &self.shared_secret {
            Some(secret) => Credential::SharedSecret(secret.clone()),
            None => Credential::PublicKey(self.public_key.clone()),
        }
    }
}

impl fmt::Debug for HostRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRegistration")
            .field("key", &self.key)
            .field("base_url", &self.base_url)
            .field("shared_secret", &self.shared_secret.as_ref().map(|_| ".."))
            .field("product_type", &self.product_type)
            .field("display_name", &self.display_name)
            .finish_non_exhaustive()
    }
}

/// Absolute http(s) URL without query, fragment or trailing slash
pub fn normalize_base_url(base_url: &str) -> Result<String, RegistrationError> {
    let trimmed = base_url.trim();
    let url = Url::parse(trimmed).map_err(|e| {
        RegistrationError::InvalidRegistration(format!("base URL is not an absolute URL: {e}"))
    })?;

    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(RegistrationError::InvalidRegistration(
            "base URL must be an http(s) URL".into(),
        ));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(RegistrationError::InvalidRegistration(
            "base URL must not carry a query or fragment".into(),
        ));
    }

    Ok(url.as_str().trim_end_matches('/').to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Created(HostRecord),
    Updated(HostRecord),
}

impl RegistrationOutcome {
    pub fn record(&self) -> &HostRecord {
        match self {
            Self::Created(record) | Self::Updated(record) => record,
        }
    }

    pub fn into_record(self) -> HostRecord {
        match self {
            Self::Created(record) | Self::Updated(record) => record,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    /// Upper bound on the consumer info fetch
    pub fetch_timeout: Duration,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

/// A handle on one base URL's registration lock.
///
/// Dropping the last handle removes the map entry, including when the
/// registration future is dropped before completing.
struct BaseUrlLock<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    base_url: String,
    mutex: Arc<Mutex<()>>,
}

impl<'a> BaseUrlLock<'a> {
    fn acquire(locks: &'a DashMap<String, Arc<Mutex<()>>>, base_url: String) -> Self {
        let mutex = locks
            .entry(base_url.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        Self {
            locks,
            base_url,
            mutex,
        }
    }
}

impl Drop for BaseUrlLock<'_> {
    fn drop(&mut self) {
        // Two strong references left: the map's and this handle's
        self.locks.remove_if(&self.base_url, |_, lock| {
            Arc::ptr_eq(lock, &self.mutex) && Arc::strong_count(lock) == 2
        });
    }
}

/// Verifies and persists hosts
pub struct HostRegistrationService<R: HostRepository, C: ConsumerInfoClient> {
    config: RegistrationConfig,
    repository: Arc<R>,
    client: Arc<C>,
    /// One lock per base URL with a registration in flight
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl<R: HostRepository, C: ConsumerInfoClient> HostRegistrationService<R, C> {
    pub fn new(config: RegistrationConfig, repository: Arc<R>, client: Arc<C>) -> Self {
        Self {
            config,
            repository,
            client,
            locks: DashMap::new(),
        }
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repository
    }

    /// Run the registration handshake for a host
    #[instrument(skip(self, registration), fields(key = %registration.key, base_url = %registration.base_url))]
    pub async fn register_host(
        &self,
        registration: HostRegistration,
    ) -> Result<RegistrationOutcome, RegistrationError> {
        let registration = registration.validated()?;

        let slot = BaseUrlLock::acquire(&self.locks, registration.base_url.clone());
        let _guard = slot.mutex.lock().await;
        self.register_locked(registration).await
    }

    async fn register_locked(
        &self,
        registration: HostRegistration,
    ) -> Result<RegistrationOutcome, RegistrationError> {
        let published = self.fetch_public_key(&registration.base_url).await?;

        if !public_keys_match(&published, &registration.public_key) {
            warn!(
                key = %registration.key,
                base_url = %registration.base_url,
                "Claimed public key does not match the key published by the host"
            );
            return Err(RegistrationError::MismatchPublicKey);
        }

        let mut record = HostRecord::new(
            registration.key.clone(),
            registration.base_url.clone(),
            registration.public_key.clone(),
            registration.credential(),
        );
        record.product_type = registration.product_type;
        record.display_name = registration.display_name;

        match self.repository.save_verified(record.clone()).await {
            Ok(SaveOutcome::Created) => {
                info!(key = %record.key, credential = record.credential.kind(), "Registered new host");
                Ok(RegistrationOutcome::Created(record))
            }
            Ok(SaveOutcome::Updated) => {
                info!(key = %record.key, credential = record.credential.kind(), "Updated existing host");
                Ok(RegistrationOutcome::Updated(record))
            }
            Err(RepositoryError::CredentialConflict) => {
                warn!(
                    key = %record.key,
                    base_url = %record.base_url,
                    "Host already registered with a different credential"
                );
                Err(RegistrationError::CredentialConflict)
            }
            Err(RepositoryError::Backend(e)) => Err(RegistrationError::Repository(e)),
        }
    }

    /// Fetch the public key a host publishes in its consumer info
    pub async fn fetch_public_key(&self, base_url: &str) -> Result<String, RegistrationError> {
        let url = consumer_info_url(base_url);
        let timeout = self.config.fetch_timeout;

        let response = tokio::time::timeout(timeout, self.client.get(&url))
            .await
            .map_err(|_| {
                RegistrationError::PublicKeyFetchFailure(format!(
                    "no response from {} within {}ms",
                    url,
                    timeout.as_millis()
                ))
            })??;

        if !response.is_success() {
            return Err(RegistrationError::PublicKeyFetchFailure(format!(
                "HTTP {} from {}",
                response.status, url
            )));
        }

        let info = parse_consumer_info(&response.body, response.content_type.as_deref())?;
        info.public_key()
            .map(str::to_string)
            .ok_or(RegistrationError::PublicKeyVerificationFailure)
    }
}
