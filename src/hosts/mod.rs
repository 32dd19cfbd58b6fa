//! Host registration and lookup
//!
//! A host is trusted once its registration handshake succeeds; after that its
//! record supplies the credential for every inbound token it issues.

pub mod consumer_info;
pub mod record;
pub mod registration;
pub mod registry;

pub use consumer_info::{
    consumer_info_url, parse_consumer_info, ConsumerInfo, ConsumerInfoClient,
    ConsumerInfoResponse, HttpConsumerInfoClient, CONSUMER_INFO_PATH,
};
pub use record::{normalize_public_key, public_keys_match, Credential, HostRecord};
pub use registration::{
    normalize_base_url, HostRegistration, HostRegistrationService, RegistrationConfig,
    RegistrationOutcome, DEFAULT_FETCH_TIMEOUT,
};
pub use registry::{
    CredentialStore, HostRepository, InMemoryHostRepository, RepositoryError, SaveOutcome,
};
