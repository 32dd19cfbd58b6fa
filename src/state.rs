//! Wiring of the authentication components
//!
//! Building the state is the startup gate: every configuration error
//! surfaces here, before any request is served.

use std::sync::Arc;
use tracing::info;

use crate::auth::JwtAuthenticator;
use crate::config::Args;
use crate::hosts::{
    CredentialStore, HostRegistrationService, HostRepository, HttpConsumerInfoClient,
    RegistrationConfig,
};
use crate::keys::KeyPairProvider;
use crate::oauth::OAuthSigner;
use crate::session::SessionTokenCodec;
use crate::types::Result;

/// Everything a host-facing service needs to authenticate traffic
pub struct ConnectAuth<R: HostRepository + CredentialStore> {
    pub addon_key: String,
    pub addon_name: String,
    pub repository: Arc<R>,
    pub keys: Arc<KeyPairProvider>,
    pub signer: OAuthSigner,
    pub authenticator: JwtAuthenticator<R>,
    pub sessions: SessionTokenCodec,
    pub registration: HostRegistrationService<R, HttpConsumerInfoClient>,
}

impl<R: HostRepository + CredentialStore> ConnectAuth<R> {
    /// Validate `args` and build every component, loading the key pair eagerly
    pub fn from_args(args: &Args, repository: Arc<R>) -> Result<Self> {
        args.validate()?;

        let addon_key = args.addon_key()?;
        let addon_name = args.addon_name()?;

        let keys = Arc::new(KeyPairProvider::new(args.key_pair_config()));
        keys.init()?;

        let sessions = SessionTokenCodec::from_config(&args.session_config())?;

        let client = Arc::new(HttpConsumerInfoClient::new(args.consumer_info_timeout())?);
        let registration = HostRegistrationService::new(
            RegistrationConfig {
                fetch_timeout: args.consumer_info_timeout(),
            },
            Arc::clone(&repository),
            client,
        );

        let authenticator =
            JwtAuthenticator::new(Arc::clone(&repository), args.addon_context_path.clone());
        let signer = OAuthSigner::new(addon_key.clone(), Arc::clone(&keys));

        info!(
            addon_key = %addon_key,
            dev_mode = args.dev_mode,
            token_expiry_secs = args.token_expiry_secs,
            "Authentication components ready"
        );

        Ok(Self {
            addon_key,
            addon_name,
            repository,
            keys,
            signer,
            authenticator,
            sessions,
            registration,
        })
    }
}
