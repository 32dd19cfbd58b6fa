//! Encrypted polling tokens
//!
//! A session token is `base64url(nonce || AES-256-GCM(json))` under one
//! process-wide key. Nothing is stored server side: validity is decided from
//! the ciphertext and the clock alone.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use hkdf::Hkdf;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::auth::AuthenticatedRequest;
use crate::types::{ConnectError, Result};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

const KEY_SALT: &[u8] = b"connect-auth session token";
const KEY_INFO: &[u8] = b"aes-256-gcm key v1";

/// Session codec settings
#[derive(Clone)]
pub struct SessionConfig {
    /// Secret the encryption key is derived from
    pub secret: Option<String>,
    /// Freshness window
    pub expiry: Duration,
    pub dev_mode: bool,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("secret", &self.secret.as_ref().map(|_| ".."))
            .field("expiry", &self.expiry)
            .field("dev_mode", &self.dev_mode)
            .finish()
    }
}

/// Decoded token contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken {
    pub host_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_account_id: Option<String>,
    pub issued_at_millis: i64,
    pub allow_insecure_polling: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidSessionToken {
    /// Not base64, wrong key, corrupted or forged
    Undecodable,
    /// Token tier differs from the endpoint's polling tier
    PollingTierMismatch,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTokenValidation {
    Valid(SessionToken),
    Invalid(InvalidSessionToken),
}

impl SessionTokenValidation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    pub fn token(self) -> Option<SessionToken> {
        match self {
            Self::Valid(token) => Some(token),
            Self::Invalid(_) => None,
        }
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct SessionKey([u8; 32]);

/// Issues and validates session tokens
pub struct SessionTokenCodec {
    key: SessionKey,
    expiry: Duration,
}

impl SessionTokenCodec {
    /// Codec with an HKDF-SHA256 key derived from `secret`
    pub fn new(secret: &[u8], expiry: Duration) -> Result<Self> {
        let mut key = SessionKey([0u8; 32]);
        Hkdf::<Sha256>::new(Some(KEY_SALT), secret)
            .expand(KEY_INFO, &mut key.0)
            .map_err(|_| ConnectError::Internal("Failed to derive session key".into()))?;
        Ok(Self { key, expiry })
    }

    /// Codec for the configured secret.
    ///
    /// Without a secret, development mode falls back to a random per-process
    /// key; any other mode is a configuration error.
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        match config.secret.as_deref().filter(|s| !s.is_empty()) {
            Some(secret) => Self::new(secret.as_bytes(), config.expiry),
            None if config.dev_mode => {
                warn!("SESSION_SECRET not set, session tokens will not survive a restart");
                let mut key = [0u8; 32];
                OsRng.fill_bytes(&mut key);
                Ok(Self {
                    key: SessionKey(key),
                    expiry: config.expiry,
                })
            }
            None => Err(ConnectError::Config(
                "SESSION_SECRET is required in production mode".into(),
            )),
        }
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    pub fn issue(
        &self,
        host_key: &str,
        user_account_id: Option<&str>,
        allow_insecure_polling: bool,
    ) -> Result<String> {
        self.issue_at(
            host_key,
            user_account_id,
            allow_insecure_polling,
            Utc::now().timestamp_millis(),
        )
    }

    /// Token scoped to the host and user of an authenticated request
    pub fn issue_for(
        &self,
        authenticated: &AuthenticatedRequest,
        allow_insecure_polling: bool,
    ) -> Result<String> {
        self.issue(
            &authenticated.issuer,
            authenticated.subject.as_deref(),
            allow_insecure_polling,
        )
    }

    pub(crate) fn issue_at(
        &self,
        host_key: &str,
        user_account_id: Option<&str>,
        allow_insecure_polling: bool,
        now_millis: i64,
    ) -> Result<String> {
        let token = SessionToken {
            host_key: host_key.to_string(),
            user_account_id: user_account_id.map(str::to_string),
            issued_at_millis: now_millis,
            allow_insecure_polling,
        };
        let plaintext = serde_json::to_vec(&token)?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| ConnectError::Internal("Failed to encrypt session token".into()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);

        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    /// Validate a token presented to an endpoint.
    ///
    /// `endpoint_allows_insecure_polling` is the endpoint's declared tier;
    /// the token's flag must equal it.
    pub fn validate(&self, token: &str, endpoint_allows_insecure_polling: bool) -> SessionTokenValidation {
        self.validate_at(
            token,
            endpoint_allows_insecure_polling,
            Utc::now().timestamp_millis(),
        )
    }

    pub(crate) fn validate_at(
        &self,
        token: &str,
        endpoint_allows_insecure_polling: bool,
        now_millis: i64,
    ) -> SessionTokenValidation {
        let decoded = match self.open(token) {
            Some(decoded) => decoded,
            None => {
                debug!("Rejected undecodable session token");
                return SessionTokenValidation::Invalid(InvalidSessionToken::Undecodable);
            }
        };

        if decoded.allow_insecure_polling != endpoint_allows_insecure_polling {
            debug!(
                host_key = %decoded.host_key,
                token_insecure = decoded.allow_insecure_polling,
                endpoint_insecure = endpoint_allows_insecure_polling,
                "Rejected session token for a different polling tier"
            );
            return SessionTokenValidation::Invalid(InvalidSessionToken::PollingTierMismatch);
        }

        let expiry_millis = i64::try_from(self.expiry.as_millis()).unwrap_or(i64::MAX);
        if now_millis.saturating_sub(expiry_millis) > decoded.issued_at_millis {
            debug!(host_key = %decoded.host_key, "Rejected expired session token");
            return SessionTokenValidation::Invalid(InvalidSessionToken::Expired);
        }

        SessionTokenValidation::Valid(decoded)
    }

    fn open(&self, token: &str) -> Option<SessionToken> {
        let sealed = URL_SAFE_NO_PAD.decode(token.trim()).ok()?;
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return None;
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .ok()?;

        serde_json::from_slice(&plaintext).ok()
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key.0))
    }
}
