//! Configuration for connect-auth
//!
//! CLI arguments and environment variable handling using clap.
//! Development mode relaxes the key-material requirements; everything else
//! must be supplied explicitly or startup fails.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::keys::{KeyMaterial, KeyPairConfig, DEFAULT_KEY_BITS};
use crate::session::SessionConfig;
use crate::types::{ConnectError, Result};

/// Add-on key used when none is configured in development mode
pub const DEV_ADDON_KEY: &str = "_add-on_key";

/// connect-auth - trust establishment between an add-on and its hosts
#[derive(Parser, Debug, Clone)]
#[command(name = "connect-auth")]
#[command(about = "Host registration, request authentication and outbound signing for add-ons")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Add-on identity key (used as the OAuth consumer key)
    #[arg(long, env = "ADDON_KEY")]
    pub addon_key: Option<String>,

    /// Human-readable add-on name (defaults to the key)
    #[arg(long, env = "ADDON_NAME")]
    pub addon_name: Option<String>,

    /// Session token freshness window in seconds
    #[arg(long, env = "TOKEN_EXPIRY_SECS", default_value = "900")]
    pub token_expiry_secs: u64,

    /// Enable development mode (allows generated keys and secrets)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// PEM-encoded RSA public key for outbound signing
    #[arg(
        long,
        env = "OAUTH_LOCAL_PUBLIC_KEY",
        hide_env_values = true,
        allow_hyphen_values = true
    )]
    pub oauth_local_public_key: Option<String>,

    /// PEM-encoded RSA private key for outbound signing
    #[arg(
        long,
        env = "OAUTH_LOCAL_PRIVATE_KEY",
        hide_env_values = true,
        allow_hyphen_values = true
    )]
    pub oauth_local_private_key: Option<String>,

    /// Path to a PEM public key file (alternative to OAUTH_LOCAL_PUBLIC_KEY)
    #[arg(long, env = "OAUTH_LOCAL_PUBLIC_KEY_FILE")]
    pub oauth_local_public_key_file: Option<PathBuf>,

    /// Path to a PEM private key file (alternative to OAUTH_LOCAL_PRIVATE_KEY)
    #[arg(long, env = "OAUTH_LOCAL_PRIVATE_KEY_FILE")]
    pub oauth_local_private_key_file: Option<PathBuf>,

    /// Directory holding public-key.pem / private-key.pem in development mode
    #[arg(long, env = "DEV_KEY_DIR")]
    pub dev_key_dir: Option<PathBuf>,

    /// Secret the session token encryption key is derived from (required in production)
    #[arg(
        long,
        env = "SESSION_SECRET",
        hide_env_values = true,
        allow_hyphen_values = true
    )]
    pub session_secret: Option<String>,

    /// Path prefix the add-on is mounted under, stripped before query hashing
    #[arg(long, env = "ADDON_CONTEXT_PATH", default_value = "")]
    pub addon_context_path: String,

    /// Timeout for fetching a host's consumer info during registration
    #[arg(long, env = "CONSUMER_INFO_TIMEOUT_MS", default_value = "5000")]
    pub consumer_info_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Validate configuration and load the local key pair, then exit
    Check,
    /// Print a freshly generated RSA key pair (PEM) for provisioning
    Keygen,
}

impl Args {
    /// Effective add-on key (placeholder allowed in dev mode only)
    pub fn addon_key(&self) -> Result<String> {
        match (&self.addon_key, self.dev_mode) {
            (Some(key), _) if !key.trim().is_empty() => Ok(key.trim().to_string()),
            (_, true) => Ok(DEV_ADDON_KEY.to_string()),
            _ => Err(ConnectError::Config(
                "ADDON_KEY is required in production mode".into(),
            )),
        }
    }

    /// Effective add-on name, falling back to the key
    pub fn addon_name(&self) -> Result<String> {
        match &self.addon_name {
            Some(name) if !name.trim().is_empty() => Ok(name.trim().to_string()),
            _ => self.addon_key(),
        }
    }

    pub fn token_expiry(&self) -> Duration {
        Duration::from_secs(self.token_expiry_secs)
    }

    pub fn consumer_info_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer_info_timeout_ms)
    }

    /// Where the local key pair comes from
    ///
    /// Inline PEM strings take precedence over file paths.
    pub fn key_pair_config(&self) -> KeyPairConfig {
        let material = match (
            &self.oauth_local_public_key,
            &self.oauth_local_private_key,
            &self.oauth_local_public_key_file,
            &self.oauth_local_private_key_file,
        ) {
            (Some(public_pem), Some(private_pem), _, _) => KeyMaterial::Pem {
                public_pem: public_pem.clone(),
                private_pem: private_pem.clone(),
            },
            (_, _, Some(public_path), Some(private_path)) => KeyMaterial::Files {
                public_path: public_path.clone(),
                private_path: private_path.clone(),
            },
            _ => KeyMaterial::Absent,
        };

        KeyPairConfig {
            material,
            dev_mode: self.dev_mode,
            dev_key_dir: self.dev_key_dir.clone(),
            key_bits: DEFAULT_KEY_BITS,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            secret: self.session_secret.clone(),
            expiry: self.token_expiry(),
            dev_mode: self.dev_mode,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.addon_key()?;

        if !self.dev_mode {
            if self.session_secret.as_deref().map_or(true, str::is_empty) {
                return Err(ConnectError::Config(
                    "SESSION_SECRET is required in production mode".into(),
                ));
            }

            if matches!(self.key_pair_config().material, KeyMaterial::Absent) {
                return Err(ConnectError::Config(
                    "OAUTH_LOCAL_PUBLIC_KEY and OAUTH_LOCAL_PRIVATE_KEY (or their _FILE variants) are required in production mode".into(),
                ));
            }
        }

        if self.token_expiry_secs == 0 {
            return Err(ConnectError::Config(
                "TOKEN_EXPIRY_SECS must be greater than zero".into(),
            ));
        }

        if self.consumer_info_timeout_ms == 0 {
            return Err(ConnectError::Config(
                "CONSUMER_INFO_TIMEOUT_MS must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}
