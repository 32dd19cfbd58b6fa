//! Local RSA key pair used to sign outbound requests.
//!
//! The pair is resolved once per provider and cached for the lifetime of the
//! process. Resolution order:
//!
//! 1. inline PEM strings from configuration
//! 2. PEM files named in configuration
//! 3. development mode only: `public-key.pem` / `private-key.pem` in the dev
//!    key directory, generated there when neither exists, otherwise a fresh
//!    in-memory pair
//!
//! Outside development mode a missing pair is a configuration error.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::types::{ConnectError, Result};

/// RSA modulus size for generated keys
pub const DEFAULT_KEY_BITS: usize = 2048;

/// File name of the generated public key in the dev key directory
pub const PUBLIC_KEY_PEM: &str = "public-key.pem";

/// File name of the generated private key in the dev key directory
pub const PRIVATE_KEY_PEM: &str = "private-key.pem";

/// Source of the key pair
#[derive(Clone)]
pub enum KeyMaterial {
    /// PEM strings supplied directly
    Pem {
        public_pem: String,
        private_pem: String,
    },
    /// PEM files on disk
    Files {
        public_path: PathBuf,
        private_path: PathBuf,
    },
    /// Nothing configured
    Absent,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pem { .. } => f.write_str("Pem { .. }"),
            Self::Files {
                public_path,
                private_path,
            } => f
                .debug_struct("Files")
                .field("public_path", public_path)
                .field("private_path", private_path)
                .finish(),
            Self::Absent => f.write_str("Absent"),
        }
    }
}

/// Key pair provider configuration
#[derive(Debug, Clone)]
pub struct KeyPairConfig {
    pub material: KeyMaterial,
    pub dev_mode: bool,
    pub dev_key_dir: Option<PathBuf>,
    pub key_bits: usize,
}

impl KeyPairConfig {
    pub fn new(material: KeyMaterial, dev_mode: bool) -> Self {
        Self {
            material,
            dev_mode,
            dev_key_dir: None,
            key_bits: DEFAULT_KEY_BITS,
        }
    }
}

/// The add-on's RSA identity
pub struct LocalKeyPair {
    public_pem: String,
    private_pem: Zeroizing<String>,
    public_key: RsaPublicKey,
    private_key: RsaPrivateKey,
}

impl LocalKeyPair {
    /// Generate a fresh key pair
    pub fn generate(bits: usize) -> Result<Self> {
        let private_key = RsaPrivateKey::new(&mut OsRng, bits)?;
        Self::from_private_key(private_key)
    }

    /// Parse a PEM pair, checking that both halves belong together.
    ///
    /// Accepts PKCS#8 / PKCS#1 private keys and SPKI / PKCS#1 public keys.
    pub fn from_pem(public_pem: &str, private_pem: &str) -> Result<Self> {
        let private_key = parse_private_key(private_pem)?;
        let public_key = parse_public_key(public_pem)?;

        if RsaPublicKey::from(&private_key) != public_key {
            return Err(ConnectError::Config(
                "Configured public key does not belong to the configured private key".into(),
            ));
        }

        Ok(Self {
            public_pem: public_pem.trim().to_string() + "\n",
            private_pem: Zeroizing::new(private_pem.trim().to_string() + "\n"),
            public_key,
            private_key,
        })
    }

    fn from_private_key(private_key: RsaPrivateKey) -> Result<Self> {
        let public_key = RsaPublicKey::from(&private_key);

        let private_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| ConnectError::KeyPair(format!("Failed to encode private key: {e}")))?;
        let public_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| ConnectError::KeyPair(format!("Failed to encode public key: {e}")))?;

        Ok(Self {
            public_pem,
            private_pem: Zeroizing::new(private_pem.to_string()),
            public_key,
            private_key,
        })
    }

    pub fn public_pem(&self) -> &str {
        &self.public_pem
    }

    pub fn private_pem(&self) -> &str {
        &self.private_pem
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }
}

impl fmt::Debug for LocalKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKeyPair")
            .field("public_pem", &self.public_pem)
            .finish_non_exhaustive()
    }
}

/// Resolves the local key pair once and hands out the cached value
#[derive(Debug)]
pub struct KeyPairProvider {
    config: KeyPairConfig,
    key_pair: OnceCell<LocalKeyPair>,
}

impl KeyPairProvider {
    pub fn new(config: KeyPairConfig) -> Self {
        Self {
            config,
            key_pair: OnceCell::new(),
        }
    }

    /// Provider around an already-resolved pair
    pub fn with_key_pair(key_pair: LocalKeyPair) -> Self {
        Self {
            config: KeyPairConfig::new(KeyMaterial::Absent, false),
            key_pair: OnceCell::with_value(key_pair),
        }
    }

    /// Resolve the key pair at startup.
    ///
    /// Call before serving traffic so missing production keys stop the
    /// process instead of failing individual requests.
    pub fn init(&self) -> Result<&LocalKeyPair> {
        let key_pair = self.get_key_pair()?;
        info!("Local key pair ready for outbound signing");
        Ok(key_pair)
    }

    /// The cached key pair, resolving it on first use.
    ///
    /// Concurrent first callers block until the single resolution finishes.
    pub fn get_key_pair(&self) -> Result<&LocalKeyPair> {
        self.key_pair.get_or_try_init(|| resolve(&self.config))
    }
}

fn resolve(config: &KeyPairConfig) -> Result<LocalKeyPair> {
    match &config.material {
        KeyMaterial::Pem {
            public_pem,
            private_pem,
        } => {
            debug!("Using key pair from OAUTH_LOCAL_PUBLIC_KEY / OAUTH_LOCAL_PRIVATE_KEY");
            LocalKeyPair::from_pem(public_pem, private_pem)
        }
        KeyMaterial::Files {
            public_path,
            private_path,
        } => {
            debug!(
                public_path = %public_path.display(),
                private_path = %private_path.display(),
                "Loading key pair from files"
            );
            let public_pem = read_pem(public_path)?;
            let private_pem = Zeroizing::new(read_pem(private_path)?);
            LocalKeyPair::from_pem(&public_pem, &private_pem)
        }
        KeyMaterial::Absent if config.dev_mode => dev_key_pair(config),
        KeyMaterial::Absent => Err(ConnectError::Config(
            "No key pair configured; set OAUTH_LOCAL_PUBLIC_KEY and OAUTH_LOCAL_PRIVATE_KEY".into(),
        )),
    }
}

fn dev_key_pair(config: &KeyPairConfig) -> Result<LocalKeyPair> {
    info!("In production, define OAUTH_LOCAL_PUBLIC_KEY and OAUTH_LOCAL_PRIVATE_KEY");

    let Some(dir) = &config.dev_key_dir else {
        info!("Generating in-memory key pair for OAuth signing (development mode)");
        return LocalKeyPair::generate(config.key_bits);
    };

    let public_path = dir.join(PUBLIC_KEY_PEM);
    let private_path = dir.join(PRIVATE_KEY_PEM);

    match (public_path.exists(), private_path.exists()) {
        (true, true) => {
            debug!(dir = %dir.display(), "Key files exist, not generating new ones");
            let public_pem = read_pem(&public_path)?;
            let private_pem = Zeroizing::new(read_pem(&private_path)?);
            LocalKeyPair::from_pem(&public_pem, &private_pem)
        }
        (false, false) => {
            info!(dir = %dir.display(), "Generating key pair for OAuth signing");
            warn!("Do NOT add the generated key files to version control");
            let key_pair = LocalKeyPair::generate(config.key_bits)?;
            if let Err(e) = write_key_files(dir, &key_pair) {
                warn!(dir = %dir.display(), error = %e, "Could not write key files, using in-memory pair");
            }
            Ok(key_pair)
        }
        (public_exists, _) => {
            let (present, missing) = if public_exists {
                (&public_path, &private_path)
            } else {
                (&private_path, &public_path)
            };
            warn!(
                present = %present.display(),
                missing = %missing.display(),
                "Found only half of the key pair, not generating any files"
            );
            LocalKeyPair::generate(config.key_bits)
        }
    }
}

fn write_key_files(dir: &Path, key_pair: &LocalKeyPair) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join(PRIVATE_KEY_PEM), key_pair.private_pem())?;
    fs::write(dir.join(PUBLIC_KEY_PEM), key_pair.public_pem())?;
    debug!(dir = %dir.display(), "Wrote key files");
    Ok(())
}

fn read_pem(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| {
        ConnectError::Config(format!("Could not read key file {}: {e}", path.display()))
    })
}

fn parse_private_key(pem: &str) -> Result<RsaPrivateKey> {
    let pem = pem.trim();
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|_| ConnectError::Config("Private key is not a valid RSA PEM key".into()))
}

/// Parse an RSA public key in SPKI (`PUBLIC KEY`) or PKCS#1 (`RSA PUBLIC KEY`) PEM
pub fn parse_public_key(pem: &str) -> Result<RsaPublicKey> {
    let pem = pem.trim();
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|_| ConnectError::Config("Public key is not a valid RSA PEM key".into()))
}
