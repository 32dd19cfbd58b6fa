//! Host record schema
//!
//! One record per registered host, keyed by install key and by base URL.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The verified credential a host authenticates with
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Credential {
    /// RSA public key (PEM or bare base64 DER)
    PublicKey(String),
    /// Symmetric secret for HMAC-signed tokens
    SharedSecret(String),
}

impl Credential {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PublicKey(_) => "public_key",
            Self::SharedSecret(_) => "shared_secret",
        }
    }

    /// Whether two credentials identify the same host.
    ///
    /// Public keys are compared ignoring PEM armour and line wrapping.
    pub fn matches(&self, other: &Credential) -> bool {
        match (self, other) {
            (Self::PublicKey(a), Self::PublicKey(b)) => public_keys_match(a, b),
            (Self::SharedSecret(a), Self::SharedSecret(b)) => a == b,
            _ => false,
        }
    }

    /// Whether presenting this credential proves control of the install.
    ///
    /// A public key is published by the host itself, so anyone can present it.
    pub fn proves_ownership(&self) -> bool {
        matches!(self, Self::SharedSecret(_))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PublicKey(_) => f.write_str("PublicKey(..)"),
            Self::SharedSecret(_) => f.write_str("SharedSecret(..)"),
        }
    }
}

/// A registered host
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct HostRecord {
    /// Install key, matches the `iss` claim of the host's tokens
    pub key: String,

    /// Externally reachable origin of the host, without trailing slash
    pub base_url: String,

    /// Public key verified against the host's consumer info
    pub public_key: String,

    /// Credential used to authenticate the host's requests
    pub credential: Credential,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    pub registered_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl HostRecord {
    pub fn new(
        key: impl Into<String>,
        base_url: impl Into<String>,
        public_key: impl Into<String>,
        credential: Credential,
    ) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            base_url: base_url.into(),
            public_key: public_key.into(),
            credential,
            product_type: None,
            display_name: None,
            registered_at: now,
            updated_at: now,
        }
    }
}

/// Reduce a public key to its base64 body
pub fn normalize_public_key(key: &str) -> String {
    key.lines()
        .filter(|line| !line.trim_start().starts_with("-----"))
        .flat_map(|line| line.chars())
        .filter(|c| !c.is_whitespace())
        .collect()
}

pub fn public_keys_match(a: &str, b: &str) -> bool {
    let a = normalize_public_key(a);
    !a.is_empty() && a == normalize_public_key(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_keys_match_ignores_armour_and_wrapping() {
        let pem = "-----BEGIN PUBLIC KEY-----\nMIGfMA0GCSq\nGSIb3DQEB\n-----END PUBLIC KEY-----\n";
        assert!(public_keys_match(pem, "MIGfMA0GCSqGSIb3DQEB"));
        assert!(public_keys_match("  MIGfMA0GCSqGSIb3DQEB\n", "MIGfMA0GCSqGSIb3DQEB"));
        assert!(!public_keys_match(pem, "MIGfMA0GCSqGSIb3DQEC"));
        assert!(!public_keys_match("", ""));
    }

    #[test]
    fn test_credential_matches() {
        let pk = Credential::PublicKey("PK1".into());
        let secret = Credential::SharedSecret("PK1".into());

        assert!(pk.matches(&Credential::PublicKey("PK1\n".into())));
        assert!(!pk.matches(&secret));
        assert!(secret.matches(&Credential::SharedSecret("PK1".into())));
        assert!(!secret.matches(&Credential::SharedSecret("other".into())));
    }

    #[test]
    fn test_only_shared_secret_proves_ownership() {
        assert!(Credential::SharedSecret("s".into()).proves_ownership());
        assert!(!Credential::PublicKey("PK1".into()).proves_ownership());
    }

    #[test]
    fn test_debug_redacts_credential() {
        let record = HostRecord::new(
            "key",
            "https://host.example",
            "PK",
            Credential::SharedSecret("super-secret".into()),
        );
        let rendered = format!("{:?}", record);
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("SharedSecret(..)"));
    }

    #[test]
    fn test_serde_tagged_credential() {
        let json = serde_json::to_value(Credential::SharedSecret("s".into())).unwrap();
        assert_eq!(json, serde_json::json!({"type": "shared_secret", "value": "s"}));
    }
}
