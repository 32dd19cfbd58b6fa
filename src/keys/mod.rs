//! Local key pair management
//!
//! The add-on signs every outbound request with one RSA identity per process.

pub mod provider;

pub use provider::{
    parse_public_key, KeyMaterial, KeyPairConfig, KeyPairProvider, LocalKeyPair,
    DEFAULT_KEY_BITS, PRIVATE_KEY_PEM, PUBLIC_KEY_PEM,
};

/// 2048-bit fixture key pair shared by unit tests
#[cfg(test)]
pub(crate) fn test_key_pair() -> &'static LocalKeyPair {
    static KEY_PAIR: once_cell::sync::Lazy<LocalKeyPair> = once_cell::sync::Lazy::new(|| {
        LocalKeyPair::from_pem(
            include_str!("../../tests/fixtures/public-key.pem"),
            include_str!("../../tests/fixtures/private-key.pem"),
        )
        .unwrap()
    });
    &KEY_PAIR
}
