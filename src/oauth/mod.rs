//! Outbound request signing

pub mod signer;

pub use signer::{
    resolve_host_url, signature_base_string, OAuthSigner, SignedRequest, OAUTH_SIGNATURE_METHOD,
    OAUTH_VERSION, USER_ID_QUERY_PARAMETER,
};
