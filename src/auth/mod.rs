//! Inbound request authentication
//!
//! Canonical request hashing plus host-issued JWT validation.

pub mod canonical;
pub mod jwt;

pub use canonical::{percent_encode, CanonicalRequest, JWT_PARAM_NAME};
pub use jwt::{
    extract_token_from_header, locate_token, AuthenticatedRequest, Claims, InboundRequest,
    JwtAuthenticator,
};
