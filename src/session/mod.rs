//! Short-lived session tokens for follow-up polling calls

pub mod token;

pub use token::{
    InvalidSessionToken, SessionConfig, SessionToken, SessionTokenCodec, SessionTokenValidation,
};
