//! connect-auth - trust between an add-on and the hosts that install it
//!
//! ## Components
//!
//! - **Registration**: verify a host's public key against its own consumer
//!   info before persisting it
//! - **Inbound authentication**: validate host-signed JWTs bound to the
//!   request by a canonical query hash
//! - **Outbound signing**: OAuth 1.0a RSA-SHA1 with the add-on's key pair
//! - **Sessions**: stateless encrypted tokens for polling calls

pub mod auth;
pub mod config;
pub mod hosts;
pub mod keys;
pub mod oauth;
pub mod session;
pub mod state;
pub mod types;

pub use config::Args;
pub use state::ConnectAuth;
pub use types::{AuthFailure, ConnectError, RegistrationError, Result};
