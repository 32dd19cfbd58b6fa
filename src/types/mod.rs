//! Shared types for connect-auth

pub mod error;

pub use error::{AuthFailure, ConnectError, RegistrationError, Result};
