//! Error types for connect-auth
//!
//! Request-authentication failures collapse into one opaque "Unauthorized"
//! response; registration failures are reported to the installer by kind.
//! Neither ever carries raw key material in its message.

use reqwest::StatusCode;

/// Why an inbound request failed authentication.
///
/// The variants exist for logging and tests. Callers answering a client
/// must use [`AuthFailure::status_code_and_body`], which is identical for
/// every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    #[error("no token found in query parameters or Authorization header")]
    NoToken,

    #[error("token issuer is not a registered host")]
    UnknownIssuer,

    #[error("registered host has no credential usable for the token algorithm")]
    NoSharedSecret,

    #[error("token signature could not be verified")]
    BadSignature,

    #[error("token has expired")]
    TokenExpired,

    #[error("query hash does not match the request")]
    TamperedRequest,
}

impl AuthFailure {
    /// Stable identifier used in structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoToken => "no_token",
            Self::UnknownIssuer => "unknown_issuer",
            Self::NoSharedSecret => "no_shared_secret",
            Self::BadSignature => "bad_signature",
            Self::TokenExpired => "token_expired",
            Self::TamperedRequest => "tampered_request",
        }
    }

    /// Uniform client-facing response, regardless of which check failed
    pub fn status_code_and_body(&self) -> (StatusCode, String) {
        (StatusCode::UNAUTHORIZED, "Unauthorized".to_string())
    }
}

/// Why a host registration was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("Could not fetch public key from host: {0}")]
    PublicKeyFetchFailure(String),

    #[error("Host consumer info did not contain a public key")]
    PublicKeyVerificationFailure,

    #[error("Public key supplied at registration does not match the key published by the host")]
    MismatchPublicKey,

    #[error("Host is already registered with a different credential")]
    CredentialConflict,

    #[error("Host repository error: {0}")]
    Repository(String),
}

impl RegistrationError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRegistration(_) => StatusCode::BAD_REQUEST,
            Self::PublicKeyFetchFailure(_) => StatusCode::BAD_GATEWAY,
            Self::PublicKeyVerificationFailure => StatusCode::BAD_REQUEST,
            Self::MismatchPublicKey => StatusCode::BAD_REQUEST,
            Self::CredentialConflict => StatusCode::CONFLICT,
            Self::Repository(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Main error type for connect-auth operations
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unauthorized: {0}")]
    Auth(#[from] AuthFailure),

    #[error("Registration failed: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Key pair error: {0}")]
    KeyPair(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConnectError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Auth(failure) => failure.status_code_and_body().0,
            Self::Registration(err) => err.status_code(),
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Signing(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::KeyPair(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Convert to status code and body tuple for HTTP response
    ///
    /// Authentication failures never reveal which check rejected the request.
    pub fn into_status_code_and_body(self) -> (StatusCode, String) {
        match self {
            Self::Auth(failure) => failure.status_code_and_body(),
            other => {
                let status = other.status_code();
                (status, other.to_string())
            }
        }
    }
}

impl From<std::io::Error> for ConnectError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for ConnectError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {}", err))
    }
}

impl From<rsa::Error> for ConnectError {
    fn from(err: rsa::Error) -> Self {
        Self::KeyPair(err.to_string())
    }
}

/// Result type alias for connect-auth operations
pub type Result<T> = std::result::Result<T, ConnectError>;
