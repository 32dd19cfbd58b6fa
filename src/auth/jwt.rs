//! Inbound request authentication
//!
//! Hosts sign every request to the add-on with a JWT whose `qsh` claim binds
//! it to the request's method, path and query. Validation walks a fixed
//! sequence and stops at the first failure:
//!
//! 1. locate the token (`jwt` query parameter, then `Authorization` header)
//! 2. read the issuer without trusting the token
//! 3. resolve the issuer's credential
//! 4. verify the signature
//! 5. check expiry and the query hash
//!
//! Every failure is logged with its kind; callers only ever answer
//! "Unauthorized".

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::canonical::{CanonicalRequest, JWT_PARAM_NAME};
use crate::hosts::{Credential, CredentialStore, HostRecord};
use crate::types::{self, AuthFailure, ConnectError};

/// Claims of a host-issued token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Host key
    pub iss: String,
    /// End user the host is acting for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default)]
    pub iat: i64,
    pub exp: i64,
    /// Query string hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qsh: Option<String>,
}

#[derive(Deserialize)]
struct UnverifiedClaims {
    #[serde(default)]
    iss: Option<String>,
}

/// The parts of an HTTP request needed to authenticate it
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub method: String,
    pub path: String,
    /// Decoded query parameters in request order (repeats allowed)
    pub query: Vec<(String, String)>,
    pub authorization: Option<String>,
}

impl InboundRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    /// Build from a method and a request target such as `/foo?a=1`
    pub fn from_uri(method: impl Into<String>, uri: &str) -> types::Result<Self> {
        match uri.split_once('?') {
            Some((path, query)) => Self::new(method, path).with_query_string(query),
            None => Ok(Self::new(method, uri)),
        }
    }

    pub fn with_query<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.query
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Append parameters from a raw `application/x-www-form-urlencoded` query.
    ///
    /// A component that does not decode to UTF-8 fails the whole query.
    pub fn with_query_string(mut self, query: &str) -> types::Result<Self> {
        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            self.query
                .push((decode_query_component(key)?, decode_query_component(value)?));
        }
        Ok(self)
    }

    pub fn with_authorization(mut self, value: impl Into<String>) -> Self {
        self.authorization = Some(value.into());
        self
    }

    fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

fn decode_query_component(raw: &str) -> types::Result<String> {
    urlencoding::decode(&raw.replace('+', " "))
        .map(|decoded| decoded.into_owned())
        .map_err(|e| ConnectError::InvalidRequest(format!("undecodable query component: {e}")))
}

/// Identity established for an authenticated request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedRequest {
    /// Key of the host that issued the token
    pub issuer: String,
    /// End user the host is acting for, to be bound to the request context
    pub subject: Option<String>,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub host: HostRecord,
}

/// Token from the `Authorization` header.
/// Supports the "JWT <token>" and "Bearer <token>" schemes.
pub fn extract_token_from_header(auth_header: Option<&str>) -> Option<&str> {
    let header = auth_header?.trim();
    let (scheme, token) = header.split_once(' ')?;

    if !(scheme.eq_ignore_ascii_case("JWT") || scheme.eq_ignore_ascii_case("Bearer")) {
        return None;
    }

    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Token location: the `jwt` query parameter wins over the header
pub fn locate_token(request: &InboundRequest) -> Option<&str> {
    request
        .query_param(JWT_PARAM_NAME)
        .filter(|token| !token.is_empty())
        .or_else(|| extract_token_from_header(request.authorization.as_deref()))
}

/// Validates host-signed inbound requests
pub struct JwtAuthenticator<S: CredentialStore> {
    store: Arc<S>,
    context_path: String,
}

impl<S: CredentialStore> JwtAuthenticator<S> {
    /// `context_path` is the prefix the add-on is mounted under
    pub fn new(store: Arc<S>, context_path: impl Into<String>) -> Self {
        Self {
            store,
            context_path: context_path.into(),
        }
    }

    pub fn authenticate(&self, request: &InboundRequest) -> Result<AuthenticatedRequest, AuthFailure> {
        self.authenticate_at(request, Utc::now().timestamp())
    }

    /// Authenticate as of `now` (seconds since the epoch)
    pub fn authenticate_at(
        &self,
        request: &InboundRequest,
        now: i64,
    ) -> Result<AuthenticatedRequest, AuthFailure> {
        let result = self.verify(request, now);

        match &result {
            Ok(authenticated) => debug!(
                issuer = %authenticated.issuer,
                method = %request.method,
                path = %request.path,
                "Authenticated inbound request"
            ),
            Err(failure) => warn!(
                kind = failure.kind(),
                method = %request.method,
                path = %request.path,
                "Rejected inbound request: {}",
                failure
            ),
        }

        result
    }

    fn verify(&self, request: &InboundRequest, now: i64) -> Result<AuthenticatedRequest, AuthFailure> {
        let token = locate_token(request).ok_or(AuthFailure::NoToken)?;

        let issuer = unverified_issuer(token)?;
        let host = self
            .store
            .find_host(&issuer)
            .ok_or(AuthFailure::UnknownIssuer)?;

        let header = decode_header(token).map_err(|_| AuthFailure::BadSignature)?;
        let key = decoding_key(&host.credential, header.alg)?;

        let mut validation = Validation::new(header.alg);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["iss", "exp"]);

        let claims = decode::<Claims>(token, &key, &validation)
            .map_err(|e| {
                debug!(issuer = %issuer, error = %e, "Token verification failed");
                AuthFailure::BadSignature
            })?
            .claims;

        if claims.iss != host.key {
            return Err(AuthFailure::BadSignature);
        }

        if claims.exp <= now {
            return Err(AuthFailure::TokenExpired);
        }

        let expected = CanonicalRequest::new(
            &request.method,
            &request.path,
            &self.context_path,
            request.query.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        )
        .query_hash();
        if claims.qsh.as_deref() != Some(expected.as_str()) {
            return Err(AuthFailure::TamperedRequest);
        }

        Ok(AuthenticatedRequest {
            issuer: claims.iss,
            subject: claims.sub.filter(|sub| !sub.is_empty()),
            issued_at: (claims.iat > 0)
                .then(|| Utc.timestamp_opt(claims.iat, 0).single())
                .flatten(),
            expires_at: Utc
                .timestamp_opt(claims.exp, 0)
                .single()
                .ok_or(AuthFailure::TokenExpired)?,
            host,
        })
    }
}

/// Issuer of a token whose signature has not been checked yet
fn unverified_issuer(token: &str) -> Result<String, AuthFailure> {
    let header = decode_header(token).map_err(|_| AuthFailure::BadSignature)?;

    let mut validation = Validation::new(header.alg);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let claims = decode::<UnverifiedClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map_err(|_| AuthFailure::BadSignature)?
        .claims;

    claims
        .iss
        .filter(|iss| !iss.is_empty())
        .ok_or(AuthFailure::UnknownIssuer)
}

/// Key for verifying a token signed with `alg` by a host holding `credential`
fn decoding_key(credential: &Credential, alg: Algorithm) -> Result<DecodingKey, AuthFailure> {
    match (credential, alg) {
        (Credential::SharedSecret(secret), Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) => {
            Ok(DecodingKey::from_secret(secret.as_bytes()))
        }
        (Credential::PublicKey(key), Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512) => {
            DecodingKey::from_rsa_pem(armoured_public_key(key).as_bytes()).map_err(|e| {
                warn!(error = %e, "Registered public key is not a usable RSA key");
                AuthFailure::NoSharedSecret
            })
        }
        _ => Err(AuthFailure::NoSharedSecret),
    }
}

/// Hosts publish bare base64 DER; wrap it as SPKI PEM when needed
fn armoured_public_key(key: &str) -> String {
    if key.contains("-----BEGIN") {
        return key.to_string();
    }

    let body = crate::hosts::normalize_public_key(key);
    let wrapped = body
        .as_bytes()
        .chunks(64)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join("\n");
    format!("-----BEGIN PUBLIC KEY-----\n{}\n-----END PUBLIC KEY-----\n", wrapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosts::InMemoryHostRepository;
    use crate::hosts::HostRepository;
    use crate::keys::test_key_pair;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "shared-secret-for-host-one";
    const NOW: i64 = 1_700_000_000;

    async fn store() -> Arc<InMemoryHostRepository> {
        let repo = Arc::new(InMemoryHostRepository::new());
        repo.save_verified(HostRecord::new(
            "host-one",
            "https://one.example",
            "PK",
            Credential::SharedSecret(SECRET.into()),
        ))
        .await
        .unwrap();
        repo.save_verified(HostRecord::new(
            "host-rsa",
            "https://rsa.example",
            test_key_pair().public_pem(),
            Credential::PublicKey(test_key_pair().public_pem().to_string()),
        ))
        .await
        .unwrap();
        repo
    }

    fn claims_for(iss: &str, method: &str, path: &str, query: &[(&str, &str)], exp: i64) -> Claims {
        Claims {
            iss: iss.into(),
            sub: Some("user-1".into()),
            iat: NOW - 10,
            exp,
            qsh: Some(CanonicalRequest::new(method, path, "", query.iter().copied()).query_hash()),
        }
    }

    fn hs256(claims: &Claims, secret: &str) -> String {
        encode(&Header::default(), claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[tokio::test]
    async fn test_no_token_is_rejected() {
        let auth = JwtAuthenticator::new(store().await, "");
        let request = InboundRequest::new("GET", "/foo");
        assert_eq!(auth.authenticate_at(&request, NOW), Err(AuthFailure::NoToken));
    }

    #[tokio::test]
    async fn test_valid_query_token() {
        let auth = JwtAuthenticator::new(store().await, "");
        let token = hs256(&claims_for("host-one", "GET", "/foo", &[("a", "1")], NOW + 60), SECRET);
        let request = InboundRequest::new("GET", "/foo").with_query([("a", "1"), ("jwt", token.as_str())]);

        let authenticated = auth.authenticate_at(&request, NOW).unwrap();
        assert_eq!(authenticated.issuer, "host-one");
        assert_eq!(authenticated.subject.as_deref(), Some("user-1"));
        assert_eq!(authenticated.expires_at.timestamp(), NOW + 60);
        assert_eq!(authenticated.host.base_url, "https://one.example");
    }

    #[tokio::test]
    async fn test_header_token_with_both_schemes() {
        let auth = JwtAuthenticator::new(store().await, "");
        let token = hs256(&claims_for("host-one", "GET", "/foo", &[], NOW + 60), SECRET);

        for scheme in ["JWT", "Bearer", "jwt"] {
            let request = InboundRequest::new("GET", "/foo")
                .with_authorization(format!("{} {}", scheme, token));
            assert!(auth.authenticate_at(&request, NOW).is_ok(), "scheme {scheme}");
        }
    }

    #[tokio::test]
    async fn test_query_parameter_takes_precedence_over_header() {
        let auth = JwtAuthenticator::new(store().await, "");
        let good = hs256(&claims_for("host-one", "GET", "/foo", &[], NOW + 60), SECRET);
        let bad = hs256(&claims_for("host-one", "GET", "/foo", &[], NOW + 60), "wrong-secret");

        let request = InboundRequest::new("GET", "/foo")
            .with_query([("jwt", bad.as_str())])
            .with_authorization(format!("JWT {}", good));
        assert_eq!(auth.authenticate_at(&request, NOW), Err(AuthFailure::BadSignature));
    }

    #[tokio::test]
    async fn test_unknown_issuer() {
        let auth = JwtAuthenticator::new(store().await, "");
        let token = hs256(&claims_for("stranger", "GET", "/foo", &[], NOW + 60), SECRET);
        let request = InboundRequest::new("GET", "/foo").with_authorization(format!("JWT {}", token));
        assert_eq!(auth.authenticate_at(&request, NOW), Err(AuthFailure::UnknownIssuer));
    }

    #[tokio::test]
    async fn test_garbage_token_is_bad_signature() {
        let auth = JwtAuthenticator::new(store().await, "");
        let request = InboundRequest::new("GET", "/foo").with_query([("jwt", "not.a.token")]);
        assert_eq!(auth.authenticate_at(&request, NOW), Err(AuthFailure::BadSignature));
    }

    #[tokio::test]
    async fn test_wrong_secret_is_bad_signature() {
        let auth = JwtAuthenticator::new(store().await, "");
        let token = hs256(&claims_for("host-one", "GET", "/foo", &[], NOW + 60), "wrong-secret");
        let request = InboundRequest::new("GET", "/foo").with_query([("jwt", token.as_str())]);
        assert_eq!(auth.authenticate_at(&request, NOW), Err(AuthFailure::BadSignature));
    }

    #[tokio::test]
    async fn test_hmac_token_for_public_key_host_has_no_secret() {
        let auth = JwtAuthenticator::new(store().await, "");
        let token = hs256(&claims_for("host-rsa", "GET", "/foo", &[], NOW + 60), SECRET);
        let request = InboundRequest::new("GET", "/foo").with_query([("jwt", token.as_str())]);
        assert_eq!(auth.authenticate_at(&request, NOW), Err(AuthFailure::NoSharedSecret));
    }

    #[tokio::test]
    async fn test_rs256_token_for_public_key_host() {
        let auth = JwtAuthenticator::new(store().await, "");
        let encoding_key = EncodingKey::from_rsa_pem(test_key_pair().private_pem().as_bytes()).unwrap();
        let token = encode(
            &Header::new(Algorithm::RS256),
            &claims_for("host-rsa", "GET", "/foo", &[], NOW + 60),
            &encoding_key,
        )
        .unwrap();

        let request = InboundRequest::new("GET", "/foo").with_query([("jwt", token.as_str())]);
        assert_eq!(auth.authenticate_at(&request, NOW).unwrap().issuer, "host-rsa");
    }

    #[tokio::test]
    async fn test_expiry_boundary() {
        let auth = JwtAuthenticator::new(store().await, "");

        let expired = hs256(&claims_for("host-one", "GET", "/foo", &[], NOW - 1), SECRET);
        let request = InboundRequest::new("GET", "/foo").with_query([("jwt", expired.as_str())]);
        assert_eq!(auth.authenticate_at(&request, NOW), Err(AuthFailure::TokenExpired));

        let fresh = hs256(&claims_for("host-one", "GET", "/foo", &[], NOW + 1), SECRET);
        let request = InboundRequest::new("GET", "/foo").with_query([("jwt", fresh.as_str())]);
        assert!(auth.authenticate_at(&request, NOW).is_ok());
    }

    #[tokio::test]
    async fn test_mutated_query_is_tampered() {
        let auth = JwtAuthenticator::new(store().await, "");
        let token = hs256(&claims_for("host-one", "GET", "/foo", &[("a", "1")], NOW + 60), SECRET);

        let request = InboundRequest::new("GET", "/foo").with_query([("a", "2"), ("jwt", token.as_str())]);
        assert_eq!(auth.authenticate_at(&request, NOW), Err(AuthFailure::TamperedRequest));

        let request = InboundRequest::new("GET", "/foo")
            .with_query([("a", "1"), ("b", "extra"), ("jwt", token.as_str())]);
        assert_eq!(auth.authenticate_at(&request, NOW), Err(AuthFailure::TamperedRequest));
    }

    #[tokio::test]
    async fn test_missing_qsh_is_tampered() {
        let auth = JwtAuthenticator::new(store().await, "");
        let mut claims = claims_for("host-one", "GET", "/foo", &[], NOW + 60);
        claims.qsh = None;
        let token = hs256(&claims, SECRET);
        let request = InboundRequest::new("GET", "/foo").with_query([("jwt", token.as_str())]);
        assert_eq!(auth.authenticate_at(&request, NOW), Err(AuthFailure::TamperedRequest));
    }

    #[tokio::test]
    async fn test_replay_with_different_method_is_tampered() {
        let auth = JwtAuthenticator::new(store().await, "");
        let token = hs256(&claims_for("host-one", "GET", "/foo", &[], NOW + 60), SECRET);
        let request = InboundRequest::new("POST", "/foo").with_authorization(format!("JWT {}", token));
        assert_eq!(auth.authenticate_at(&request, NOW), Err(AuthFailure::TamperedRequest));
    }

    #[tokio::test]
    async fn test_context_path_is_stripped_before_hashing() {
        let auth = JwtAuthenticator::new(store().await, "/addon");
        let token = hs256(&claims_for("host-one", "GET", "/foo", &[], NOW + 60), SECRET);
        let request = InboundRequest::new("GET", "/addon/foo").with_query([("jwt", token.as_str())]);
        assert!(auth.authenticate_at(&request, NOW).is_ok());
    }

    #[tokio::test]
    async fn test_validation_is_idempotent() {
        let auth = JwtAuthenticator::new(store().await, "");
        let token = hs256(&claims_for("host-one", "GET", "/foo", &[], NOW + 60), SECRET);
        let request = InboundRequest::new("GET", "/foo").with_query([("jwt", token.as_str())]);

        let first = auth.authenticate_at(&request, NOW);
        let second = auth.authenticate_at(&request, NOW);
        assert!(first.is_ok());
        assert_eq!(first, second);
    }

    #[test]
    fn test_from_uri_parses_query() {
        let request = InboundRequest::from_uri("GET", "/foo?a=1&b=x%20y+z&a=2&flag&&c=").unwrap();
        assert_eq!(request.path, "/foo");
        assert_eq!(
            request.query,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "x y z".to_string()),
                ("a".to_string(), "2".to_string()),
                ("flag".to_string(), "".to_string()),
                ("c".to_string(), "".to_string()),
            ]
        );

        let bare = InboundRequest::from_uri("GET", "/foo").unwrap();
        assert_eq!(bare.path, "/foo");
        assert!(bare.query.is_empty());
    }

    #[test]
    fn test_undecodable_query_is_an_error_not_an_empty_query() {
        for uri in ["/foo?a=%FF", "/foo?a=1&%C3%28=2"] {
            let err = InboundRequest::from_uri("GET", uri).unwrap_err();
            assert!(matches!(err, ConnectError::InvalidRequest(_)));
        }

        let err = InboundRequest::new("GET", "/foo")
            .with_query_string("b=%E2%82")
            .unwrap_err();
        assert!(matches!(err, ConnectError::InvalidRequest(_)));
    }

    #[test]
    fn test_extract_token_from_header() {
        assert_eq!(extract_token_from_header(Some("JWT abc.def.ghi")), Some("abc.def.ghi"));
        assert_eq!(extract_token_from_header(Some("Bearer abc123")), Some("abc123"));
        assert_eq!(extract_token_from_header(Some("Basic dXNlcjpwYXNz")), None);
        assert_eq!(extract_token_from_header(Some("Bearer ")), None);
        assert_eq!(extract_token_from_header(Some("abc123")), None);
        assert_eq!(extract_token_from_header(None), None);
    }

    #[test]
    fn test_armoured_public_key_wraps_bare_base64() {
        let bare = crate::hosts::normalize_public_key(test_key_pair().public_pem());
        let armoured = armoured_public_key(&bare);
        assert!(armoured.starts_with("-----BEGIN PUBLIC KEY-----\n"));
        assert!(DecodingKey::from_rsa_pem(armoured.as_bytes()).is_ok());
    }
}
