//! OAuth 1.0a RSA-SHA1 signing of add-on → host requests.
//!
//! The signature base string follows RFC 5849 §3.4.1:
//! `METHOD&enc(base-uri)&enc(sorted-params)`, where the parameters are the
//! request's query parameters plus the `oauth_*` protocol parameters.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rsa::pkcs1v15::SigningKey;
use rsa::signature::{SignatureEncoding, Signer};
use sha1::Sha1;
use tracing::{debug, instrument};
use url::Url;

use crate::auth::canonical::percent_encode;
use crate::hosts::HostRecord;
use crate::keys::KeyPairProvider;
use crate::types::{ConnectError, Result};

/// Query parameter naming the end user the add-on acts for
pub const USER_ID_QUERY_PARAMETER: &str = "user_id";

pub const OAUTH_SIGNATURE_METHOD: &str = "RSA-SHA1";
pub const OAUTH_VERSION: &str = "1.0";

/// An outbound request ready to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    pub method: String,
    /// Final URL, including `user_id` when acting for a user
    pub url: String,
    /// Value for the `Authorization` header
    pub authorization: String,
}

/// Signs outbound requests with the add-on's local private key
#[derive(Clone)]
pub struct OAuthSigner {
    consumer_key: String,
    keys: Arc<KeyPairProvider>,
}

impl OAuthSigner {
    pub fn new(consumer_key: impl Into<String>, keys: Arc<KeyPairProvider>) -> Self {
        Self {
            consumer_key: consumer_key.into(),
            keys,
        }
    }

    pub fn consumer_key(&self) -> &str {
        &self.consumer_key
    }

    /// Sign a request to a registered host.
    ///
    /// Relative URLs are resolved against the host's base URL; absolute URLs
    /// must point at that host.
    pub fn sign_for_host(
        &self,
        host: &HostRecord,
        method: &str,
        url: &str,
        user_id: Option<&str>,
    ) -> Result<SignedRequest> {
        let absolute = resolve_host_url(&host.base_url, url)?;
        self.sign(method, &absolute, user_id)
    }

    /// Sign a request to an absolute URL
    pub fn sign(&self, method: &str, url: &str, user_id: Option<&str>) -> Result<SignedRequest> {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let timestamp = chrono::Utc::now().timestamp();
        self.sign_with(method, url, user_id, &nonce, timestamp)
    }

    #[instrument(skip(self, nonce), fields(consumer_key = %self.consumer_key))]
    pub(crate) fn sign_with(
        &self,
        method: &str,
        url: &str,
        user_id: Option<&str>,
        nonce: &str,
        timestamp: i64,
    ) -> Result<SignedRequest> {
        let method = method.trim().to_uppercase();
        if method.is_empty() {
            return Err(ConnectError::Signing("HTTP method is required".into()));
        }

        let mut url = Url::parse(url)
            .map_err(|e| ConnectError::Signing(format!("Malformed request URL: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConnectError::Signing(format!(
                "Unsupported URL scheme: {}",
                url.scheme()
            )));
        }
        url.set_fragment(None);

        if let Some(user_id) = user_id {
            url.query_pairs_mut()
                .append_pair(USER_ID_QUERY_PARAMETER, user_id);
        }

        let oauth_params = vec![
            ("oauth_consumer_key".to_string(), self.consumer_key.clone()),
            ("oauth_nonce".to_string(), nonce.to_string()),
            (
                "oauth_signature_method".to_string(),
                OAUTH_SIGNATURE_METHOD.to_string(),
            ),
            ("oauth_timestamp".to_string(), timestamp.to_string()),
            ("oauth_version".to_string(), OAUTH_VERSION.to_string()),
        ];

        let mut params: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        params.extend(oauth_params.iter().cloned());

        let base_string = signature_base_string(&method, &url, &params);
        debug!(method = %method, url = %url, "Creating OAuth signature");

        let key_pair = self
            .keys
            .get_key_pair()
            .map_err(|e| ConnectError::Signing(format!("Local key pair unavailable: {e}")))?;
        let signing_key = SigningKey::<Sha1>::new(key_pair.private_key().clone());
        let signature = signing_key
            .try_sign(base_string.as_bytes())
            .map_err(|e| ConnectError::Signing(format!("Failed to sign the request: {e}")))?;
        let signature = BASE64.encode(signature.to_bytes());

        let mut header_params = oauth_params;
        header_params.push(("oauth_signature".to_string(), signature));

        let authorization = format!(
            "OAuth realm=\"\", {}",
            header_params
                .iter()
                .map(|(k, v)| format!("{}=\"{}\"", percent_encode(k), percent_encode(v)))
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(SignedRequest {
            method,
            url: url.to_string(),
            authorization,
        })
    }
}

/// RFC 5849 signature base string
pub fn signature_base_string(method: &str, url: &Url, params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (percent_encode(k), percent_encode(v)))
        .collect();
    encoded.sort();

    let normalized = encoded
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    format!(
        "{}&{}&{}",
        method.to_uppercase(),
        percent_encode(&base_uri(url)),
        percent_encode(&normalized)
    )
}

/// Scheme, authority and path; default ports dropped, no query or fragment
fn base_uri(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}://{}:{}{}", url.scheme(), host, port, url.path()),
        None => format!("{}://{}{}", url.scheme(), host, url.path()),
    }
}

/// Resolve a request URL against a host's base URL.
///
/// Absolute URLs are accepted only when they start with the base URL.
pub fn resolve_host_url(base_url: &str, url: &str) -> Result<String> {
    let base = base_url.trim_end_matches('/');

    if Url::parse(url).is_ok() {
        let rest = url.strip_prefix(base).ok_or_else(|| {
            ConnectError::Signing("Absolute request URL must begin with the host base URL".into())
        })?;
        if !(rest.is_empty() || rest.starts_with('/') || rest.starts_with('?')) {
            return Err(ConnectError::Signing(
                "Absolute request URL must begin with the host base URL".into(),
            ));
        }
        return Ok(url.to_string());
    }

    Ok(format!("{}/{}", base, url.trim_start_matches('/')))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosts::Credential;
    use crate::keys::{test_key_pair, LocalKeyPair};
    use rsa::pkcs1v15::{Signature, VerifyingKey};
    use rsa::signature::Verifier;

    fn signer() -> OAuthSigner {
        let fixture = test_key_pair();
        let key_pair = LocalKeyPair::from_pem(fixture.public_pem(), fixture.private_pem()).unwrap();
        OAuthSigner::new("my-addon", Arc::new(KeyPairProvider::with_key_pair(key_pair)))
    }

    fn header_param(header: &str, name: &str) -> String {
        let prefix = format!("{}=\"", name);
        let start = header.find(&prefix).unwrap() + prefix.len();
        let end = start + header[start..].find('"').unwrap();
        urlencoding::decode(&header[start..end]).unwrap().into_owned()
    }

    #[test]
    fn test_base_string_format() {
        let url = Url::parse("HTTPS://Host.Example:443/rest/api?b=2&a=1").unwrap();
        let params = vec![
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
            ("oauth_nonce".to_string(), "n 1".to_string()),
        ];

        assert_eq!(
            signature_base_string("get", &url, &params),
            "GET&https%3A%2F%2Fhost.example%2Frest%2Fapi&a%3D1%26b%3D2%26oauth_nonce%3Dn%25201"
        );
    }

    #[test]
    fn test_base_uri_keeps_non_default_port() {
        let url = Url::parse("http://localhost:2990/jira/rest").unwrap();
        assert_eq!(base_uri(&url), "http://localhost:2990/jira/rest");
    }

    #[test]
    fn test_signature_verifies_with_public_key() {
        let signer = signer();
        let signed = signer
            .sign_with("GET", "https://host.example/rest/api/2/issue?expand=names", None, "nonce-1", 1_700_000_000)
            .unwrap();

        assert!(signed.authorization.starts_with("OAuth realm=\"\", oauth_consumer_key="));
        assert_eq!(header_param(&signed.authorization, "oauth_signature_method"), "RSA-SHA1");
        assert_eq!(header_param(&signed.authorization, "oauth_consumer_key"), "my-addon");
        assert_eq!(header_param(&signed.authorization, "oauth_timestamp"), "1700000000");
        assert_eq!(header_param(&signed.authorization, "oauth_version"), "1.0");

        let url = Url::parse(&signed.url).unwrap();
        let params = vec![
            ("expand".to_string(), "names".to_string()),
            ("oauth_consumer_key".to_string(), "my-addon".to_string()),
            ("oauth_nonce".to_string(), "nonce-1".to_string()),
            ("oauth_signature_method".to_string(), "RSA-SHA1".to_string()),
            ("oauth_timestamp".to_string(), "1700000000".to_string()),
            ("oauth_version".to_string(), "1.0".to_string()),
        ];
        let base = signature_base_string("GET", &url, &params);

        let signature_bytes = BASE64
            .decode(header_param(&signed.authorization, "oauth_signature"))
            .unwrap();
        let signature = Signature::try_from(signature_bytes.as_slice()).unwrap();
        let verifying_key = VerifyingKey::<Sha1>::new(test_key_pair().public_key().clone());
        assert!(verifying_key.verify(base.as_bytes(), &signature).is_ok());
    }

    #[test]
    fn test_user_id_is_appended_and_signed() {
        let signer = signer();
        let signed = signer
            .sign_with("post", "https://host.example/rest/thing", Some("fred"), "n", 1)
            .unwrap();

        assert_eq!(signed.method, "POST");
        assert_eq!(signed.url, "https://host.example/rest/thing?user_id=fred");

        let without_user = signer
            .sign_with("POST", "https://host.example/rest/thing", None, "n", 1)
            .unwrap();
        assert_ne!(
            header_param(&signed.authorization, "oauth_signature"),
            header_param(&without_user.authorization, "oauth_signature")
        );
    }

    #[test]
    fn test_nonce_differs_per_request() {
        let signer = signer();
        let first = signer.sign("GET", "https://host.example/a", None).unwrap();
        let second = signer.sign("GET", "https://host.example/a", None).unwrap();
        assert_ne!(
            header_param(&first.authorization, "oauth_nonce"),
            header_param(&second.authorization, "oauth_nonce")
        );
    }

    #[test]
    fn test_malformed_url_aborts() {
        let signer = signer();
        assert!(matches!(
            signer.sign("GET", "not a url", None),
            Err(ConnectError::Signing(_))
        ));
        assert!(matches!(
            signer.sign("GET", "ftp://host.example/file", None),
            Err(ConnectError::Signing(_))
        ));
    }

    #[test]
    fn test_missing_key_pair_aborts() {
        use crate::keys::{KeyMaterial, KeyPairConfig};

        let keys = Arc::new(KeyPairProvider::new(KeyPairConfig::new(KeyMaterial::Absent, false)));
        let signer = OAuthSigner::new("my-addon", keys);
        assert!(matches!(
            signer.sign("GET", "https://host.example/a", None),
            Err(ConnectError::Signing(_))
        ));
    }

    #[test]
    fn test_resolve_host_url() {
        assert_eq!(
            resolve_host_url("https://host.example/", "/rest/api").unwrap(),
            "https://host.example/rest/api"
        );
        assert_eq!(
            resolve_host_url("https://host.example", "rest/api").unwrap(),
            "https://host.example/rest/api"
        );
        assert_eq!(
            resolve_host_url("https://host.example", "https://host.example/rest").unwrap(),
            "https://host.example/rest"
        );
        assert!(resolve_host_url("https://host.example", "https://other.example/rest").is_err());
        assert!(resolve_host_url("https://host.example", "https://host.example.evil.com/").is_err());
    }

    #[test]
    fn test_sign_for_host_uses_base_url() {
        let host = HostRecord::new(
            "host-key",
            "https://host.example/wiki",
            "PK",
            Credential::PublicKey("PK".into()),
        );
        let signed = signer()
            .sign_for_host(&host, "GET", "/rest/api/space", None)
            .unwrap();
        assert_eq!(signed.url, "https://host.example/wiki/rest/api/space");
    }
}
