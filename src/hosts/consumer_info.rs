//! Host consumer info
//!
//! Every host publishes its OAuth consumer descriptor at a well-known path.
//! Registration fetches it to learn the host's public key from the host
//! itself rather than from the registration call.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::types::{ConnectError, RegistrationError};

/// Path of the consumer info endpoint, relative to the host base URL
pub const CONSUMER_INFO_PATH: &str = "/plugins/servlet/oauth/consumer-info";

/// Parsed consumer descriptor
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    #[serde(default)]
    pub key: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default, alias = "public_key")]
    pub public_key: Option<String>,
}

impl ConsumerInfo {
    /// The published public key, if present and non-blank
    pub fn public_key(&self) -> Option<&str> {
        self.public_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }
}

/// Raw consumer info response
#[derive(Debug, Clone)]
pub struct ConsumerInfoResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl ConsumerInfoResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport for consumer info requests
#[async_trait]
pub trait ConsumerInfoClient: Send + Sync {
    async fn get(&self, url: &str) -> Result<ConsumerInfoResponse, RegistrationError>;
}

/// reqwest-backed client
pub struct HttpConsumerInfoClient {
    http_client: reqwest::Client,
}

impl HttpConsumerInfoClient {
    pub fn new(timeout: Duration) -> Result<Self, ConnectError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("connect-auth/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConnectError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { http_client })
    }
}

#[async_trait]
impl ConsumerInfoClient for HttpConsumerInfoClient {
    async fn get(&self, url: &str) -> Result<ConsumerInfoResponse, RegistrationError> {
        debug!(url = %url, "Fetching consumer info");

        let response = self
            .http_client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/xml, application/json")
            .send()
            .await
            .map_err(|e| RegistrationError::PublicKeyFetchFailure(e.to_string()))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .await
            .map_err(|e| RegistrationError::PublicKeyFetchFailure(e.to_string()))?;

        Ok(ConsumerInfoResponse {
            status,
            content_type,
            body,
        })
    }
}

/// Consumer info URL for a host base URL
pub fn consumer_info_url(base_url: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), CONSUMER_INFO_PATH)
}

/// Parse a consumer info body as JSON or XML.
///
/// JSON is chosen by content type, or by a leading `{` when no JSON content
/// type is given.
pub fn parse_consumer_info(
    body: &str,
    content_type: Option<&str>,
) -> Result<ConsumerInfo, RegistrationError> {
    let is_json = content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("json"))
        || body.trim_start().starts_with('{');

    if is_json {
        serde_json::from_str(body).map_err(|e| {
            RegistrationError::PublicKeyFetchFailure(format!("Malformed consumer info JSON: {e}"))
        })
    } else {
        quick_xml::de::from_str(body).map_err(|e| {
            RegistrationError::PublicKeyFetchFailure(format!("Malformed consumer info XML: {e}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const XML_BODY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<consumer>
  <key>jira:12345</key>
  <name>JIRA</name>
  <publicKey>MIGfMA0GCSqGSIb3DQEBAQUAA4GNADCBiQKBgQC</publicKey>
  <description>Atlassian JIRA at https://host.example</description>
</consumer>"#;

    #[test]
    fn test_consumer_info_url() {
        assert_eq!(
            consumer_info_url("https://host.example/wiki/"),
            "https://host.example/wiki/plugins/servlet/oauth/consumer-info"
        );
    }

    #[test]
    fn test_parse_xml() {
        let info = parse_consumer_info(XML_BODY, Some("application/xml")).unwrap();
        assert_eq!(info.key.as_deref(), Some("jira:12345"));
        assert_eq!(info.public_key(), Some("MIGfMA0GCSqGSIb3DQEBAQUAA4GNADCBiQKBgQC"));
    }

    #[test]
    fn test_parse_xml_without_public_key() {
        let body = "<consumer><key>jira:1</key><name>JIRA</name></consumer>";
        let info = parse_consumer_info(body, None).unwrap();
        assert_eq!(info.public_key(), None);
    }

    #[test]
    fn test_parse_json() {
        let body = r#"{"key":"conf:1","publicKey":"  PK  ","extra":true}"#;
        let info = parse_consumer_info(body, Some("application/json;charset=UTF-8")).unwrap();
        assert_eq!(info.public_key(), Some("PK"));
    }

    #[test]
    fn test_blank_public_key_is_missing() {
        let info = parse_consumer_info(r#"{"publicKey":"   "}"#, None).unwrap();
        assert_eq!(info.public_key(), None);
    }

    #[test]
    fn test_malformed_json_is_fetch_failure() {
        let err = parse_consumer_info("{not json", Some("application/json")).unwrap_err();
        assert!(matches!(err, RegistrationError::PublicKeyFetchFailure(_)));
    }
}
