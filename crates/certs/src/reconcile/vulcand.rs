//! vulcand v2 API client
//!
//! Key pairs travel as base64-encoded byte strings:
//!
//! ```json
//! {"Host": {"Name": "example.com",
//!           "Settings": {"KeyPair": {"Cert": "LS0t...", "Key": "LS0t..."}}}}
//! ```

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{ExternalSystem, Host};
use crate::error::SyncError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize)]
struct HostsEnvelope {
    #[serde(rename = "Hosts", default)]
    hosts: Vec<ApiHost>,
}

#[derive(Debug, Serialize, Deserialize)]
struct HostEnvelope {
    #[serde(rename = "Host")]
    host: ApiHost,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiHost {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Settings", default)]
    settings: ApiHostSettings,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ApiHostSettings {
    #[serde(rename = "KeyPair", default, skip_serializing_if = "Option::is_none")]
    key_pair: Option<ApiKeyPair>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiKeyPair {
    #[serde(rename = "Cert", default)]
    cert: String,
    #[serde(rename = "Key", default)]
    key: String,
}

impl ApiHost {
    fn into_host(self) -> Result<Host, SyncError> {
        let (certificate_pem, private_key_pem) = match self.settings.key_pair {
            Some(pair) => (decode_bytes(&pair.cert)?, decode_bytes(&pair.key)?),
            None => (String::new(), String::new()),
        };
        Ok(Host {
            domain: self.name,
            certificate_pem,
            private_key_pem,
        })
    }

    fn from_host(host: &Host) -> Self {
        Self {
            name: host.domain.clone(),
            settings: ApiHostSettings {
                key_pair: Some(ApiKeyPair {
                    cert: STANDARD.encode(&host.certificate_pem),
                    key: STANDARD.encode(&host.private_key_pem),
                }),
            },
        }
    }
}

fn decode_bytes(encoded: &str) -> Result<String, SyncError> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| SyncError::Decode(format!("key pair is not valid base64: {}", e)))?;
    String::from_utf8(bytes)
        .map_err(|e| SyncError::Decode(format!("key pair is not valid UTF-8: {}", e)))
}

/// [`ExternalSystem`] backed by a vulcand API endpoint
#[derive(Debug, Clone)]
pub struct VulcandClient {
    client: Client,
    base_url: String,
}

impl VulcandClient {
    /// Create a client for the API at `address`, e.g. `http://127.0.0.1:8182`
    pub fn new(address: &str) -> Result<Self, SyncError> {
        Self::with_timeout(address, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(address: &str, timeout: Duration) -> Result<Self, SyncError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: address.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, SyncError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let body = response.text().await.unwrap_or_default();
        Err(SyncError::Status { status, url, body })
    }
}

#[async_trait]
impl ExternalSystem for VulcandClient {
    async fn get_hosts(&self) -> Result<Vec<Host>, SyncError> {
        let response = self.client.get(self.url("/v2/hosts")).send().await?;
        let envelope: HostsEnvelope = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| SyncError::Decode(format!("Failed to parse hosts response: {}", e)))?;

        trace!(count = envelope.hosts.len(), "Fetched vulcand hosts");
        envelope.hosts.into_iter().map(ApiHost::into_host).collect()
    }

    async fn get_host(&self, domain: &str) -> Result<Option<Host>, SyncError> {
        let response = self
            .client
            .get(self.url(&format!("/v2/hosts/{}", domain)))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            trace!(domain = %domain, "Host not found in vulcand");
            return Ok(None);
        }

        let host: ApiHost = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| SyncError::Decode(format!("Failed to parse host response: {}", e)))?;

        host.into_host().map(Some)
    }

    async fn put_host(&self, host: &Host) -> Result<(), SyncError> {
        let body = HostEnvelope {
            host: ApiHost::from_host(host),
        };
        let response = self
            .client
            .post(self.url("/v2/hosts"))
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;

        debug!(domain = %host.domain, "Upserted vulcand host");
        Ok(())
    }
}
