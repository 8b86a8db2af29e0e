//! Records persisted by the store.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// ACME account bound to this instance
///
/// `key` is the sealed account credential; it is only ever opened by the
/// account bootstrapper.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Contact email (unique key)
    pub email: String,
    /// Account URI assigned by the ACME endpoint
    pub uri: String,
    /// Sealed signing credential
    #[serde(with = "base64_bytes")]
    pub key: Vec<u8>,
}

impl Account {
    /// Reject accounts with missing required fields
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.email.is_empty() {
            return Err(ValidationError::missing("account", "email"));
        }
        if self.uri.is_empty() {
            return Err(ValidationError::missing("account", "URI"));
        }
        if self.key.is_empty() {
            return Err(ValidationError::missing("account", "key"));
        }
        Ok(())
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("email", &self.email)
            .field("uri", &self.uri)
            .field("key_len", &self.key.len())
            .finish()
    }
}

/// Issued certificate for one registrable domain
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    /// Registrable domain (unique key)
    pub domain: String,
    /// Additional hostnames, sorted, never containing `domain`
    pub alternative_names: Vec<String>,
    /// End of the leaf certificate's validity
    pub expires: DateTime<Utc>,
    /// PEM-encoded certificate chain, leaf first
    pub certificate_chain: String,
    /// PEM-encoded private key
    pub private_key: String,
    /// Hex SHA-256 of the leaf certificate's DER bytes
    pub thumbprint: String,
}

impl Certificate {
    /// Every name covered by the certificate, primary domain first
    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.domain.as_str()).chain(self.alternative_names.iter().map(String::as_str))
    }

    /// Owned copy of [`Certificate::names`]
    pub fn all_domains(&self) -> Vec<String> {
        self.names().map(str::to_string).collect()
    }

    /// Whether the certificate expires before `deadline`
    pub fn expires_before(&self, deadline: DateTime<Utc>) -> bool {
        self.expires < deadline
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("domain", &self.domain)
            .field("alternative_names", &self.alternative_names)
            .field("expires", &self.expires)
            .field("thumbprint", &self.thumbprint)
            .finish_non_exhaustive()
    }
}

/// HTTP-01 challenge response waiting to be served once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Challenge token
    pub key: String,
    /// Expected response (key authorization)
    pub value: String,
}

impl Challenge {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Reject challenges with missing required fields
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.key.is_empty() {
            return Err(ValidationError::missing("challenge", "key"));
        }
        if self.value.is_empty() {
            return Err(ValidationError::missing("challenge", "value"));
        }
        Ok(())
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
