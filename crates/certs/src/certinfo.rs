//! X.509 helpers: leaf extraction, expiry, and thumbprints.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use x509_parser::pem::Pem;
use x509_parser::prelude::*;

use crate::error::AcmeError;

/// First certificate of a chain
#[derive(Clone, PartialEq, Eq)]
pub struct LeafCertificate {
    /// DER encoding of the leaf
    pub der: Vec<u8>,
    /// End of the leaf's validity
    pub not_after: DateTime<Utc>,
}

impl LeafCertificate {
    pub fn thumbprint(&self) -> String {
        thumbprint(&self.der)
    }
}

impl std::fmt::Debug for LeafCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafCertificate")
            .field("der_len", &self.der.len())
            .field("not_after", &self.not_after)
            .finish()
    }
}

/// Hex-encoded SHA-256 of DER bytes
pub fn thumbprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// DER bytes of the first `CERTIFICATE` block in a PEM bundle
///
/// Returns `Ok(None)` when the bundle holds no certificate (for example a
/// bundle that only contains a private key).
pub fn first_certificate_der(bundle: &str) -> Result<Option<Vec<u8>>, AcmeError> {
    for pem in Pem::iter_from_buffer(bundle.as_bytes()) {
        let pem =
            pem.map_err(|e| AcmeError::CertificateParse(format!("Failed to parse PEM: {}", e)))?;
        if pem.label == "CERTIFICATE" {
            return Ok(Some(pem.contents));
        }
    }
    Ok(None)
}

/// Parse the leaf of a PEM chain
pub fn parse_leaf(chain_pem: &str) -> Result<LeafCertificate, AcmeError> {
    let der = first_certificate_der(chain_pem)?
        .ok_or_else(|| AcmeError::CertificateParse("No certificate in chain".to_string()))?;

    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| AcmeError::CertificateParse(format!("Failed to parse certificate: {}", e)))?;

    let timestamp = cert.validity().not_after.timestamp();
    let not_after = DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| AcmeError::CertificateParse("Invalid expiry timestamp".to_string()))?;

    Ok(LeafCertificate { der, not_after })
}
