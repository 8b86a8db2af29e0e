//! Error types for certificate lifecycle operations

use std::io;
use thiserror::Error;

/// Errors that can occur anywhere in the certificate lifecycle
#[derive(Debug, Error)]
pub enum AcmeError {
    /// Failure reported by the ACME endpoint
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Store operation failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Account key sealing or unsealing failed
    #[error("Secret error: {0}")]
    Secret(#[from] SecretError),

    /// External system synchronization failed
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// A requested hostname has no registrable domain
    #[error("Invalid domain '{domain}': {reason}")]
    InvalidDomain { domain: String, reason: String },

    /// Certificate parsing error
    #[error("Failed to parse certificate: {0}")]
    CertificateParse(String),
}

/// A write rejected for missing or unsafe required fields
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Required field was empty
    #[error("must specify {field} for {record}")]
    MissingField {
        record: &'static str,
        field: &'static str,
    },

    /// Key cannot be used as a store key
    #[error("invalid {record} key '{key}': {reason}")]
    InvalidKey {
        record: &'static str,
        key: String,
        reason: &'static str,
    },
}

impl ValidationError {
    pub fn missing(record: &'static str, field: &'static str) -> Self {
        Self::MissingField { record, field }
    }
}

/// Errors specific to store operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// Write rejected before reaching the backend
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// IO error during file operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize/deserialize a record
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stored data does not have the expected layout
    #[error("Invalid storage structure: {0}")]
    InvalidStructure(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Failures returned by the ACME endpoint
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// No account is bound to the session
    #[error("ACME account not initialized - bind an account first")]
    NoAccount,

    /// Account registration or restoration failed
    #[error("Failed to register ACME account: {0}")]
    AccountRegistration(String),

    /// Authorization request failed
    #[error("Authorization failed for domain '{domain}': {message}")]
    Authorization { domain: String, message: String },

    /// The CA has not finished validating the challenge yet
    #[error("Challenge for domain '{domain}' is still pending validation")]
    ChallengePending { domain: String },

    /// No pending challenge matches the given URI
    #[error("No pending challenge for URI: {0}")]
    ChallengeNotFound(String),

    /// No HTTP-01 challenge available for domain
    #[error("No HTTP-01 challenge available for domain '{0}'")]
    NoHttp01Challenge(String),

    /// Certificate issuance failed
    #[error("Failed to issue certificate: {0}")]
    Issuance(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The CA rejected the challenge; further attempts cannot succeed
    #[error("Challenge for domain '{domain}' was rejected: {message}")]
    ChallengeInvalid { domain: String, message: String },
}

impl ProtocolError {
    /// Whether another attempt at the same operation could succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ProtocolError::NoAccount
                | ProtocolError::ChallengeNotFound(_)
                | ProtocolError::ChallengeInvalid { .. }
        )
    }
}

/// Errors raised by the secret box
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecretError {
    /// The configured key is not a valid 256-bit key
    #[error("invalid seal key: {0}")]
    InvalidKey(String),

    /// Encryption failed
    #[error("failed to seal secret")]
    Seal,

    /// Ciphertext is malformed or was sealed with a different key
    #[error("failed to open secret: {0}")]
    Open(String),
}

/// Errors talking to the external traffic-routing system
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport-level failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The API answered with an unexpected status
    #[error("unexpected status {status} from {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },

    /// The API answered with a payload that could not be decoded
    #[error("invalid response: {0}")]
    Decode(String),

    /// A host's certificate bundle contains no certificate
    #[error("no certificate data found for host '{0}'")]
    NoCertificate(String),
}

/// Result alias used throughout the crate
pub type AcmeResult<T> = Result<T, AcmeError>;
