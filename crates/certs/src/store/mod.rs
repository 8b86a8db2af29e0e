//! Durable state for accounts, certificates, and pending challenges
//!
//! The store is the single source of truth for the orchestrator. Misses are
//! never errors: lookups return `Ok(None)`. Writes with missing required
//! fields are rejected with [`ValidationError`](crate::error::ValidationError)
//! before they reach the backend.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::model::{Account, Certificate, Challenge};

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Persistence capability used by every component
#[async_trait]
pub trait Store: Send + Sync {
    /// Look up the account registered with `email`
    async fn get_account(&self, email: &str) -> Result<Option<Account>, StorageError>;

    /// Persist an account, replacing any account with the same email
    async fn put_account(&self, account: &Account) -> Result<(), StorageError>;

    /// Look up the certificate for a registrable domain
    async fn get_certificate(&self, domain: &str) -> Result<Option<Certificate>, StorageError>;

    /// Every stored certificate, in no particular order
    async fn list_certificates(&self) -> Result<Vec<Certificate>, StorageError>;

    /// Persist a certificate, fully replacing the previous record
    async fn put_certificate(&self, certificate: &Certificate) -> Result<(), StorageError>;

    /// Look up a pending challenge by token
    async fn get_challenge(&self, key: &str) -> Result<Option<Challenge>, StorageError>;

    /// Persist a pending challenge
    async fn put_challenge(&self, challenge: &Challenge) -> Result<(), StorageError>;

    /// Remove a pending challenge; removing an unknown token is not an error
    async fn delete_challenge(&self, key: &str) -> Result<(), StorageError>;
}

/// Reject a certificate that cannot be keyed or served
pub(crate) fn validate_certificate(
    certificate: &Certificate,
) -> Result<(), crate::error::ValidationError> {
    use crate::error::ValidationError;

    if certificate.domain.is_empty() {
        return Err(ValidationError::missing("certificate", "domain"));
    }
    if certificate.certificate_chain.is_empty() {
        return Err(ValidationError::missing("certificate", "certificate chain"));
    }
    if certificate.private_key.is_empty() {
        return Err(ValidationError::missing("certificate", "private key"));
    }
    Ok(())
}
