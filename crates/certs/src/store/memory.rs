//! In-process store backed by concurrent maps.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::trace;

use super::{validate_certificate, Store};
use crate::error::{StorageError, ValidationError};
use crate::model::{Account, Certificate, Challenge};

/// Store that keeps every record in memory
///
/// Clones share state. Useful for tests and for `listen`-only deployments
/// that never persist certificates.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    accounts: Arc<DashMap<String, Account>>,
    certificates: Arc<DashMap<String, Certificate>>,
    challenges: Arc<DashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending challenges
    pub fn pending_challenges(&self) -> usize {
        self.challenges.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_account(&self, email: &str) -> Result<Option<Account>, StorageError> {
        Ok(self.accounts.get(email).map(|a| a.clone()))
    }

    async fn put_account(&self, account: &Account) -> Result<(), StorageError> {
        account.validate()?;
        self.accounts.insert(account.email.clone(), account.clone());
        Ok(())
    }

    async fn get_certificate(&self, domain: &str) -> Result<Option<Certificate>, StorageError> {
        Ok(self.certificates.get(domain).map(|c| c.clone()))
    }

    async fn list_certificates(&self) -> Result<Vec<Certificate>, StorageError> {
        Ok(self.certificates.iter().map(|c| c.value().clone()).collect())
    }

    async fn put_certificate(&self, certificate: &Certificate) -> Result<(), StorageError> {
        validate_certificate(certificate)?;
        trace!(domain = %certificate.domain, "Storing certificate in memory");
        self.certificates
            .insert(certificate.domain.clone(), certificate.clone());
        Ok(())
    }

    async fn get_challenge(&self, key: &str) -> Result<Option<Challenge>, StorageError> {
        Ok(self
            .challenges
            .get(key)
            .map(|v| Challenge::new(key, v.value().clone())))
    }

    async fn put_challenge(&self, challenge: &Challenge) -> Result<(), StorageError> {
        challenge.validate()?;
        self.challenges
            .insert(challenge.key.clone(), challenge.value.clone());
        Ok(())
    }

    async fn delete_challenge(&self, key: &str) -> Result<(), StorageError> {
        if key.is_empty() {
            return Err(ValidationError::missing("challenge", "key").into());
        }
        self.challenges.remove(key);
        Ok(())
    }
}
