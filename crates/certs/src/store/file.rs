//! Filesystem store
//!
//! # Directory Structure
//!
//! ```text
//! storage/
//! ├── accounts/
//! │   └── admin@example.com.json   # Account record (sealed key, base64)
//! ├── domains/
//! │   └── example.com/
//! │       ├── cert.pem             # Certificate chain
//! │       ├── key.pem              # Private key
//! │       └── meta.json            # SANs, expiry, thumbprint
//! └── challenges/
//!     └── <token>                  # Expected challenge response
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, trace};

use super::{validate_certificate, Store};
use crate::error::{StorageError, ValidationError};
use crate::model::{Account, Certificate, Challenge};

const ACCOUNTS_DIR: &str = "accounts";
const DOMAINS_DIR: &str = "domains";
const CHALLENGES_DIR: &str = "challenges";

/// Certificate metadata stored alongside the PEM files
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CertificateMeta {
    domain: String,
    #[serde(default)]
    alternative_names: Vec<String>,
    expires: DateTime<Utc>,
    thumbprint: String,
    /// When this record was written
    issued: DateTime<Utc>,
}

/// Store rooted at a directory on the local filesystem
///
/// Directories are created with mode 0700 and secret-bearing files with
/// mode 0600 on Unix.
#[derive(Debug, Clone)]
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store at `base_path`
    pub async fn open(base_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let base_path = base_path.as_ref().to_path_buf();

        for dir in [
            base_path.clone(),
            base_path.join(ACCOUNTS_DIR),
            base_path.join(DOMAINS_DIR),
            base_path.join(CHALLENGES_DIR),
        ] {
            fs::create_dir_all(&dir).await?;
            restrict(&dir, 0o700).await?;
        }

        info!(
            storage_path = %base_path.display(),
            "Initialized certificate store"
        );

        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn account_path(&self, email: &str) -> Result<PathBuf, ValidationError> {
        safe_component("account", email)?;
        Ok(self
            .base_path
            .join(ACCOUNTS_DIR)
            .join(format!("{}.json", email)))
    }

    fn domain_path(&self, domain: &str) -> Result<PathBuf, ValidationError> {
        safe_component("certificate", domain)?;
        Ok(self.base_path.join(DOMAINS_DIR).join(domain))
    }

    fn challenge_path(&self, key: &str) -> Result<PathBuf, ValidationError> {
        safe_component("challenge", key)?;
        Ok(self.base_path.join(CHALLENGES_DIR).join(key))
    }

    async fn load_certificate_dir(&self, dir: &Path) -> Result<Option<Certificate>, StorageError> {
        let meta_path = dir.join("meta.json");
        let Some(meta_content) = read_optional(&meta_path).await? else {
            trace!(path = %dir.display(), "No stored certificate found");
            return Ok(None);
        };
        let meta: CertificateMeta = serde_json::from_str(&meta_content)?;

        let certificate_chain = read_optional(&dir.join("cert.pem"))
            .await?
            .ok_or_else(|| missing_file(dir, "cert.pem"))?;
        let private_key = read_optional(&dir.join("key.pem"))
            .await?
            .ok_or_else(|| missing_file(dir, "key.pem"))?;

        debug!(
            domain = %meta.domain,
            expires = %meta.expires,
            "Loaded stored certificate"
        );

        Ok(Some(Certificate {
            domain: meta.domain,
            alternative_names: meta.alternative_names,
            expires: meta.expires,
            certificate_chain,
            private_key,
            thumbprint: meta.thumbprint,
        }))
    }
}

#[async_trait]
impl Store for FileStore {
    async fn get_account(&self, email: &str) -> Result<Option<Account>, StorageError> {
        let path = self.account_path(email)?;
        let Some(content) = read_optional(&path).await? else {
            trace!(email = %email, "No stored account found");
            return Ok(None);
        };
        let account: Account = serde_json::from_str(&content)?;
        debug!(email = %account.email, uri = %account.uri, "Loaded account");
        Ok(Some(account))
    }

    async fn put_account(&self, account: &Account) -> Result<(), StorageError> {
        account.validate()?;
        let path = self.account_path(&account.email)?;
        let content = serde_json::to_string_pretty(account)?;
        write_private(&path, content.as_bytes()).await?;

        info!(email = %account.email, "Saved account");
        Ok(())
    }

    async fn get_certificate(&self, domain: &str) -> Result<Option<Certificate>, StorageError> {
        let dir = self.domain_path(domain)?;
        self.load_certificate_dir(&dir).await
    }

    async fn list_certificates(&self) -> Result<Vec<Certificate>, StorageError> {
        let domains_path = self.base_path.join(DOMAINS_DIR);
        let mut entries = match fs::read_dir(&domains_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut certificates = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(cert) = self.load_certificate_dir(&entry.path()).await? {
                certificates.push(cert);
            }
        }

        Ok(certificates)
    }

    async fn put_certificate(&self, certificate: &Certificate) -> Result<(), StorageError> {
        validate_certificate(certificate)?;
        let dir = self.domain_path(&certificate.domain)?;
        fs::create_dir_all(&dir).await?;
        restrict(&dir, 0o700).await?;

        fs::write(dir.join("cert.pem"), &certificate.certificate_chain).await?;
        write_private(&dir.join("key.pem"), certificate.private_key.as_bytes()).await?;

        let mut alternative_names = certificate.alternative_names.clone();
        alternative_names.sort();
        alternative_names.dedup();

        let meta = CertificateMeta {
            domain: certificate.domain.clone(),
            alternative_names,
            expires: certificate.expires,
            thumbprint: certificate.thumbprint.clone(),
            issued: Utc::now(),
        };
        // Metadata last: a certificate without meta.json is not listed.
        fs::write(dir.join("meta.json"), serde_json::to_string_pretty(&meta)?).await?;

        info!(
            domain = %certificate.domain,
            expires = %certificate.expires,
            "Saved certificate to storage"
        );
        Ok(())
    }

    async fn get_challenge(&self, key: &str) -> Result<Option<Challenge>, StorageError> {
        let path = self.challenge_path(key)?;
        Ok(read_optional(&path)
            .await?
            .map(|value| Challenge::new(key, value)))
    }

    async fn put_challenge(&self, challenge: &Challenge) -> Result<(), StorageError> {
        challenge.validate()?;
        let path = self.challenge_path(&challenge.key)?;
        fs::write(&path, &challenge.value).await?;
        debug!(token = %challenge.key, "Saved challenge");
        Ok(())
    }

    async fn delete_challenge(&self, key: &str) -> Result<(), StorageError> {
        if key.is_empty() {
            return Err(ValidationError::missing("challenge", "key").into());
        }
        let path = self.challenge_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(token = %key, "Removed challenge");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Reject keys that are not exactly one harmless path component
fn safe_component(record: &'static str, key: &str) -> Result<(), ValidationError> {
    let reason = if key.is_empty() {
        "key is empty"
    } else if key.starts_with('.') {
        "key starts with a dot"
    } else if key.contains(['/', '\\', '\0']) {
        "key contains a path separator"
    } else {
        return Ok(());
    };

    Err(ValidationError::InvalidKey {
        record,
        key: key.to_string(),
        reason,
    })
}

async fn read_optional(path: &Path) -> Result<Option<String>, StorageError> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_private(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    fs::write(path, contents).await?;
    restrict(path, 0o600).await
}

#[cfg(unix)]
async fn restrict(path: &Path, mode: u32) -> Result<(), StorageError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restrict(_path: &Path, _mode: u32) -> Result<(), StorageError> {
    Ok(())
}

fn missing_file(dir: &Path, file: &str) -> StorageError {
    StorageError::InvalidStructure(format!("{} is missing {}", dir.display(), file))
}
