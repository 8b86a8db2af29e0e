//! Configuration for sentinel-certs.
//!
//! Configuration is written in KDL and loaded with [`Config::from_file`].
//! Every block is optional except `account`, and every setting has a default
//! apart from the contact email.
//!
//! ```kdl
//! account {
//!     email "admin@example.com"
//!     accept-tos #true
//!     directory "https://acme-v02.api.letsencrypt.org/directory"
//!     seal-key-env "SENTINEL_CERTS_SEAL_KEY"
//! }
//! store { path "/var/lib/sentinel-certs" }
//! challenges {
//!     listen "0.0.0.0:8080"
//!     path-prefix ".well-known/acme-challenge"
//! }
//! renewal {
//!     check-interval-secs 3600
//!     renew-before-days 7
//! }
//! sync { vulcand "http://127.0.0.1:8182" }
//! logging {
//!     level "info"
//!     format "json"
//! }
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use validator::Validate;

pub use sentinel_certs_common::LogFormat;

mod kdl;

/// Let's Encrypt production directory URL
pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
/// Let's Encrypt staging directory URL
pub const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Default environment variable holding the seal key
pub const DEFAULT_SEAL_KEY_ENV: &str = "SENTINEL_CERTS_SEAL_KEY";
/// Default challenge path prefix
pub const DEFAULT_PATH_PREFIX: &str = ".well-known/acme-challenge";

// ============================================================================
// Configuration types
// ============================================================================

/// Complete sentinel-certs configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    pub account: AccountConfig,
    #[validate(nested)]
    pub store: StoreConfig,
    #[validate(nested)]
    pub challenges: ChallengeConfig,
    #[validate(nested)]
    pub renewal: RenewalConfig,
    #[validate(nested)]
    pub sync: SyncConfig,
    #[validate(nested)]
    pub logging: LoggingConfig,
}

/// ACME account settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AccountConfig {
    /// Contact email of the registrant; also the account's store key
    #[validate(email)]
    pub email: String,
    /// Accept the CA's terms of service on registration
    pub accept_tos: bool,
    /// ACME directory URL
    #[validate(url)]
    pub directory: String,
    /// Environment variable the seal key is read from
    #[validate(length(min = 1))]
    pub seal_key_env: String,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            email: String::new(),
            accept_tos: false,
            directory: LETSENCRYPT_STAGING.to_string(),
            seal_key_env: DEFAULT_SEAL_KEY_ENV.to_string(),
        }
    }
}

/// Durable store settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StoreConfig {
    /// Base directory of the filesystem store
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/sentinel-certs"),
        }
    }
}

/// HTTP-01 challenge server settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ChallengeConfig {
    /// Listen address, e.g. `0.0.0.0:8080`
    #[validate(length(min = 1))]
    pub listen: String,
    /// URL path prefix under which tokens are served
    #[validate(length(min = 1))]
    pub path_prefix: String,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            path_prefix: DEFAULT_PATH_PREFIX.to_string(),
        }
    }
}

impl ChallengeConfig {
    /// Parsed listen address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .with_context(|| format!("Invalid challenge listen address '{}'", self.listen))
    }
}

/// Renewal scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RenewalConfig {
    /// Seconds between renewal scans
    #[validate(range(min = 1))]
    pub check_interval_secs: u64,
    /// Renew certificates expiring within this many days
    #[validate(range(min = 1))]
    pub renew_before_days: u32,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 3600,
            renew_before_days: 7,
        }
    }
}

impl RenewalConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn renew_before(&self) -> Duration {
        Duration::from_secs(u64::from(self.renew_before_days) * 86_400)
    }
}

/// External system synchronization settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct SyncConfig {
    /// vulcand API endpoint; synchronization is disabled when unset
    #[validate(url)]
    pub vulcand: Option<String>,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[validate(length(min = 1))]
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

// ============================================================================
// Loading and validation
// ============================================================================

impl Config {
    /// Load configuration from a KDL file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;

        let config = Self::from_kdl(&content, &path.display().to_string())?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse configuration from KDL text.
    ///
    /// `source_name` is used in parse diagnostics.
    pub fn from_kdl(content: &str, source_name: &str) -> Result<Self> {
        crate::kdl::parse_document(content, source_name)
    }

    /// Validate field rules and cross-field constraints
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).context("Invalid configuration")?;

        self.challenges.listen_addr()?;

        if self.challenges.path_prefix.trim_matches('/').is_empty() {
            return Err(anyhow::anyhow!(
                "Challenge path-prefix must contain at least one path segment"
            ));
        }

        if let Some(ref endpoint) = self.sync.vulcand {
            let url = url::Url::parse(endpoint)
                .with_context(|| format!("Invalid vulcand endpoint '{}'", endpoint))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(anyhow::anyhow!(
                    "vulcand endpoint must use http or https, got '{}'",
                    url.scheme()
                ));
            }
        }

        debug!(
            email = %self.account.email,
            directory = %self.account.directory,
            store = %self.store.path.display(),
            "Configuration validated"
        );

        Ok(())
    }

    /// Whether the configured directory is a Let's Encrypt staging endpoint
    pub fn is_staging(&self) -> bool {
        self.account.directory.contains("staging")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            account: AccountConfig {
                email: "admin@example.com".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_validate_with_email() {
        let config = valid();
        config.validate().unwrap();
        assert!(config.is_staging());
        assert_eq!(config.renewal.renew_before(), Duration::from_secs(7 * 86_400));
        assert_eq!(config.renewal.check_interval(), Duration::from_secs(3600));
    }

    #[test]
    fn test_missing_email_rejected() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_listen_address_rejected() {
        let mut config = valid();
        config.challenges.listen = "not-an-address".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("listen address"));
    }

    #[test]
    fn test_empty_path_prefix_rejected() {
        let mut config = valid();
        config.challenges.path_prefix = "///".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_vulcand_scheme_checked() {
        let mut config = valid();
        config.sync.vulcand = Some("ftp://127.0.0.1:8182".to_string());
        assert!(config.validate().is_err());

        config.sync.vulcand = Some("http://127.0.0.1:8182".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = valid();
        config.renewal.check_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("certs.kdl");
        std::fs::write(&path, "account {\n    email \"ops@example.org\"\n}\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.account.email, "ops@example.org");
        config.validate().unwrap();
    }
}
