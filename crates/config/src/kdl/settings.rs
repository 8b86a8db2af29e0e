//! Per-block KDL parsing.

use anyhow::Result;
use std::path::PathBuf;
use tracing::trace;

use crate::{
    AccountConfig, ChallengeConfig, LogFormat, LoggingConfig, RenewalConfig, StoreConfig,
    SyncConfig,
};

use super::helpers::{ensure_known_children, get_bool_entry, get_int_entry, get_string_entry};

/// Parse the `account` block
pub fn parse_account(node: &kdl::KdlNode) -> Result<AccountConfig> {
    ensure_known_children(node, &["email", "accept-tos", "directory", "seal-key-env"])?;

    let email = get_string_entry(node, "email").ok_or_else(|| {
        anyhow::anyhow!("Account requires an 'email' field, e.g., email \"admin@example.com\"")
    })?;

    let defaults = AccountConfig::default();
    let config = AccountConfig {
        email,
        accept_tos: get_bool_entry(node, "accept-tos").unwrap_or(defaults.accept_tos),
        directory: get_string_entry(node, "directory").unwrap_or(defaults.directory),
        seal_key_env: get_string_entry(node, "seal-key-env").unwrap_or(defaults.seal_key_env),
    };

    trace!(
        email = %config.email,
        accept_tos = config.accept_tos,
        directory = %config.directory,
        "Parsed account configuration"
    );

    Ok(config)
}

/// Parse the `store` block
pub fn parse_store(node: &kdl::KdlNode) -> Result<StoreConfig> {
    ensure_known_children(node, &["path"])?;

    Ok(StoreConfig {
        path: get_string_entry(node, "path")
            .map(PathBuf::from)
            .unwrap_or_else(|| StoreConfig::default().path),
    })
}

/// Parse the `challenges` block
pub fn parse_challenges(node: &kdl::KdlNode) -> Result<ChallengeConfig> {
    ensure_known_children(node, &["listen", "path-prefix"])?;

    let defaults = ChallengeConfig::default();
    Ok(ChallengeConfig {
        listen: get_string_entry(node, "listen").unwrap_or(defaults.listen),
        path_prefix: get_string_entry(node, "path-prefix").unwrap_or(defaults.path_prefix),
    })
}

/// Parse the `renewal` block
pub fn parse_renewal(node: &kdl::KdlNode) -> Result<RenewalConfig> {
    ensure_known_children(node, &["check-interval-secs", "renew-before-days"])?;

    let defaults = RenewalConfig::default();

    let check_interval_secs = match get_int_entry(node, "check-interval-secs") {
        Some(v) => u64::try_from(v).map_err(|_| {
            anyhow::anyhow!("check-interval-secs must be a non-negative integer, got {}", v)
        })?,
        None => defaults.check_interval_secs,
    };

    let renew_before_days = match get_int_entry(node, "renew-before-days") {
        Some(v) => u32::try_from(v).map_err(|_| {
            anyhow::anyhow!("renew-before-days must be a non-negative integer, got {}", v)
        })?,
        None => defaults.renew_before_days,
    };

    trace!(
        check_interval_secs,
        renew_before_days,
        "Parsed renewal configuration"
    );

    Ok(RenewalConfig {
        check_interval_secs,
        renew_before_days,
    })
}

/// Parse the `sync` block
pub fn parse_sync(node: &kdl::KdlNode) -> Result<SyncConfig> {
    ensure_known_children(node, &["vulcand"])?;

    Ok(SyncConfig {
        vulcand: get_string_entry(node, "vulcand"),
    })
}

/// Parse the `logging` block
pub fn parse_logging(node: &kdl::KdlNode) -> Result<LoggingConfig> {
    ensure_known_children(node, &["level", "format"])?;

    let defaults = LoggingConfig::default();
    let format = match get_string_entry(node, "format") {
        Some(s) => s.parse::<LogFormat>().map_err(|e| anyhow::anyhow!(e))?,
        None => defaults.format,
    };

    Ok(LoggingConfig {
        level: get_string_entry(node, "level").unwrap_or(defaults.level),
        format,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first(doc: &str) -> kdl::KdlDocument {
        doc.parse().unwrap()
    }

    #[test]
    fn test_account_requires_email() {
        let doc = first("account { accept-tos #true; }");
        let err = parse_account(&doc.nodes()[0]).unwrap_err();
        assert!(err.to_string().contains("requires an 'email'"));
    }

    #[test]
    fn test_negative_interval_rejected() {
        let doc = first("renewal { check-interval-secs -5; }");
        assert!(parse_renewal(&doc.nodes()[0]).is_err());
    }

    #[test]
    fn test_invalid_log_format_rejected() {
        let doc = first("logging { format \"xml\"; }");
        let err = parse_logging(&doc.nodes()[0]).unwrap_err();
        assert!(err.to_string().contains("invalid log format"));
    }
}
