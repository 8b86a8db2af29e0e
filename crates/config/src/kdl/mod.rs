//! KDL configuration parsing.

use anyhow::Result;
use miette::{NamedSource, Report};
use tracing::trace;

use crate::Config;

mod helpers;
mod settings;

use settings::{
    parse_account, parse_challenges, parse_logging, parse_renewal, parse_store, parse_sync,
};

const TOP_LEVEL_BLOCKS: &[&str] = &[
    "account",
    "store",
    "challenges",
    "renewal",
    "sync",
    "logging",
];

/// Parse a complete configuration document
pub fn parse_document(content: &str, source_name: &str) -> Result<Config> {
    let doc: ::kdl::KdlDocument = content.parse().map_err(|e: ::kdl::KdlError| {
        let report = Report::new(e)
            .with_source_code(NamedSource::new(source_name, content.to_string()));
        anyhow::anyhow!("Failed to parse KDL configuration:\n{:?}", report)
    })?;

    let mut config = Config::default();
    let mut saw_account = false;

    for node in doc.nodes() {
        let name = node.name().value();
        trace!(block = %name, "Parsing configuration block");

        match name {
            "account" => {
                config.account = parse_account(node)?;
                saw_account = true;
            }
            "store" => config.store = parse_store(node)?,
            "challenges" => config.challenges = parse_challenges(node)?,
            "renewal" => config.renewal = parse_renewal(node)?,
            "sync" => config.sync = parse_sync(node)?,
            "logging" => config.logging = parse_logging(node)?,
            other => {
                return Err(anyhow::anyhow!(
                    "Unknown configuration block '{}'. Valid blocks: {}",
                    other,
                    TOP_LEVEL_BLOCKS.join(", ")
                ));
            }
        }
    }

    if !saw_account {
        return Err(anyhow::anyhow!(
            "Configuration requires an 'account' block, e.g., account {{ email \"admin@example.com\" }}"
        ));
    }

    Ok(config)
}
