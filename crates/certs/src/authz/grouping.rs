//! Grouping of hostnames under their registrable domain.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use crate::error::AcmeError;

/// Hostnames that share one certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainGroup {
    /// Registrable domain; the certificate's primary name
    pub domain: String,
    /// Requested names other than `domain`
    pub sans: BTreeSet<String>,
}

/// Canonical form of a requested hostname
pub fn normalize(domain: &str) -> Result<String, AcmeError> {
    let normalized = domain.trim().trim_end_matches('.').to_ascii_lowercase();

    if normalized.is_empty() {
        return Err(invalid(domain, "domain is empty"));
    }
    if normalized.parse::<IpAddr>().is_ok() {
        return Err(invalid(domain, "IP addresses have no registrable domain"));
    }
    if normalized.split('.').any(str::is_empty) {
        return Err(invalid(domain, "domain has an empty label"));
    }
    if !normalized
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.')
    {
        return Err(invalid(domain, "domain contains invalid characters"));
    }

    Ok(normalized)
}

/// Public suffix plus one label
pub fn registrable_domain(domain: &str) -> Result<String, AcmeError> {
    let normalized = normalize(domain)?;
    psl::domain_str(&normalized)
        .map(str::to_string)
        .ok_or_else(|| invalid(domain, "domain is a public suffix"))
}

/// Group requested names by registrable domain, sorted by that domain
pub fn group_domains<S: AsRef<str>>(domains: &[S]) -> Result<Vec<DomainGroup>, AcmeError> {
    let mut groups: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for domain in domains {
        let name = normalize(domain.as_ref())?;
        let registrable = registrable_domain(&name)?;
        let sans = groups.entry(registrable.clone()).or_default();
        if name != registrable {
            sans.insert(name);
        }
    }

    Ok(groups
        .into_iter()
        .map(|(domain, sans)| DomainGroup { domain, sans })
        .collect())
}

/// Union of stored and requested alternative names, sorted, without `primary`
pub fn merge_sans<'a>(
    primary: &str,
    stored: impl IntoIterator<Item = &'a String>,
    requested: impl IntoIterator<Item = &'a String>,
) -> Vec<String> {
    stored
        .into_iter()
        .chain(requested)
        .filter(|name| name.as_str() != primary)
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn invalid(domain: &str, reason: &str) -> AcmeError {
    AcmeError::InvalidDomain {
        domain: domain.to_string(),
        reason: reason.to_string(),
    }
}
