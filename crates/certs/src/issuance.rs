//! Certificate issuance and renewal
//!
//! Turns a set of requested hostnames into persisted certificates: one per
//! registrable domain, carrying every alternative name previously stored
//! for that domain plus the newly requested ones.

use std::sync::Arc;

use sentinel_certs_common::Telemetry;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::authz::{group_domains, merge_sans, normalize, AuthorizationEngine};
use crate::error::AcmeResult;
use crate::model::Certificate;
use crate::protocol::AcmeEndpoint;
use crate::store::Store;

pub struct IssuanceOrchestrator {
    store: Arc<dyn Store>,
    endpoint: Arc<dyn AcmeEndpoint>,
    authz: Arc<AuthorizationEngine>,
    telemetry: Telemetry,
}

impl IssuanceOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        endpoint: Arc<dyn AcmeEndpoint>,
        authz: Arc<AuthorizationEngine>,
        telemetry: &Telemetry,
    ) -> Self {
        Self {
            store,
            endpoint,
            authz,
            telemetry: telemetry.component("issuance"),
        }
    }

    pub fn authorization(&self) -> &AuthorizationEngine {
        &self.authz
    }

    /// Authorize `domains` and each group's primary name, then issue one
    /// certificate per registrable domain
    ///
    /// Stops at the first failure. Certificates persisted before the failure
    /// stay persisted.
    #[instrument(skip(self), parent = self.telemetry.span())]
    pub async fn issue_or_renew(&self, domains: &[String]) -> AcmeResult<Vec<Certificate>> {
        // Rejects unusable names before any authorization is attempted
        let groups = group_domains(domains)?;

        info!(domains = ?domains, groups = groups.len(), "Create new certificate");

        // Every certificate is requested under its group's primary name, so
        // that name is authorized even when only subdomains were asked for
        let mut to_authorize: Vec<String> = Vec::with_capacity(domains.len() + groups.len());
        for name in domains
            .iter()
            .map(|domain| normalize(domain))
            .chain(groups.iter().map(|group| Ok(group.domain.clone())))
        {
            let name = name?;
            if !to_authorize.contains(&name) {
                to_authorize.push(name);
            }
        }

        for domain in &to_authorize {
            self.authz.authorize(domain).await?;
        }

        let mut issued = Vec::with_capacity(groups.len());
        for group in groups {
            let start = Instant::now();

            let stored = self.store.get_certificate(&group.domain).await?;
            let stored_sans = stored
                .as_ref()
                .map(|c| c.alternative_names.as_slice())
                .unwrap_or_default();
            let sans = merge_sans(&group.domain, stored_sans, &group.sans);

            debug!(
                domain = %group.domain,
                sans = ?sans,
                renewing = stored.is_some(),
                "Requesting certificate"
            );

            let cert = self.endpoint.create_certificate(&group.domain, &sans).await?;

            let certificate = Certificate {
                domain: group.domain,
                alternative_names: sans,
                expires: cert.leaf.not_after,
                thumbprint: cert.leaf.thumbprint(),
                certificate_chain: cert.chain_pem,
                private_key: cert.key_pem,
            };
            self.store.put_certificate(&certificate).await?;
            self.telemetry.metrics().record_issued();

            info!(
                domain = %certificate.domain,
                expires = %certificate.expires,
                thumbprint = %certificate.thumbprint,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Certificate stored"
            );
            issued.push(certificate);
        }

        Ok(issued)
    }
}

impl std::fmt::Debug for IssuanceOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuanceOrchestrator").finish_non_exhaustive()
    }
}
