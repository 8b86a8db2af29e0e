//! Reconciliation of issued certificates into an external routing system
//!
//! For every name a certificate covers, the external host's current leaf is
//! compared by thumbprint against the local certificate. Hosts that already
//! serve the local leaf are skipped; absent or stale hosts are upserted.
//! Re-running on unchanged inputs therefore performs no writes.

use std::sync::Arc;

use async_trait::async_trait;
use sentinel_certs_common::Telemetry;
use tracing::{debug, info, instrument};

use crate::certinfo;
use crate::error::{AcmeResult, SyncError};
use crate::model::Certificate;

mod vulcand;

pub use vulcand::VulcandClient;

/// The external system's view of one hostname
#[derive(Clone, PartialEq, Eq)]
pub struct Host {
    pub domain: String,
    pub certificate_pem: String,
    pub private_key_pem: String,
}

impl Host {
    /// Host carrying the material of `certificate` for `domain`
    pub fn from_certificate(domain: &str, certificate: &Certificate) -> Self {
        Self {
            domain: domain.to_string(),
            certificate_pem: certificate.certificate_chain.clone(),
            private_key_pem: certificate.private_key.clone(),
        }
    }

    /// Thumbprint of the first certificate in the host's bundle
    ///
    /// `None` when the host has no certificate configured at all.
    pub fn thumbprint(&self) -> AcmeResult<Option<String>> {
        if self.certificate_pem.trim().is_empty() {
            return Ok(None);
        }
        let der = certinfo::first_certificate_der(&self.certificate_pem)?
            .ok_or_else(|| SyncError::NoCertificate(self.domain.clone()))?;
        Ok(Some(certinfo::thumbprint(&der)))
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("domain", &self.domain)
            .field("has_certificate", &!self.certificate_pem.is_empty())
            .finish_non_exhaustive()
    }
}

/// Traffic-routing system that terminates TLS for our hostnames
#[async_trait]
pub trait ExternalSystem: Send + Sync {
    async fn get_hosts(&self) -> Result<Vec<Host>, SyncError>;

    /// `None` when the host does not exist
    async fn get_host(&self, domain: &str) -> Result<Option<Host>, SyncError>;

    /// Create or replace a host
    async fn put_host(&self, host: &Host) -> Result<(), SyncError>;
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Hosts upserted
    pub pushed: usize,
    /// Hosts already serving the local certificate
    pub skipped: usize,
}

pub struct Reconciler {
    external: Arc<dyn ExternalSystem>,
    telemetry: Telemetry,
}

impl Reconciler {
    pub fn new(external: Arc<dyn ExternalSystem>, telemetry: &Telemetry) -> Self {
        Self {
            external,
            telemetry: telemetry.component("reconciler"),
        }
    }

    /// Push every certificate to every host it covers, skipping up-to-date hosts
    ///
    /// The first failing host aborts the whole pass.
    #[instrument(skip_all, fields(certificates = certs.len()), parent = self.telemetry.span())]
    pub async fn reconcile(&self, certs: &[Certificate]) -> AcmeResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for cert in certs {
            for name in cert.names() {
                debug!(
                    domain = %name,
                    thumbprint = %cert.thumbprint,
                    "Syncing certificate with external system"
                );

                if let Some(host) = self.external.get_host(name).await? {
                    let external = host.thumbprint()?;
                    debug!(domain = %name, thumbprint = ?external, "Found host in external system");

                    if external.as_deref() == Some(cert.thumbprint.as_str()) {
                        report.skipped += 1;
                        self.telemetry.metrics().record_skip();
                        continue;
                    }
                }

                self.external
                    .put_host(&Host::from_certificate(name, cert))
                    .await?;
                report.pushed += 1;
                self.telemetry.metrics().record_push();
                info!(domain = %name, thumbprint = %cert.thumbprint, "Pushed certificate to host");
            }
        }

        info!(
            pushed = report.pushed,
            skipped = report.skipped,
            "Reconciliation complete"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}
