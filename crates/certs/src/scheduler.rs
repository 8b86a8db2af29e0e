//! Background certificate renewal scheduler
//!
//! Periodically scans stored certificates, re-issues those close to expiry,
//! and pushes the renewed material to the external system.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sentinel_certs_common::Telemetry;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::error::{AcmeError, AcmeResult};
use crate::issuance::IssuanceOrchestrator;
use crate::model::Certificate;
use crate::reconcile::Reconciler;
use crate::store::Store;

/// Default check interval (1 hour)
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Default renewal threshold (7 days)
pub const DEFAULT_RENEW_BEFORE: Duration = Duration::from_secs(7 * 24 * 3600);

/// A certificate whose renewal failed during a tick
#[derive(Debug)]
pub struct RenewalFailure {
    pub domain: String,
    pub error: AcmeError,
}

/// Result of one renewal pass
#[derive(Debug, Default)]
pub struct RenewalOutcome {
    /// Certificates re-issued in this pass
    pub renewed: Vec<Certificate>,
    pub failed: Vec<RenewalFailure>,
}

impl RenewalOutcome {
    fn tick_label(&self) -> &'static str {
        match (self.renewed.is_empty(), self.failed.is_empty()) {
            (true, true) => "idle",
            (_, true) => "renewed",
            (true, false) => "failed",
            (false, false) => "partial",
        }
    }
}

/// Background certificate renewal scheduler
///
/// Runs as a single task. A tick's I/O finishes before the next wait begins,
/// so ticks never overlap.
pub struct RenewalScheduler {
    store: Arc<dyn Store>,
    issuer: Arc<IssuanceOrchestrator>,
    reconciler: Option<Arc<Reconciler>>,
    check_interval: Duration,
    renew_before: Duration,
    telemetry: Telemetry,
}

impl RenewalScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        issuer: Arc<IssuanceOrchestrator>,
        reconciler: Option<Arc<Reconciler>>,
        telemetry: &Telemetry,
    ) -> Self {
        Self {
            store,
            issuer,
            reconciler,
            check_interval: DEFAULT_CHECK_INTERVAL,
            renew_before: DEFAULT_RENEW_BEFORE,
            telemetry: telemetry.component("scheduler"),
        }
    }

    /// Set the time between ticks
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Renew certificates expiring within `threshold`
    pub fn with_threshold(mut self, threshold: Duration) -> Self {
        self.renew_before = threshold;
        self
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Re-issue every stored certificate expiring within `threshold`
    ///
    /// Per-certificate failures are recorded and do not stop the pass; only
    /// failing to list the store is an error.
    #[instrument(skip(self), parent = self.telemetry.span())]
    pub async fn scan_and_renew(&self, threshold: Duration) -> AcmeResult<RenewalOutcome> {
        let certs = self.store.list_certificates().await?;
        let deadline = chrono::Duration::from_std(threshold)
            .ok()
            .and_then(|threshold| Utc::now().checked_add_signed(threshold))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        info!(
            certificate_count = certs.len(),
            deadline = %deadline,
            "Checking certificates for renewal"
        );

        let mut outcome = RenewalOutcome::default();
        for cert in certs {
            if !cert.expires_before(deadline) {
                debug!(domain = %cert.domain, expires = %cert.expires, "Certificate is still valid");
                continue;
            }

            info!(domain = %cert.domain, expires = %cert.expires, "Certificate needs renewal");

            match self.issuer.issue_or_renew(&cert.all_domains()).await {
                Ok(renewed) => outcome.renewed.extend(renewed),
                Err(e) => {
                    error!(
                        domain = %cert.domain,
                        error = %e,
                        "Certificate renewal failed"
                    );
                    // Continue with other certificates
                    outcome.failed.push(RenewalFailure {
                        domain: cert.domain,
                        error: e,
                    });
                }
            }
        }

        Ok(outcome)
    }

    /// One tick: scan, renew, and reconcile what was renewed
    pub async fn tick(&self) -> AcmeResult<RenewalOutcome> {
        let start = Instant::now();
        let outcome = self.scan_and_renew(self.renew_before).await?;

        if !outcome.renewed.is_empty() {
            if let Some(reconciler) = &self.reconciler {
                if let Err(e) = reconciler.reconcile(&outcome.renewed).await {
                    error!(error = %e, "Failed to sync renewed certificates");
                }
            }
        }

        info!(
            renewed = outcome.renewed.len(),
            failed = outcome.failed.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Renewal check completed"
        );
        Ok(outcome)
    }

    /// Run the renewal loop until `shutdown` is cancelled
    ///
    /// Errors are logged; the loop never stops on failure.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            check_interval_secs = self.check_interval.as_secs(),
            renew_before_secs = self.renew_before.as_secs(),
            "Starting certificate renewal scheduler"
        );

        loop {
            let label = match self.tick().await {
                Ok(outcome) => outcome.tick_label(),
                Err(e) => {
                    error!(error = %e, "Certificate renewal check failed");
                    "error"
                }
            };
            self.telemetry.metrics().record_tick(label);

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Renewal scheduler stopped");
                    return;
                }
                _ = tokio::time::sleep(self.check_interval) => {
                    debug!("Running scheduled certificate renewal check");
                }
            }
        }
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("check_interval", &self.check_interval)
            .field("renew_before", &self.renew_before)
            .field("has_reconciler", &self.reconciler.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::AuthorizationEngine;
    use crate::error::StorageError;
    use crate::model::{Account, Challenge};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use crate::testing::{certificate_record, FakeEndpoint, RecordingExternalSystem};

    const DAY: Duration = Duration::from_secs(24 * 3600);

    struct Harness {
        store: MemoryStore,
        endpoint: Arc<FakeEndpoint>,
        external: Arc<RecordingExternalSystem>,
        telemetry: Telemetry,
        scheduler: RenewalScheduler,
    }

    /// Store whose certificate listing always fails
    struct UnlistableStore(MemoryStore);

    #[async_trait]
    impl Store for UnlistableStore {
        async fn get_account(&self, email: &str) -> Result<Option<Account>, StorageError> {
            self.0.get_account(email).await
        }

        async fn put_account(&self, account: &Account) -> Result<(), StorageError> {
            self.0.put_account(account).await
        }

        async fn get_certificate(&self, domain: &str) -> Result<Option<Certificate>, StorageError> {
            self.0.get_certificate(domain).await
        }

        async fn list_certificates(&self) -> Result<Vec<Certificate>, StorageError> {
            Err(StorageError::InvalidStructure("certificates/ unreadable".to_string()))
        }

        async fn put_certificate(&self, certificate: &Certificate) -> Result<(), StorageError> {
            self.0.put_certificate(certificate).await
        }

        async fn get_challenge(&self, key: &str) -> Result<Option<Challenge>, StorageError> {
            self.0.get_challenge(key).await
        }

        async fn put_challenge(&self, challenge: &Challenge) -> Result<(), StorageError> {
            self.0.put_challenge(challenge).await
        }

        async fn delete_challenge(&self, key: &str) -> Result<(), StorageError> {
            self.0.delete_challenge(key).await
        }
    }

    fn harness() -> Harness {
        let store = MemoryStore::new();
        let endpoint = Arc::new(FakeEndpoint::new());
        let external = Arc::new(RecordingExternalSystem::new());
        let telemetry = Telemetry::new().unwrap();

        let authz = Arc::new(AuthorizationEngine::new(
            Arc::new(store.clone()),
            endpoint.clone(),
            &telemetry,
        ));
        let issuer = Arc::new(IssuanceOrchestrator::new(
            Arc::new(store.clone()),
            endpoint.clone(),
            authz,
            &telemetry,
        ));
        let reconciler = Arc::new(Reconciler::new(external.clone(), &telemetry));
        let scheduler =
            RenewalScheduler::new(Arc::new(store.clone()), issuer, Some(reconciler), &telemetry);

        Harness {
            store,
            endpoint,
            external,
            telemetry,
            scheduler,
        }
    }

    #[tokio::test]
    async fn test_threshold_selects_expiring_certificates() {
        let h = harness();
        let expiring = certificate_record("example.com", &["www.example.com"], 3);
        h.store.put_certificate(&expiring).await.unwrap();

        let outcome = h.scheduler.scan_and_renew(DAY).await.unwrap();
        assert!(outcome.renewed.is_empty());
        assert!(h.endpoint.issued().is_empty());

        let outcome = h.scheduler.scan_and_renew(7 * DAY).await.unwrap();
        assert_eq!(outcome.renewed.len(), 1);
        assert_eq!(
            h.endpoint.issued(),
            vec![("example.com".to_string(), vec!["www.example.com".to_string()])]
        );

        let stored = h.store.get_certificate("example.com").await.unwrap().unwrap();
        assert_ne!(stored.thumbprint, expiring.thumbprint);
        assert!(stored.expires > expiring.expires);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_tick() {
        let h = harness();
        h.endpoint.fail_issuance("example.com");
        h.store
            .put_certificate(&certificate_record("example.com", &[], 2))
            .await
            .unwrap();
        h.store
            .put_certificate(&certificate_record("example.org", &[], 2))
            .await
            .unwrap();

        let outcome = h.scheduler.scan_and_renew(7 * DAY).await.unwrap();

        assert_eq!(outcome.renewed.len(), 1);
        assert_eq!(outcome.renewed[0].domain, "example.org");
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].domain, "example.com");
    }

    #[tokio::test]
    async fn test_tick_reconciles_renewed_certificates() {
        let h = harness();
        h.store
            .put_certificate(&certificate_record("example.com", &["www.example.com"], 1))
            .await
            .unwrap();
        h.store
            .put_certificate(&certificate_record("example.net", &[], 60))
            .await
            .unwrap();

        let outcome = h.scheduler.tick().await.unwrap();

        assert_eq!(outcome.renewed.len(), 1);
        assert_eq!(h.external.puts(), vec!["example.com", "www.example.com"]);
    }

    #[tokio::test]
    async fn test_idle_tick_does_not_reconcile() {
        let h = harness();
        h.store
            .put_certificate(&certificate_record("example.com", &[], 60))
            .await
            .unwrap();

        let outcome = h.scheduler.tick().await.unwrap();

        assert!(outcome.renewed.is_empty());
        assert!(h.external.puts().is_empty());
        assert_eq!(outcome.tick_label(), "idle");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_until_cancelled() {
        let h = harness();
        let scheduler = Arc::new(h.scheduler.with_interval(Duration::from_secs(60)));
        let shutdown = CancellationToken::new();

        let task = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            let shutdown = shutdown.clone();
            async move { scheduler.run(shutdown).await }
        });

        // First tick runs immediately, then one per interval
        tokio::time::sleep(Duration::from_secs(150)).await;
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(h.telemetry.metrics().renewal_ticks("idle"), 3);
    }

    #[tokio::test]
    async fn test_tick_survives_sync_failure() {
        let h = harness();
        h.external.fail_puts_for("example.com");
        let expiring = certificate_record("example.com", &["www.example.com"], 1);
        h.store.put_certificate(&expiring).await.unwrap();

        let outcome = h.scheduler.tick().await.unwrap();

        assert_eq!(outcome.renewed.len(), 1);
        assert_eq!(outcome.tick_label(), "renewed");
        assert!(h.external.puts().is_empty());
        let stored = h.store.get_certificate("example.com").await.unwrap().unwrap();
        assert_ne!(stored.thumbprint, expiring.thumbprint);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_records_failed_ticks_and_keeps_going() {
        let h = harness();
        let telemetry = Telemetry::new().unwrap();
        let store = MemoryStore::new();
        let authz = Arc::new(AuthorizationEngine::new(
            Arc::new(store.clone()),
            h.endpoint.clone(),
            &telemetry,
        ));
        let issuer = Arc::new(IssuanceOrchestrator::new(
            Arc::new(store.clone()),
            h.endpoint.clone(),
            authz,
            &telemetry,
        ));
        let scheduler = Arc::new(
            RenewalScheduler::new(Arc::new(UnlistableStore(store)), issuer, None, &telemetry)
                .with_interval(Duration::from_secs(60)),
        );
        let shutdown = CancellationToken::new();

        let task = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            let shutdown = shutdown.clone();
            async move { scheduler.run(shutdown).await }
        });

        tokio::time::sleep(Duration::from_secs(150)).await;
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(telemetry.metrics().renewal_ticks("error"), 3);
        assert_eq!(telemetry.metrics().renewal_ticks("idle"), 0);
    }
}
