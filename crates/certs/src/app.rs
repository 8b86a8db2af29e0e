//! Application wiring: builds every component from configuration.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sentinel_certs_common::Telemetry;
use sentinel_certs_config::Config;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::account::AccountBootstrapper;
use crate::authz::AuthorizationEngine;
use crate::challenge::{ChallengeResponder, ChallengeServer};
use crate::error::{AcmeResult, SecretError};
use crate::issuance::IssuanceOrchestrator;
use crate::model::{Account, Certificate};
use crate::protocol::{AcmeEndpoint, InstantAcmeEndpoint};
use crate::reconcile::{ExternalSystem, ReconcileReport, Reconciler, VulcandClient};
use crate::scheduler::{RenewalOutcome, RenewalScheduler};
use crate::secret::{AesGcmBox, SecretBox};
use crate::store::{FileStore, Store};

/// One orchestrator instance and everything it owns
pub struct App {
    config: Config,
    telemetry: Telemetry,
    store: Arc<dyn Store>,
    endpoint: Arc<dyn AcmeEndpoint>,
    secrets: Option<Arc<dyn SecretBox>>,
    issuer: Arc<IssuanceOrchestrator>,
    reconciler: Option<Arc<Reconciler>>,
}

impl App {
    /// Build the production component graph
    ///
    /// The seal key is `seal_key` when given, otherwise the environment
    /// variable named by the account configuration. Commands that never touch
    /// the account work without one.
    pub async fn build(config: Config, seal_key: Option<&str>) -> Result<Self> {
        let telemetry = Telemetry::new().context("Failed to initialize metrics")?;

        let store = FileStore::open(&config.store.path)
            .await
            .with_context(|| format!("Failed to open store at {}", config.store.path.display()))?;

        let endpoint = InstantAcmeEndpoint::new(config.account.directory.clone());

        let seal_key = seal_key
            .map(str::to_string)
            .or_else(|| std::env::var(&config.account.seal_key_env).ok());
        let secrets = match seal_key {
            Some(key) => Some(Arc::new(
                AesGcmBox::from_key_string(key.trim()).context("Invalid seal key")?,
            ) as Arc<dyn SecretBox>),
            None => None,
        };

        let external = match config.sync.vulcand.as_deref() {
            Some(address) => Some(Arc::new(
                VulcandClient::new(address).context("Failed to create vulcand client")?,
            ) as Arc<dyn ExternalSystem>),
            None => None,
        };

        info!(
            directory = %config.account.directory,
            staging = config.is_staging(),
            store = %config.store.path.display(),
            sync = external.is_some(),
            "Components initialized"
        );

        Ok(Self::with_components(
            config,
            Arc::new(store),
            Arc::new(endpoint),
            secrets,
            external,
            telemetry,
        ))
    }

    /// Wire the lifecycle components around the given adapters
    pub fn with_components(
        config: Config,
        store: Arc<dyn Store>,
        endpoint: Arc<dyn AcmeEndpoint>,
        secrets: Option<Arc<dyn SecretBox>>,
        external: Option<Arc<dyn ExternalSystem>>,
        telemetry: Telemetry,
    ) -> Self {
        let authz = Arc::new(AuthorizationEngine::new(
            Arc::clone(&store),
            Arc::clone(&endpoint),
            &telemetry,
        ));
        let issuer = Arc::new(IssuanceOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&endpoint),
            authz,
            &telemetry,
        ));
        let reconciler = external.map(|external| Arc::new(Reconciler::new(external, &telemetry)));

        Self {
            config,
            telemetry,
            store,
            endpoint,
            secrets,
            issuer,
            reconciler,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn authorization(&self) -> &AuthorizationEngine {
        self.issuer.authorization()
    }

    /// Bind the configured account to the ACME session
    pub async fn bootstrap(&self) -> AcmeResult<Account> {
        let secrets = self.secrets.clone().ok_or_else(|| {
            SecretError::InvalidKey(format!(
                "no seal key configured; set {} or pass --seal-key",
                self.config.account.seal_key_env
            ))
        })?;

        AccountBootstrapper::new(
            Arc::clone(&self.store),
            Arc::clone(&self.endpoint),
            secrets,
            &self.telemetry,
        )
        .initialize(&self.config.account.email, self.config.account.accept_tos)
        .await
    }

    /// Issue certificates for `domains` and push them to the external system
    pub async fn add_certificates(&self, domains: &[String]) -> AcmeResult<Vec<Certificate>> {
        let issued = self.issuer.issue_or_renew(domains).await?;
        if let Some(reconciler) = &self.reconciler {
            reconciler.reconcile(&issued).await?;
        }
        Ok(issued)
    }

    /// One renewal pass with an explicit threshold
    pub async fn renew(&self, threshold: Duration) -> AcmeResult<RenewalOutcome> {
        self.scheduler().with_threshold(threshold).tick().await
    }

    /// Reconcile every stored certificate
    ///
    /// `None` when no external system is configured.
    pub async fn sync_all(&self) -> AcmeResult<Option<ReconcileReport>> {
        let Some(reconciler) = &self.reconciler else {
            warn!("No external system configured, nothing to sync");
            return Ok(None);
        };

        let certs = self.store.list_certificates().await?;
        reconciler.reconcile(&certs).await.map(Some)
    }

    /// Renewal scheduler using the configured interval and threshold
    pub fn scheduler(&self) -> RenewalScheduler {
        RenewalScheduler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.issuer),
            self.reconciler.clone(),
            &self.telemetry,
        )
        .with_interval(self.config.renewal.check_interval())
        .with_threshold(self.config.renewal.renew_before())
    }

    /// Challenge responder for the configured path prefix
    pub fn responder(&self, serve_metrics: bool) -> Result<ChallengeResponder> {
        let responder = ChallengeResponder::new(
            Arc::clone(&self.store),
            &self.config.challenges.path_prefix,
            &self.telemetry,
        )
        .context("Invalid challenge path prefix")?;
        Ok(responder.with_metrics(serve_metrics))
    }

    /// Serve challenge responses on `addr` until `shutdown` fires
    pub async fn listen(&self, addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
        let server = ChallengeServer::new(Arc::new(self.responder(true)?));
        server
            .serve(addr, shutdown)
            .await
            .with_context(|| format!("Challenge server on {} failed", addr))
    }

    /// Run the renewal loop, plus the challenge server when `listen` is set
    ///
    /// If the challenge server fails the whole daemon shuts down.
    pub async fn watch(&self, listen: Option<SocketAddr>, shutdown: CancellationToken) -> Result<()> {
        let scheduler = self.scheduler();

        let Some(addr) = listen else {
            scheduler.run(shutdown).await;
            return Ok(());
        };

        let serving = async {
            let result = self.listen(addr, shutdown.clone()).await;
            if result.is_err() {
                shutdown.cancel();
            }
            result
        };

        let ((), served) = tokio::join!(scheduler.run(shutdown.clone()), serving);
        served
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("email", &self.config.account.email)
            .field("directory", &self.config.account.directory)
            .field("has_seal_key", &self.secrets.is_some())
            .field("has_reconciler", &self.reconciler.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{FakeEndpoint, PlainSecretBox, RecordingExternalSystem};
    use sentinel_certs_config::AccountConfig;

    fn config() -> Config {
        Config {
            account: AccountConfig {
                email: "admin@example.com".to_string(),
                accept_tos: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn app(
        endpoint: Arc<FakeEndpoint>,
        secrets: Option<Arc<dyn SecretBox>>,
        external: Option<Arc<RecordingExternalSystem>>,
    ) -> App {
        App::with_components(
            config(),
            Arc::new(MemoryStore::new()),
            endpoint,
            secrets,
            external.map(|e| e as Arc<dyn ExternalSystem>),
            Telemetry::new().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_bootstrap_requires_seal_key() {
        let app = app(Arc::new(FakeEndpoint::new()), None, None);
        let err = app.bootstrap().await.unwrap_err();
        assert!(err.to_string().contains("SENTINEL_CERTS_SEAL_KEY"));
    }

    #[tokio::test]
    async fn test_add_certificates_pushes_every_name() {
        let endpoint = Arc::new(FakeEndpoint::new());
        let external = Arc::new(RecordingExternalSystem::new());
        let app = app(
            Arc::clone(&endpoint),
            Some(Arc::new(PlainSecretBox)),
            Some(Arc::clone(&external)),
        );

        app.bootstrap().await.unwrap();
        let issued = app
            .add_certificates(&["www.example.com".to_string(), "example.com".to_string()])
            .await
            .unwrap();

        assert_eq!(issued.len(), 1);
        assert_eq!(external.puts(), vec!["example.com", "www.example.com"]);

        let report = app.sync_all().await.unwrap().unwrap();
        assert_eq!(report.pushed, 0);
        assert_eq!(report.skipped, 2);
    }

    #[tokio::test]
    async fn test_sync_without_external_system() {
        let app = app(Arc::new(FakeEndpoint::new()), None, None);
        assert!(app.sync_all().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scheduler_uses_configured_interval() {
        let app = app(Arc::new(FakeEndpoint::new()), None, None);
        assert_eq!(app.scheduler().check_interval(), Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_responder_serves_stored_challenge() {
        let app = app(Arc::new(FakeEndpoint::new()), None, None);
        app.store()
            .put_challenge(&crate::model::Challenge::new("tok123", "resp-value"))
            .await
            .unwrap();

        let responder = app.responder(false).unwrap();
        let response = responder
            .respond(&http::Method::GET, "/.well-known/acme-challenge/tok123")
            .await;
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(response.body().as_ref(), b"resp-value");
    }
}
