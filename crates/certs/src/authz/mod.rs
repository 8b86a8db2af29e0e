//! Domain authorization
//!
//! Each domain moves through an explicit state machine:
//!
//! ```text
//! Unauthorized --begin--> ChallengePending --complete--> Authorized
//!      ^                        |
//!      +---- retries spent -----+
//! ```
//!
//! `begin` persists the challenge response so the challenge server can
//! answer the CA. `complete` signals readiness and is retried with linear
//! backoff, since the CA validates asynchronously.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sentinel_certs_common::{RetryPolicy, Telemetry};
use tracing::{debug, info, instrument, warn};

use crate::error::{AcmeResult, ProtocolError};
use crate::model::Challenge;
use crate::protocol::{AcmeEndpoint, AuthChallenge};
use crate::store::Store;

mod grouping;

pub use grouping::{group_domains, merge_sans, normalize, registrable_domain, DomainGroup};

/// Attempts made by [`AuthorizationEngine::complete_authorize`]
pub const AUTH_RETRIES: u32 = 5;
/// Backoff step between completion attempts
pub const AUTH_BACKOFF: Duration = Duration::from_millis(300);

/// Authorization progress of one domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthorizationState {
    #[default]
    Unauthorized,
    ChallengePending,
    Authorized,
}

impl fmt::Display for AuthorizationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthorizationState::Unauthorized => "unauthorized",
            AuthorizationState::ChallengePending => "challenge-pending",
            AuthorizationState::Authorized => "authorized",
        };
        f.write_str(s)
    }
}

/// Proves control of individual domains
pub struct AuthorizationEngine {
    store: Arc<dyn Store>,
    endpoint: Arc<dyn AcmeEndpoint>,
    retry: RetryPolicy,
    telemetry: Telemetry,
    states: DashMap<String, AuthorizationState>,
    /// Challenge URI -> domain, for completion by URI
    pending_uris: DashMap<String, String>,
}

impl AuthorizationEngine {
    pub fn new(store: Arc<dyn Store>, endpoint: Arc<dyn AcmeEndpoint>, telemetry: &Telemetry) -> Self {
        Self {
            store,
            endpoint,
            retry: RetryPolicy::linear(AUTH_RETRIES, AUTH_BACKOFF),
            telemetry: telemetry.component("authorization"),
            states: DashMap::new(),
            pending_uris: DashMap::new(),
        }
    }

    /// Replace the completion retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Current state of `domain`
    pub fn state(&self, domain: &str) -> AuthorizationState {
        let key = normalize(domain).unwrap_or_else(|_| domain.to_string());
        self.states.get(&key).map(|s| *s).unwrap_or_default()
    }

    fn transition(&self, domain: &str, next: AuthorizationState) {
        let previous = self.states.insert(domain.to_string(), next).unwrap_or_default();
        if previous != next {
            debug!(domain = %domain, from = %previous, to = %next, "Authorization state changed");
        }
    }

    /// Request a challenge for `domain`
    ///
    /// `None` means the CA already considers the domain authorized.
    #[instrument(skip(self), parent = self.telemetry.span())]
    pub async fn begin_authorize(&self, domain: &str) -> AcmeResult<Option<AuthChallenge>> {
        let domain = normalize(domain)?;
        info!(domain = %domain, "Begin authorization of domain");

        let Some(challenge) = self.endpoint.begin_authorize(&domain).await? else {
            debug!(domain = %domain, "No authorization required");
            self.transition(&domain, AuthorizationState::Authorized);
            return Ok(None);
        };

        debug!(
            domain = %domain,
            uri = %challenge.uri,
            path = %challenge.path,
            "Challenge received"
        );

        self.store
            .put_challenge(&Challenge::new(challenge.token(), challenge.response.clone()))
            .await?;

        self.pending_uris
            .insert(challenge.uri.clone(), domain.clone());
        self.transition(&domain, AuthorizationState::ChallengePending);

        Ok(Some(challenge))
    }

    /// Ask the CA to validate `challenge`, retrying with linear backoff
    #[instrument(skip(self, challenge), fields(domain = %challenge.domain), parent = self.telemetry.span())]
    pub async fn complete_authorize(&self, challenge: &AuthChallenge) -> AcmeResult<()> {
        let domain = normalize(&challenge.domain)?;

        let result = self
            .retry
            .run_while(
                "complete_authorize",
                |_attempt| self.endpoint.complete_authorize(challenge),
                ProtocolError::is_retryable,
            )
            .await;

        self.pending_uris.remove(&challenge.uri);
        if result.is_err() {
            self.endpoint.abandon_authorize(&challenge.uri).await;
        }
        self.settle(&domain, result.is_ok());
        result?;

        info!(domain = %domain, "Authorization of domain successful");
        Ok(())
    }

    /// Complete a challenge begun earlier, identified by its URI
    ///
    /// Makes a single attempt.
    #[instrument(skip(self), parent = self.telemetry.span())]
    pub async fn complete_authorize_by_uri(&self, uri: &str) -> AcmeResult<()> {
        let result = self.endpoint.complete_authorize_by_uri(uri).await;
        let domain = self.pending_uris.get(uri).map(|d| d.clone());
        if !matches!(&result, Err(e) if e.is_retryable()) {
            self.pending_uris.remove(uri);
        }

        match &domain {
            Some(domain) => self.settle(domain, result.is_ok()),
            None => self.telemetry.metrics().record_authorization(result.is_ok()),
        }
        result?;

        info!(uri = %uri, domain = ?domain, "Authorization of domain successful");
        Ok(())
    }

    /// Begin and, when a challenge is issued, complete authorization
    pub async fn authorize(&self, domain: &str) -> AcmeResult<()> {
        if let Some(challenge) = self.begin_authorize(domain).await? {
            self.complete_authorize(&challenge).await?;
        }
        Ok(())
    }

    fn settle(&self, domain: &str, success: bool) {
        self.telemetry.metrics().record_authorization(success);
        if success {
            self.transition(domain, AuthorizationState::Authorized);
        } else {
            warn!(domain = %domain, "Authorization failed");
            self.transition(domain, AuthorizationState::Unauthorized);
        }
    }
}

impl fmt::Debug for AuthorizationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationEngine")
            .field("retry", &self.retry)
            .field("tracked_domains", &self.states.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AcmeError, ProtocolError};
    use crate::store::MemoryStore;
    use crate::testing::FakeEndpoint;
    use tokio::time::Instant;

    fn engine(endpoint: Arc<FakeEndpoint>) -> (AuthorizationEngine, MemoryStore, Telemetry) {
        let store = MemoryStore::new();
        let telemetry = Telemetry::new().unwrap();
        let engine = AuthorizationEngine::new(Arc::new(store.clone()), endpoint, &telemetry);
        (engine, store, telemetry)
    }

    #[tokio::test]
    async fn test_begin_persists_challenge() {
        let endpoint = Arc::new(FakeEndpoint::new());
        let (engine, store, _) = engine(endpoint.clone());

        let challenge = engine.begin_authorize("Example.com").await.unwrap().unwrap();

        assert_eq!(challenge.domain, "example.com");
        assert_eq!(
            engine.state("example.com"),
            AuthorizationState::ChallengePending
        );
        let stored = store.get_challenge(challenge.token()).await.unwrap().unwrap();
        assert_eq!(stored.value, challenge.response);
    }

    #[tokio::test]
    async fn test_begin_already_authorized() {
        let endpoint = Arc::new(FakeEndpoint::new());
        endpoint.pre_authorize("example.com");
        let (engine, store, _) = engine(endpoint);

        assert!(engine.begin_authorize("example.com").await.unwrap().is_none());
        assert_eq!(engine.state("example.com"), AuthorizationState::Authorized);
        assert_eq!(store.pending_challenges(), 0);
    }

    #[tokio::test]
    async fn test_authorize_succeeds() {
        let endpoint = Arc::new(FakeEndpoint::new());
        let (engine, _, telemetry) = engine(endpoint.clone());

        engine.authorize("www.example.com").await.unwrap();

        assert_eq!(engine.state("www.example.com"), AuthorizationState::Authorized);
        assert_eq!(endpoint.completion_attempts("www.example.com"), 1);
        assert_eq!(telemetry.metrics().authorizations(true), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_retries_then_succeeds() {
        let endpoint = Arc::new(FakeEndpoint::new());
        endpoint.fail_completions("example.com", 2);
        let (engine, _, _) = engine(endpoint.clone());

        let start = Instant::now();
        engine.authorize("example.com").await.unwrap();

        assert_eq!(endpoint.completion_attempts("example.com"), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(300 + 600));
        assert_eq!(engine.state("example.com"), AuthorizationState::Authorized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_exhausts_five_attempts() {
        let endpoint = Arc::new(FakeEndpoint::new());
        endpoint.fail_completions("example.com", u32::MAX);
        let (engine, _, telemetry) = engine(endpoint.clone());

        let start = Instant::now();
        let err = engine.authorize("example.com").await.unwrap_err();

        assert_eq!(endpoint.completion_attempts("example.com"), 5);
        assert_eq!(
            start.elapsed(),
            Duration::from_millis(300 + 600 + 900 + 1200)
        );
        assert!(matches!(
            err,
            AcmeError::Protocol(ProtocolError::ChallengePending { .. })
        ));
        assert_eq!(engine.state("example.com"), AuthorizationState::Unauthorized);
        assert_eq!(telemetry.metrics().authorizations(false), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_challenge_is_not_retried() {
        let endpoint = Arc::new(FakeEndpoint::new());
        endpoint.reject_challenges("example.com");
        let (engine, _, _) = engine(endpoint.clone());

        let start = Instant::now();
        let err = engine.authorize("example.com").await.unwrap_err();

        assert!(matches!(
            err,
            AcmeError::Protocol(ProtocolError::ChallengeInvalid { .. })
        ));
        assert_eq!(endpoint.completion_attempts("example.com"), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(engine.state("example.com"), AuthorizationState::Unauthorized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_challenge_is_abandoned() {
        let endpoint = Arc::new(FakeEndpoint::new());
        endpoint.fail_completions("example.com", u32::MAX);
        let (engine, _, _) = engine(endpoint.clone());

        let challenge = engine.begin_authorize("example.com").await.unwrap().unwrap();
        assert_eq!(endpoint.open_challenges(), 1);

        assert!(engine.complete_authorize(&challenge).await.is_err());
        assert_eq!(endpoint.open_challenges(), 0);
        assert!(matches!(
            engine.complete_authorize_by_uri(&challenge.uri).await,
            Err(AcmeError::Protocol(ProtocolError::ChallengeNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_complete_by_uri_single_attempt() {
        let endpoint = Arc::new(FakeEndpoint::new());
        let (engine, _, _) = engine(endpoint.clone());

        let challenge = engine.begin_authorize("example.com").await.unwrap().unwrap();
        engine.complete_authorize_by_uri(&challenge.uri).await.unwrap();
        assert_eq!(engine.state("example.com"), AuthorizationState::Authorized);

        endpoint.fail_completions("example.org", u32::MAX);
        let challenge = engine.begin_authorize("example.org").await.unwrap().unwrap();
        assert!(engine.complete_authorize_by_uri(&challenge.uri).await.is_err());
        assert_eq!(endpoint.completion_attempts("example.org"), 1);
        assert_eq!(engine.state("example.org"), AuthorizationState::Unauthorized);
    }

    #[tokio::test]
    async fn test_invalid_domain_rejected_before_endpoint() {
        let endpoint = Arc::new(FakeEndpoint::new());
        let (engine, _, _) = engine(endpoint.clone());

        assert!(matches!(
            engine.authorize("").await,
            Err(AcmeError::InvalidDomain { .. })
        ));
        assert_eq!(endpoint.begun(), 0);
    }
}
