//! [`AcmeEndpoint`] backed by `instant-acme` using HTTP-01 challenges.
//!
//! Each `begin_authorize` opens a single-identifier order and keeps it in
//! memory, keyed by challenge URL, until the authorization settles. A
//! challenge begun by another process cannot be completed here.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use super::{AccountSession, AcmeEndpoint, AuthChallenge, IssuedCertificate, RegisteredAccount};
use crate::certinfo;
use crate::error::ProtocolError;

/// Path the CA fetches for HTTP-01, before the token
const HTTP01_PATH_PREFIX: &str = "/.well-known/acme-challenge";

/// How long a single completion attempt waits for the CA's verdict
const DEFAULT_VALIDATION_TIMEOUT: Duration = Duration::from_secs(30);
/// How long to wait for an order to become ready or valid
const DEFAULT_ORDER_TIMEOUT: Duration = Duration::from_secs(120);
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// The part of an order needed to settle its authorization
#[async_trait]
trait ChallengeOrder: Send {
    /// Tell the CA the challenge at `challenge_url` can be fetched
    async fn mark_ready(&mut self, challenge_url: &str) -> Result<(), String>;

    /// Current status of the order's single authorization
    async fn authorization_status(&mut self) -> Result<AuthorizationStatus, String>;
}

#[async_trait]
impl ChallengeOrder for Order {
    async fn mark_ready(&mut self, challenge_url: &str) -> Result<(), String> {
        self.set_challenge_ready(challenge_url)
            .await
            .map_err(|e| e.to_string())
    }

    async fn authorization_status(&mut self) -> Result<AuthorizationStatus, String> {
        let authorizations = self
            .authorizations()
            .await
            .map_err(|e| format!("Failed to get authorization: {}", e))?;
        Ok(authorizations
            .first()
            .map(|authz| authz.status)
            .unwrap_or(AuthorizationStatus::Pending))
    }
}

struct PendingAuthorization {
    domain: String,
    order: Box<dyn ChallengeOrder>,
    ready_sent: bool,
}

/// ACME endpoint talking to a real CA directory
pub struct InstantAcmeEndpoint {
    directory_url: String,
    account: RwLock<Option<Account>>,
    pending: Mutex<HashMap<String, PendingAuthorization>>,
    validation_timeout: Duration,
    order_timeout: Duration,
}

impl InstantAcmeEndpoint {
    pub fn new(directory_url: impl Into<String>) -> Self {
        Self {
            directory_url: directory_url.into(),
            account: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            validation_timeout: DEFAULT_VALIDATION_TIMEOUT,
            order_timeout: DEFAULT_ORDER_TIMEOUT,
        }
    }

    /// Run one completion attempt; the order is kept for the next attempt
    /// unless the outcome is final
    async fn settle(&self, uri: &str, mut pending: PendingAuthorization) -> Result<(), ProtocolError> {
        let result = self.poll_authorization(uri, &mut pending).await;
        if let Err(e) = &result {
            if e.is_retryable() {
                self.pending.lock().await.insert(uri.to_string(), pending);
            }
        }
        result
    }

    /// Signal readiness once, then poll the authorization until it settles
    async fn poll_authorization(
        &self,
        uri: &str,
        pending: &mut PendingAuthorization,
    ) -> Result<(), ProtocolError> {
        if !pending.ready_sent {
            debug!(domain = %pending.domain, challenge_url = %uri, "Setting challenge ready");
            pending
                .order
                .mark_ready(uri)
                .await
                .map_err(|message| ProtocolError::Authorization {
                    domain: pending.domain.clone(),
                    message,
                })?;
            pending.ready_sent = true;
        }

        let deadline = tokio::time::Instant::now() + self.validation_timeout;
        loop {
            let status = pending.order.authorization_status().await.map_err(|message| {
                ProtocolError::Authorization {
                    domain: pending.domain.clone(),
                    message,
                }
            })?;

            match status {
                AuthorizationStatus::Valid => {
                    info!(domain = %pending.domain, "Authorization valid");
                    return Ok(());
                }
                AuthorizationStatus::Pending => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(ProtocolError::ChallengePending {
                            domain: pending.domain.clone(),
                        });
                    }
                    trace!(domain = %pending.domain, "Authorization still pending, waiting...");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                other => {
                    warn!(domain = %pending.domain, status = ?other, "Authorization failed");
                    return Err(ProtocolError::ChallengeInvalid {
                        domain: pending.domain.clone(),
                        message: format!("authorization is {:?}", other),
                    });
                }
            }
        }
    }

    async fn wait_for_status(
        &self,
        order: &mut Order,
        wanted: OrderStatus,
    ) -> Result<(), ProtocolError> {
        let deadline = tokio::time::Instant::now() + self.order_timeout;

        loop {
            let state = order
                .refresh()
                .await
                .map_err(|e| ProtocolError::Issuance(format!("Failed to refresh order: {}", e)))?;

            if state.status == wanted {
                return Ok(());
            }

            match state.status {
                OrderStatus::Invalid => {
                    return Err(ProtocolError::Issuance("Order became invalid".to_string()));
                }
                OrderStatus::Valid => {
                    // Valid is terminal; only acceptable when it was requested
                    return Err(ProtocolError::Issuance(
                        "Order was finalized unexpectedly".to_string(),
                    ));
                }
                _ => {
                    if tokio::time::Instant::now() > deadline {
                        return Err(ProtocolError::Timeout(format!(
                            "Timed out waiting for order to become {:?}",
                            wanted
                        )));
                    }
                    trace!(status = ?state.status, "Order not ready yet, waiting...");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }
}

#[async_trait]
impl AcmeEndpoint for InstantAcmeEndpoint {
    async fn register_account(
        &self,
        email: &str,
        accept_terms: bool,
    ) -> Result<RegisteredAccount, ProtocolError> {
        info!(
            email = %email,
            directory = %self.directory_url,
            "Registering new ACME account"
        );

        let contact = format!("mailto:{}", email);
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[contact.as_str()],
                terms_of_service_agreed: accept_terms,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await
        .map_err(|e| ProtocolError::AccountRegistration(e.to_string()))?;

        let key = serde_json::to_vec(&credentials).map_err(|e| {
            ProtocolError::AccountRegistration(format!("Failed to serialize credentials: {}", e))
        })?;
        let uri = account.id().to_string();

        *self.account.write().await = Some(account);
        info!(uri = %uri, "ACME account registered");

        Ok(RegisteredAccount { uri, key })
    }

    async fn use_account(&self, session: &AccountSession) -> Result<(), ProtocolError> {
        let credentials: AccountCredentials = serde_json::from_slice(&session.key).map_err(|e| {
            ProtocolError::AccountRegistration(format!("Failed to deserialize credentials: {}", e))
        })?;

        let account = Account::from_credentials(credentials)
            .await
            .map_err(|e| ProtocolError::AccountRegistration(e.to_string()))?;

        if account.id() != session.uri {
            warn!(
                stored = %session.uri,
                restored = %account.id(),
                "Restored account URI differs from stored record"
            );
        }

        *self.account.write().await = Some(account);
        debug!(email = %session.email, "Bound ACME account to session");
        Ok(())
    }

    async fn begin_authorize(&self, domain: &str) -> Result<Option<AuthChallenge>, ProtocolError> {
        let account_guard = self.account.read().await;
        let account = account_guard.as_ref().ok_or(ProtocolError::NoAccount)?;

        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| ProtocolError::Authorization {
                domain: domain.to_string(),
                message: e.to_string(),
            })?;
        drop(account_guard);

        let authorizations =
            order
                .authorizations()
                .await
                .map_err(|e| ProtocolError::Authorization {
                    domain: domain.to_string(),
                    message: format!("Failed to get authorization: {}", e),
                })?;
        let authz = authorizations
            .into_iter()
            .next()
            .ok_or_else(|| ProtocolError::Authorization {
                domain: domain.to_string(),
                message: "order has no authorizations".to_string(),
            })?;

        debug!(domain = %domain, status = ?authz.status, "Processing authorization");

        if authz.status == AuthorizationStatus::Valid {
            debug!(domain = %domain, "Authorization already valid");
            return Ok(None);
        }

        let http01 = authz
            .challenges
            .iter()
            .find(|c| c.r#type == ChallengeType::Http01)
            .ok_or_else(|| ProtocolError::NoHttp01Challenge(domain.to_string()))?;

        let challenge = AuthChallenge {
            domain: domain.to_string(),
            uri: http01.url.clone(),
            path: format!("{}/{}", HTTP01_PATH_PREFIX, http01.token),
            response: order.key_authorization(http01).as_str().to_string(),
        };

        self.pending.lock().await.insert(
            challenge.uri.clone(),
            PendingAuthorization {
                domain: domain.to_string(),
                order: Box::new(order),
                ready_sent: false,
            },
        );

        Ok(Some(challenge))
    }

    async fn complete_authorize(&self, challenge: &AuthChallenge) -> Result<(), ProtocolError> {
        self.complete_authorize_by_uri(&challenge.uri).await
    }

    async fn complete_authorize_by_uri(&self, uri: &str) -> Result<(), ProtocolError> {
        let pending = self
            .pending
            .lock()
            .await
            .remove(uri)
            .ok_or_else(|| ProtocolError::ChallengeNotFound(uri.to_string()))?;

        self.settle(uri, pending).await
    }

    async fn abandon_authorize(&self, uri: &str) {
        if self.pending.lock().await.remove(uri).is_some() {
            debug!(challenge_url = %uri, "Dropped pending order");
        }
    }

    async fn create_certificate(
        &self,
        domain: &str,
        sans: &[String],
    ) -> Result<IssuedCertificate, ProtocolError> {
        let names: Vec<String> = std::iter::once(domain.to_string())
            .chain(sans.iter().cloned())
            .collect();
        let identifiers: Vec<Identifier> = names.iter().cloned().map(Identifier::Dns).collect();

        info!(domains = ?names, "Creating certificate order");

        let account_guard = self.account.read().await;
        let account = account_guard.as_ref().ok_or(ProtocolError::NoAccount)?;
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| ProtocolError::Issuance(e.to_string()))?;
        drop(account_guard);

        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| ProtocolError::Issuance(format!("Failed to get authorization: {}", e)))?;
        if let Some(authz) = authorizations
            .iter()
            .find(|authz| authz.status != AuthorizationStatus::Valid)
        {
            return Err(ProtocolError::Issuance(format!(
                "authorization for {:?} is {:?}, authorize it first",
                authz.identifier, authz.status
            )));
        }

        self.wait_for_status(&mut order, OrderStatus::Ready).await?;

        let cert_key = rcgen::KeyPair::generate()
            .map_err(|e| ProtocolError::Issuance(format!("Failed to generate key: {}", e)))?;
        let params = rcgen::CertificateParams::new(names.clone())
            .map_err(|e| ProtocolError::Issuance(format!("Failed to create CSR params: {}", e)))?;
        let csr = params
            .serialize_request(&cert_key)
            .map_err(|e| ProtocolError::Issuance(format!("Failed to serialize CSR: {}", e)))?
            .der()
            .to_vec();

        order
            .finalize(&csr)
            .await
            .map_err(|e| ProtocolError::Issuance(format!("Failed to finalize order: {}", e)))?;

        self.wait_for_status(&mut order, OrderStatus::Valid).await?;

        let chain_pem = order
            .certificate()
            .await
            .map_err(|e| ProtocolError::Issuance(format!("Failed to get certificate: {}", e)))?
            .ok_or_else(|| ProtocolError::Issuance("No certificate in response".to_string()))?;

        let leaf = certinfo::parse_leaf(&chain_pem)
            .map_err(|e| ProtocolError::Issuance(e.to_string()))?;

        info!(
            domains = ?names,
            expires = %leaf.not_after,
            "Certificate issued successfully"
        );

        Ok(IssuedCertificate {
            chain_pem,
            key_pem: cert_key.serialize_pem(),
            leaf,
        })
    }
}

impl std::fmt::Debug for InstantAcmeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstantAcmeEndpoint")
            .field("directory_url", &self.directory_url)
            .field(
                "has_account",
                &self
                    .account
                    .try_read()
                    .map(|a| a.is_some())
                    .unwrap_or(false),
            )
            .finish()
    }
}
