//! Validation protocol capability
//!
//! The orchestrator never speaks ACME on the wire. It drives an
//! [`AcmeEndpoint`], which the production binary backs with
//! [`InstantAcmeEndpoint`].

use std::fmt;

use async_trait::async_trait;

use crate::certinfo::LeafCertificate;
use crate::error::ProtocolError;

mod instant;

pub use instant::InstantAcmeEndpoint;

/// Account freshly registered with the endpoint
#[derive(Clone)]
pub struct RegisteredAccount {
    /// Account URI
    pub uri: String,
    /// Plaintext signing credential; seal before persisting
    pub key: Vec<u8>,
}

impl fmt::Debug for RegisteredAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredAccount")
            .field("uri", &self.uri)
            .finish_non_exhaustive()
    }
}

/// Restored account to bind to the protocol session
#[derive(Clone)]
pub struct AccountSession {
    pub email: String,
    pub uri: String,
    /// Plaintext signing credential
    pub key: Vec<u8>,
}

impl fmt::Debug for AccountSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountSession")
            .field("email", &self.email)
            .field("uri", &self.uri)
            .finish_non_exhaustive()
    }
}

/// HTTP-01 challenge issued for one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    /// Domain being authorized
    pub domain: String,
    /// Challenge URI, used to signal readiness
    pub uri: String,
    /// Request path the CA will fetch, ending in the token
    pub path: String,
    /// Body the CA expects at `path`
    pub response: String,
}

impl AuthChallenge {
    /// Last path segment of `path`
    pub fn token(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or_default()
    }
}

/// Certificate returned by the endpoint
#[derive(Clone)]
pub struct IssuedCertificate {
    /// PEM chain, leaf first
    pub chain_pem: String,
    /// PEM private key matching the leaf
    pub key_pem: String,
    pub leaf: LeafCertificate,
}

impl fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("leaf", &self.leaf)
            .finish_non_exhaustive()
    }
}

/// Client side of the domain-validation protocol
#[async_trait]
pub trait AcmeEndpoint: Send + Sync {
    /// Register a new account. Fails when terms must be accepted and were not.
    async fn register_account(
        &self,
        email: &str,
        accept_terms: bool,
    ) -> Result<RegisteredAccount, ProtocolError>;

    /// Bind a previously registered account to this session
    async fn use_account(&self, session: &AccountSession) -> Result<(), ProtocolError>;

    /// Request a challenge for `domain`; `None` when already authorized
    async fn begin_authorize(&self, domain: &str) -> Result<Option<AuthChallenge>, ProtocolError>;

    /// Tell the CA the challenge can be validated and report the outcome
    async fn complete_authorize(&self, challenge: &AuthChallenge) -> Result<(), ProtocolError>;

    /// Complete a challenge identified only by its URI
    async fn complete_authorize_by_uri(&self, uri: &str) -> Result<(), ProtocolError>;

    /// Forget any state kept for a challenge that will not be completed
    async fn abandon_authorize(&self, _uri: &str) {}

    /// Obtain a certificate for `domain` with `sans` as alternative names
    async fn create_certificate(
        &self,
        domain: &str,
        sans: &[String],
    ) -> Result<IssuedCertificate, ProtocolError>;
}
