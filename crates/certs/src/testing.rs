//! Test doubles for the capability traits.

use std::collections::{BTreeMap, HashMap, HashSet};
use parking_lot::Mutex;

use async_trait::async_trait;
use chrono::{Datelike, Utc};

use crate::certinfo;
use crate::error::{ProtocolError, SecretError, SyncError};
use crate::model::Certificate;
use crate::protocol::{
    AccountSession, AcmeEndpoint, AuthChallenge, IssuedCertificate, RegisteredAccount,
};
use crate::reconcile::{ExternalSystem, Host};
use crate::secret::SecretBox;

/// Mint a self-signed chain covering `names`, expiring in about `days` days
pub(crate) fn mint(names: &[String], days: i64) -> (String, String) {
    let key = rcgen::KeyPair::generate().unwrap();
    let mut params = rcgen::CertificateParams::new(names.to_vec()).unwrap();
    let expires = Utc::now() + chrono::Duration::days(days);
    params.not_after = rcgen::date_time_ymd(expires.year(), expires.month() as u8, expires.day() as u8);
    let cert = params.self_signed(&key).unwrap();
    (cert.pem(), key.serialize_pem())
}

/// A stored certificate record backed by a real self-signed leaf
pub(crate) fn certificate_record(domain: &str, sans: &[&str], days: i64) -> Certificate {
    let alternative_names: Vec<String> = sans.iter().map(|s| s.to_string()).collect();
    let names: Vec<String> = std::iter::once(domain.to_string())
        .chain(alternative_names.iter().cloned())
        .collect();
    let (chain, key) = mint(&names, days);
    let leaf = certinfo::parse_leaf(&chain).unwrap();

    Certificate {
        domain: domain.to_string(),
        alternative_names,
        expires: leaf.not_after,
        thumbprint: leaf.thumbprint(),
        certificate_chain: chain,
        private_key: key,
    }
}

#[derive(Default)]
struct FakeState {
    registrations: usize,
    bound: Option<String>,
    authorized: HashSet<String>,
    begun: usize,
    challenges: HashMap<String, String>,
    failures_left: HashMap<String, u32>,
    attempts: HashMap<String, u32>,
    failing_authorizations: HashSet<String>,
    rejected_challenges: HashSet<String>,
    failing_issuance: HashSet<String>,
    issued: Vec<(String, Vec<String>)>,
}

/// Scriptable in-process CA
#[derive(Default)]
pub(crate) struct FakeEndpoint {
    state: Mutex<FakeState>,
}

impl FakeEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat `domain` as already authorized
    pub fn pre_authorize(&self, domain: &str) {
        self.state.lock().authorized.insert(domain.to_string());
    }

    /// Fail the next `times` completion attempts for `domain` as still pending
    pub fn fail_completions(&self, domain: &str, times: u32) {
        self.state
            .lock()
            .failures_left
            .insert(domain.to_string(), times);
    }

    /// Refuse to issue a challenge for `domain`
    pub fn fail_authorization(&self, domain: &str) {
        self.state
            .lock()
            .failing_authorizations
            .insert(domain.to_string());
    }

    /// Reject every challenge for `domain` as invalid
    pub fn reject_challenges(&self, domain: &str) {
        self.state
            .lock()
            .rejected_challenges
            .insert(domain.to_string());
    }

    /// Refuse to issue certificates whose primary name is `domain`
    pub fn fail_issuance(&self, domain: &str) {
        self.state
            .lock()
            .failing_issuance
            .insert(domain.to_string());
    }

    pub fn completion_attempts(&self, domain: &str) -> u32 {
        self.state
            .lock()
            .attempts
            .get(domain)
            .copied()
            .unwrap_or(0)
    }

    pub fn registrations(&self) -> usize {
        self.state.lock().registrations
    }

    pub fn bound_account(&self) -> Option<String> {
        self.state.lock().bound.clone()
    }

    /// Challenges handed out and not yet abandoned
    pub fn open_challenges(&self) -> usize {
        self.state.lock().challenges.len()
    }

    /// Number of challenges handed out
    pub fn begun(&self) -> usize {
        self.state.lock().begun
    }

    /// `(domain, sans)` of every certificate issued, in order
    pub fn issued(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().issued.clone()
    }
}

#[async_trait]
impl AcmeEndpoint for FakeEndpoint {
    async fn register_account(
        &self,
        email: &str,
        accept_terms: bool,
    ) -> Result<RegisteredAccount, ProtocolError> {
        if !accept_terms {
            return Err(ProtocolError::AccountRegistration(
                "terms of service must be accepted".to_string(),
            ));
        }
        let mut state = self.state.lock();
        state.registrations += 1;
        let uri = format!("https://acme.test/acct/{}", state.registrations);
        state.bound = Some(uri.clone());
        Ok(RegisteredAccount {
            uri,
            key: format!("credentials:{}", email).into_bytes(),
        })
    }

    async fn use_account(&self, session: &AccountSession) -> Result<(), ProtocolError> {
        self.state.lock().bound = Some(session.uri.clone());
        Ok(())
    }

    async fn begin_authorize(&self, domain: &str) -> Result<Option<AuthChallenge>, ProtocolError> {
        let mut state = self.state.lock();
        if state.failing_authorizations.contains(domain) {
            return Err(ProtocolError::Authorization {
                domain: domain.to_string(),
                message: "rejected".to_string(),
            });
        }
        if state.authorized.contains(domain) {
            return Ok(None);
        }

        state.begun += 1;
        let token = format!("tok{}", state.begun);
        let uri = format!("https://acme.test/chall/{}", state.begun);
        state.challenges.insert(uri.clone(), domain.to_string());

        Ok(Some(AuthChallenge {
            domain: domain.to_string(),
            uri,
            path: format!("/.well-known/acme-challenge/{}", token),
            response: format!("{}.thumbprint", token),
        }))
    }

    async fn complete_authorize(&self, challenge: &AuthChallenge) -> Result<(), ProtocolError> {
        self.complete_authorize_by_uri(&challenge.uri).await
    }

    async fn complete_authorize_by_uri(&self, uri: &str) -> Result<(), ProtocolError> {
        let mut state = self.state.lock();
        let domain = state
            .challenges
            .get(uri)
            .cloned()
            .ok_or_else(|| ProtocolError::ChallengeNotFound(uri.to_string()))?;

        *state.attempts.entry(domain.clone()).or_default() += 1;

        if state.rejected_challenges.contains(&domain) {
            state.challenges.remove(uri);
            return Err(ProtocolError::ChallengeInvalid {
                domain,
                message: "authorization is Invalid".to_string(),
            });
        }

        if let Some(left) = state.failures_left.get_mut(&domain) {
            if *left > 0 {
                *left -= 1;
                return Err(ProtocolError::ChallengePending { domain });
            }
        }

        state.authorized.insert(domain);
        Ok(())
    }

    async fn abandon_authorize(&self, uri: &str) {
        self.state.lock().challenges.remove(uri);
    }

    async fn create_certificate(
        &self,
        domain: &str,
        sans: &[String],
    ) -> Result<IssuedCertificate, ProtocolError> {
        {
            let mut state = self.state.lock();
            if state.failing_issuance.contains(domain) {
                return Err(ProtocolError::Issuance(format!("refused {}", domain)));
            }
            if !state.authorized.contains(domain) {
                return Err(ProtocolError::Issuance(format!("{} is not authorized", domain)));
            }
            state.issued.push((domain.to_string(), sans.to_vec()));
        }

        let names: Vec<String> = std::iter::once(domain.to_string())
            .chain(sans.iter().cloned())
            .collect();
        let (chain_pem, key_pem) = mint(&names, 90);
        let leaf = certinfo::parse_leaf(&chain_pem).unwrap();

        Ok(IssuedCertificate {
            chain_pem,
            key_pem,
            leaf,
        })
    }
}

/// External system that records every upsert
#[derive(Default)]
pub(crate) struct RecordingExternalSystem {
    hosts: Mutex<BTreeMap<String, Host>>,
    puts: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingExternalSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, host: Host) {
        self.hosts.lock().insert(host.domain.clone(), host);
    }

    pub fn host(&self, domain: &str) -> Option<Host> {
        self.hosts.lock().get(domain).cloned()
    }

    /// Domains upserted, in call order
    pub fn puts(&self) -> Vec<String> {
        self.puts.lock().clone()
    }

    pub fn fail_puts_for(&self, domain: &str) {
        self.failing.lock().insert(domain.to_string());
    }
}

#[async_trait]
impl ExternalSystem for RecordingExternalSystem {
    async fn get_hosts(&self) -> Result<Vec<Host>, SyncError> {
        Ok(self.hosts.lock().values().cloned().collect())
    }

    async fn get_host(&self, domain: &str) -> Result<Option<Host>, SyncError> {
        Ok(self.host(domain))
    }

    async fn put_host(&self, host: &Host) -> Result<(), SyncError> {
        if self.failing.lock().contains(&host.domain) {
            return Err(SyncError::Status {
                status: 500,
                url: format!("fake://hosts/{}", host.domain),
                body: "unavailable".to_string(),
            });
        }
        self.puts.lock().push(host.domain.clone());
        self.insert(host.clone());
        Ok(())
    }
}

/// Reversible, unauthenticated "sealing" for tests
pub(crate) struct PlainSecretBox;

const SEALED_PREFIX: &[u8] = b"sealed:";

impl SecretBox for PlainSecretBox {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SecretError> {
        Ok([SEALED_PREFIX, plaintext].concat())
    }

    fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>, SecretError> {
        ciphertext
            .strip_prefix(SEALED_PREFIX)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| SecretError::Open("not sealed".to_string()))
    }
}
