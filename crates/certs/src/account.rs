//! Account bootstrap: restore the stored ACME account or register one.

use std::sync::Arc;

use sentinel_certs_common::Telemetry;
use tracing::{info, instrument};

use crate::error::AcmeResult;
use crate::model::Account;
use crate::protocol::{AccountSession, AcmeEndpoint};
use crate::secret::SecretBox;
use crate::store::Store;

pub struct AccountBootstrapper {
    store: Arc<dyn Store>,
    endpoint: Arc<dyn AcmeEndpoint>,
    secrets: Arc<dyn SecretBox>,
    telemetry: Telemetry,
}

impl AccountBootstrapper {
    pub fn new(
        store: Arc<dyn Store>,
        endpoint: Arc<dyn AcmeEndpoint>,
        secrets: Arc<dyn SecretBox>,
        telemetry: &Telemetry,
    ) -> Self {
        Self {
            store,
            endpoint,
            secrets,
            telemetry: telemetry.component("account"),
        }
    }

    /// Bind the account for `email` to the protocol session
    ///
    /// A stored account has its key unsealed and is reused; otherwise a new
    /// account is registered and persisted with its key sealed. Failures are
    /// not retried.
    #[instrument(skip(self), parent = self.telemetry.span())]
    pub async fn initialize(&self, email: &str, accept_terms: bool) -> AcmeResult<Account> {
        if let Some(account) = self.store.get_account(email).await? {
            let key = self.secrets.open(&account.key)?;
            self.endpoint
                .use_account(&AccountSession {
                    email: account.email.clone(),
                    uri: account.uri.clone(),
                    key,
                })
                .await?;

            info!(email = %account.email, uri = %account.uri, "Loaded existing ACME account");
            return Ok(account);
        }

        info!(email = %email, accept_terms, "Creating new ACME account");

        let registered = self.endpoint.register_account(email, accept_terms).await?;
        let account = Account {
            email: email.to_string(),
            uri: registered.uri,
            key: self.secrets.seal(&registered.key)?,
        };
        self.store.put_account(&account).await?;

        info!(email = %account.email, uri = %account.uri, "ACME account created");
        Ok(account)
    }
}

impl std::fmt::Debug for AccountBootstrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountBootstrapper").finish_non_exhaustive()
    }
}
