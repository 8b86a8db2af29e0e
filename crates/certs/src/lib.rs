//! Sentinel Certs Library
//!
//! ACME certificate lifecycle orchestration for hostnames served by an
//! external traffic-routing system.
//!
//! - **Account**: restore or register the ACME account, key sealed at rest
//! - **Authorization**: HTTP-01 challenges with bounded retry
//! - **Issuance**: one certificate per registrable domain, SANs merged with
//!   what is already stored
//! - **Renewal**: periodic scan of stored certificates close to expiry
//! - **Reconciliation**: thumbprint-gated push of certificates to the edge
//!
//! # Example
//!
//! ```ignore
//! use sentinel_certs::App;
//! use sentinel_certs_config::Config;
//!
//! let config = Config::from_file("certs.kdl")?;
//! let app = App::build(config, None).await?;
//! app.bootstrap().await?;
//! app.add_certificates(&["www.example.com".to_string()]).await?;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod account;
pub mod app;
pub mod authz;
pub mod certinfo;
pub mod challenge;
pub mod error;
pub mod issuance;
pub mod model;
pub mod protocol;
pub mod reconcile;
pub mod scheduler;
pub mod secret;
pub mod store;

#[cfg(test)]
mod testing;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Errors
pub use error::{
    AcmeError, AcmeResult, ProtocolError, SecretError, StorageError, SyncError, ValidationError,
};

// Records and storage
pub use model::{Account, Certificate, Challenge};
pub use store::{FileStore, MemoryStore, Store};

// ACME protocol
pub use protocol::{
    AccountSession, AcmeEndpoint, AuthChallenge, InstantAcmeEndpoint, IssuedCertificate,
    RegisteredAccount,
};

// Lifecycle components
pub use account::AccountBootstrapper;
pub use authz::{AuthorizationEngine, AuthorizationState, DomainGroup};
pub use issuance::IssuanceOrchestrator;
pub use scheduler::{RenewalFailure, RenewalOutcome, RenewalScheduler};

// External systems
pub use challenge::{ChallengeResponder, ChallengeServer};
pub use reconcile::{ExternalSystem, Host, ReconcileReport, Reconciler, VulcandClient};
pub use secret::{AesGcmBox, SecretBox};

// Application wiring
pub use app::App;
