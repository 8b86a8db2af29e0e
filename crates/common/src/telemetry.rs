//! Injected observability for sentinel-certs components.
//!
//! Every component receives a [`Telemetry`] handle in its constructor instead
//! of reaching for a process-wide logger. The handle carries:
//!
//! - a `tracing` span scoped to the component, nested under the instance span
//! - the instance's Prometheus [`Metrics`], shared between all components
//!
//! The global `tracing` subscriber is still installed once by the binary via
//! [`init_tracing`]; components only ever see their handle.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info_span, Span};

/// Errors raised while setting up telemetry
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Metric registration or collection failed
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Metric text encoding produced invalid output
    #[error("metrics encoding error: {0}")]
    Encoding(String),

    /// The global subscriber could not be installed
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "invalid log format '{}'. Valid formats: pretty, json",
                other
            )),
        }
    }
}

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `level` when set.
pub fn init_tracing(level: &str, format: LogFormat) -> Result<(), TelemetryError> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let result = match format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init(),
    };

    result.map_err(|e| TelemetryError::Subscriber(e.to_string()))
}

// ============================================================================
// Metrics
// ============================================================================

/// Prometheus counters for one orchestrator instance
pub struct Metrics {
    registry: Registry,
    authorizations: IntCounterVec,
    certificates_issued: IntCounter,
    renewal_ticks: IntCounterVec,
    reconcile_pushes: IntCounter,
    reconcile_skips: IntCounter,
    challenges_served: IntCounter,
}

impl Metrics {
    /// Create and register all counters in a fresh registry
    pub fn new() -> Result<Self, TelemetryError> {
        let registry = Registry::new();

        let authorizations = IntCounterVec::new(
            Opts::new(
                "sentinel_certs_authorizations_total",
                "Domain authorizations by result",
            ),
            &["result"],
        )?;
        let certificates_issued = IntCounter::new(
            "sentinel_certs_certificates_issued_total",
            "Certificates issued and persisted",
        )?;
        let renewal_ticks = IntCounterVec::new(
            Opts::new(
                "sentinel_certs_renewal_ticks_total",
                "Renewal scheduler ticks by outcome",
            ),
            &["outcome"],
        )?;
        let reconcile_pushes = IntCounter::new(
            "sentinel_certs_reconcile_pushes_total",
            "Hosts upserted in the external system",
        )?;
        let reconcile_skips = IntCounter::new(
            "sentinel_certs_reconcile_skips_total",
            "Hosts skipped because the thumbprint already matched",
        )?;
        let challenges_served = IntCounter::new(
            "sentinel_certs_challenges_served_total",
            "HTTP-01 challenge responses served",
        )?;

        registry.register(Box::new(authorizations.clone()))?;
        registry.register(Box::new(certificates_issued.clone()))?;
        registry.register(Box::new(renewal_ticks.clone()))?;
        registry.register(Box::new(reconcile_pushes.clone()))?;
        registry.register(Box::new(reconcile_skips.clone()))?;
        registry.register(Box::new(challenges_served.clone()))?;

        Ok(Self {
            registry,
            authorizations,
            certificates_issued,
            renewal_ticks,
            reconcile_pushes,
            reconcile_skips,
            challenges_served,
        })
    }

    pub fn record_authorization(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.authorizations.with_label_values(&[result]).inc();
    }

    pub fn record_issued(&self) {
        self.certificates_issued.inc();
    }

    /// Record a scheduler tick; `outcome` is one of `idle`, `renewed`,
    /// `partial`, `failed` or `error`
    pub fn record_tick(&self, outcome: &str) {
        self.renewal_ticks.with_label_values(&[outcome]).inc();
    }

    pub fn record_push(&self) {
        self.reconcile_pushes.inc();
    }

    pub fn record_skip(&self) {
        self.reconcile_skips.inc();
    }

    pub fn record_challenge_served(&self) {
        self.challenges_served.inc();
    }

    pub fn authorizations(&self, success: bool) -> u64 {
        let result = if success { "success" } else { "failure" };
        self.authorizations.with_label_values(&[result]).get()
    }

    pub fn certificates_issued(&self) -> u64 {
        self.certificates_issued.get()
    }

    pub fn renewal_ticks(&self, outcome: &str) -> u64 {
        self.renewal_ticks.with_label_values(&[outcome]).get()
    }

    pub fn reconcile_pushes(&self) -> u64 {
        self.reconcile_pushes.get()
    }

    pub fn reconcile_skips(&self) -> u64 {
        self.reconcile_skips.get()
    }

    pub fn challenges_served(&self) -> u64 {
        self.challenges_served.get()
    }

    /// Render all counters in the Prometheus text exposition format
    pub fn encode(&self) -> Result<String, TelemetryError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::Encoding(e.to_string()))
    }
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("certificates_issued", &self.certificates_issued())
            .field("reconcile_pushes", &self.reconcile_pushes())
            .field("reconcile_skips", &self.reconcile_skips())
            .field("challenges_served", &self.challenges_served())
            .finish()
    }
}

// ============================================================================
// Telemetry handle
// ============================================================================

/// Observability handle passed to each component constructor
#[derive(Clone)]
pub struct Telemetry {
    span: Span,
    metrics: Arc<Metrics>,
    component: &'static str,
}

impl Telemetry {
    /// Create the root handle for one orchestrator instance
    pub fn new() -> Result<Self, TelemetryError> {
        Ok(Self {
            span: info_span!("sentinel_certs"),
            metrics: Arc::new(Metrics::new()?),
            component: "root",
        })
    }

    /// Derive a handle for a named component.
    ///
    /// The component span is a child of this handle's span; metrics are shared.
    pub fn component(&self, name: &'static str) -> Self {
        Self {
            span: info_span!(parent: &self.span, "component", component = name),
            metrics: Arc::clone(&self.metrics),
            component: name,
        }
    }

    /// Span that component operations are instrumented with
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Shared metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Name of the component this handle belongs to
    pub fn component_name(&self) -> &'static str {
        self.component
    }
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry")
            .field("component", &self.component)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_components_share_metrics() {
        let root = Telemetry::new().unwrap();
        let issuer = root.component("issuance");
        let reconciler = root.component("reconciler");

        issuer.metrics().record_issued();
        reconciler.metrics().record_push();
        reconciler.metrics().record_skip();

        assert_eq!(root.metrics().certificates_issued(), 1);
        assert_eq!(root.metrics().reconcile_pushes(), 1);
        assert_eq!(issuer.metrics().reconcile_skips(), 1);
        assert_eq!(issuer.component_name(), "issuance");
    }

    #[test]
    fn test_instances_are_isolated() {
        let a = Telemetry::new().unwrap();
        let b = Telemetry::new().unwrap();

        a.metrics().record_authorization(true);

        assert_eq!(a.metrics().authorizations(true), 1);
        assert_eq!(b.metrics().authorizations(true), 0);
    }

    #[test]
    fn test_encode_contains_counters() {
        let telemetry = Telemetry::new().unwrap();
        telemetry.metrics().record_tick("renewed");

        let text = telemetry.metrics().encode().unwrap();
        assert!(text.contains("sentinel_certs_renewal_ticks_total"));
        assert!(text.contains("outcome=\"renewed\""));
    }
}
