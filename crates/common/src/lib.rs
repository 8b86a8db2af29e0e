//! Shared utilities for sentinel-certs.
//!
//! - [`telemetry`]: injected observability handle and Prometheus metrics
//! - [`retry`]: bounded retry combinator used for authorization completion

pub mod retry;
pub mod telemetry;

pub use retry::{BackoffFn, RetryPolicy};
pub use telemetry::{init_tracing, LogFormat, Metrics, Telemetry, TelemetryError};
