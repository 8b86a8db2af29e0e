//! HTTP-01 challenge responses
//!
//! When the CA validates a domain it requests `/<prefix>/<token>`. The
//! responder looks the token up in the store, answers with the expected
//! response, and then forgets the challenge: every response is served once.

use std::sync::Arc;

use bytes::Bytes;
use http::{header, Method, Response, StatusCode};
use regex::Regex;
use sentinel_certs_common::Telemetry;
use tracing::{debug, error, trace, warn};

use crate::store::Store;

mod server;

pub use server::ChallengeServer;

/// Path that exposes Prometheus metrics when enabled
pub const METRICS_PATH: &str = "/metrics";

/// Answers challenge requests from the store
pub struct ChallengeResponder {
    store: Arc<dyn Store>,
    valid_path: Regex,
    serve_metrics: bool,
    telemetry: Telemetry,
}

impl ChallengeResponder {
    /// Responder for paths under `path_prefix`; surrounding slashes are ignored
    pub fn new(
        store: Arc<dyn Store>,
        path_prefix: &str,
        telemetry: &Telemetry,
    ) -> Result<Self, regex::Error> {
        let prefix = path_prefix.trim_matches('/');
        let valid_path = Regex::new(&format!("^/{}/([a-zA-Z0-9_-]+)$", regex::escape(prefix)))?;

        Ok(Self {
            store,
            valid_path,
            serve_metrics: false,
            telemetry: telemetry.component("challenge-server"),
        })
    }

    /// Also answer `GET /metrics`
    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.serve_metrics = enabled;
        self
    }

    /// Token in a challenge request path
    pub fn extract_token<'a>(&self, path: &'a str) -> Option<&'a str> {
        self.valid_path
            .captures(path)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
    }

    /// Build the response for one request
    pub async fn respond(&self, method: &Method, path: &str) -> Response<Bytes> {
        if method != Method::GET && method != Method::HEAD {
            return plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        }

        if self.serve_metrics && path == METRICS_PATH {
            return self.metrics();
        }

        let Some(token) = self.extract_token(path) else {
            debug!(path = %path, "Invalid challenge URL format");
            return not_found();
        };

        let challenge = match self.store.get_challenge(token).await {
            Ok(Some(challenge)) => challenge,
            Ok(None) => {
                trace!(token = %token, "Challenge token not found");
                return not_found();
            }
            Err(e) => {
                error!(token = %token, error = %e, "Error getting challenge");
                return not_found();
            }
        };

        // A HEAD carries no body, so the challenge stays for the real GET
        if method == Method::HEAD {
            trace!(token = %token, "Answered HEAD for ACME challenge");
            return plain(StatusCode::OK, Bytes::new());
        }

        if let Err(e) = self.store.delete_challenge(token).await {
            warn!(token = %token, error = %e, "Error deleting served challenge");
        }

        self.telemetry.metrics().record_challenge_served();
        debug!(token = %token, "Served ACME challenge");
        plain(StatusCode::OK, challenge.value)
    }

    fn metrics(&self) -> Response<Bytes> {
        match self.telemetry.metrics().encode() {
            Ok(body) => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
                .body(Bytes::from(body))
                .unwrap_or_else(|_| internal_error()),
            Err(e) => {
                error!(error = %e, "Failed to encode metrics");
                internal_error()
            }
        }
    }
}

impl std::fmt::Debug for ChallengeResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeResponder")
            .field("valid_path", &self.valid_path.as_str())
            .field("serve_metrics", &self.serve_metrics)
            .finish()
    }
}

fn plain(status: StatusCode, body: impl Into<Bytes>) -> Response<Bytes> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn not_found() -> Response<Bytes> {
    plain(StatusCode::NOT_FOUND, "404 page not found")
}

fn internal_error() -> Response<Bytes> {
    plain(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}
