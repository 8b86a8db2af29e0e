//! HTTP/1.1 listener for the challenge responder.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ChallengeResponder;

/// Serves challenge responses until cancelled
///
/// Each connection runs on its own task; the responder only reads and
/// deletes challenge records.
#[derive(Debug, Clone)]
pub struct ChallengeServer {
    responder: Arc<ChallengeResponder>,
}

impl ChallengeServer {
    pub fn new(responder: Arc<ChallengeResponder>) -> Self {
        Self { responder }
    }

    /// Bind `addr` and serve until `shutdown` fires
    pub async fn serve(&self, addr: SocketAddr, shutdown: CancellationToken) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve_listener(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> io::Result<()> {
        info!(address = %listener.local_addr()?, "Challenge server listening");

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Challenge server stopped");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            let responder = Arc::clone(&self.responder);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let service = service_fn(move |request: Request<Incoming>| {
                    let responder = Arc::clone(&responder);
                    async move {
                        let response = responder
                            .respond(request.method(), request.uri().path())
                            .await;
                        Ok::<_, Infallible>(response.map(Full::new))
                    }
                });

                let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
                tokio::pin!(conn);

                tokio::select! {
                    result = conn.as_mut() => {
                        if let Err(e) = result {
                            debug!(peer = %peer, error = %e, "Connection closed with error");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        conn.as_mut().graceful_shutdown();
                        let _ = conn.await;
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Challenge;
    use crate::store::{MemoryStore, Store};
    use sentinel_certs_common::Telemetry;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).to_string()
    }

    #[tokio::test]
    async fn test_serves_challenges_over_http() {
        let store = MemoryStore::new();
        store
            .put_challenge(&Challenge::new("token-1", "auth-value-1"))
            .await
            .unwrap();
        let responder = ChallengeResponder::new(
            Arc::new(store.clone()),
            ".well-known/acme-challenge",
            &Telemetry::new().unwrap(),
        )
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = ChallengeServer::new(Arc::new(responder));
        let handle = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { server.serve_listener(listener, shutdown).await }
        });

        let first = get(addr, "/.well-known/acme-challenge/token-1").await;
        assert!(first.starts_with("HTTP/1.1 200 OK"), "{}", first);
        assert!(first.ends_with("auth-value-1"));

        let second = get(addr, "/.well-known/acme-challenge/token-1").await;
        assert!(second.starts_with("HTTP/1.1 404"), "{}", second);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}
