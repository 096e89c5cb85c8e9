//! HTTP server for Prometheus metrics
//!
//! # Endpoints
//!
//! - `GET /metrics` - Prometheus text exposition of the injected registry
//! - `GET /health` - liveness check
//!
//! # Example
//!
//! ```ignore
//! use kanava_gateway::metrics_server::MetricsServer;
//!
//! let registry = Arc::new(prometheus::Registry::new());
//! let handle = MetricsServer::start("0.0.0.0:2112".parse()?, Arc::clone(&registry));
//! ```

use axum::extract::State;
use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared state for the metrics server
#[derive(Clone)]
struct AppState {
    registry: Arc<Registry>,
}

/// Metrics HTTP server
pub struct MetricsServer;

impl MetricsServer {
    /// Start serving `registry` on `addr`
    ///
    /// Returns a JoinHandle that can be used to abort the server.
    pub fn start(addr: SocketAddr, registry: Arc<Registry>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(error = %e, %addr, "Failed to bind metrics server");
                    return;
                }
            };
            info!(%addr, "Metrics server listening");

            if let Err(e) = axum::serve(listener, router(registry)).await {
                error!(error = %e, "Metrics server error");
            }
        })
    }
}

fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(AppState { registry })
}

/// Handler for /metrics endpoint
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = crate::metrics::gather(&state.registry);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Handler for /health endpoint
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;

    fn state() -> (Arc<Registry>, Arc<Metrics>) {
        let registry = Arc::new(Registry::new());
        let metrics = Metrics::register(&registry, "ingress").unwrap();
        (registry, metrics)
    }

    #[tokio::test]
    async fn test_metrics_handler_returns_prometheus_format() {
        let (registry, metrics) = state();
        metrics.sent.inc_by(4);

        let response = metrics_handler(State(AppState { registry }))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let content_type = response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.contains("text/plain"));

        let body = axum::body::to_bytes(response.into_body(), 1_000_000)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("kanava_ingress_sent_total 4"));
    }

    #[tokio::test]
    async fn test_health_handler_returns_json() {
        let response = health_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 10_000)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_server_serves_over_tcp() {
        let (registry, _metrics) = state();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, router(registry)).await.unwrap();
        });

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));

        server.abort();
    }
}
