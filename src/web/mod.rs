//! Metrics and status server.

mod handlers;
mod metrics;

pub use handlers::*;
pub use metrics::MetricsRegistry;

use crate::scheduler::Registry;

use axum::{routing::get, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub metrics: Arc<MetricsRegistry>,
}

/// HTTP server exposing gauges and the registry snapshot.
pub struct Server {
    port: u16,
    state: AppState,
}

impl Server {
    pub fn new(port: u16, registry: Registry, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            port,
            state: AppState { registry, metrics },
        }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        Router::new()
            .route("/metrics", get(handlers::handle_metrics))
            .route("/healthz", get(handlers::handle_healthz))
            .route("/api/monitors", get(handlers::handle_monitors))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), std::io::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let router = self.routes();

        tracing::info!("Metrics server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
    }
}
