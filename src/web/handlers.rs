//! HTTP request handlers.

use super::AppState;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json},
};
use serde::Serialize;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

pub async fn handle_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub monitors: usize,
}

pub async fn handle_healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        monitors: state.registry.len().await,
    })
}

/// Registry snapshot: one entry per monitor with task state and failure counters.
pub async fn handle_monitors(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.snapshot().await)
}

#[cfg(test)]
mod tests {
    use super::super::{MetricsRegistry, Server};
    use crate::db::memory::MemoryStore;
    use crate::db::{ProbeResult, Status};
    use crate::scheduler::testing::{context, definition, FakeProber};
    use crate::scheduler::{Reconciler, ReconcilerOptions, Registry};

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn get(server: &Server, uri: &str) -> (StatusCode, String) {
        let response = server
            .routes()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let metrics = Arc::new(MetricsRegistry::new());
        let m = definition("web");
        let mut result = ProbeResult::new(&m);
        result.status = Status::Failed;
        metrics.update(&m, &result);

        let server = Server::new(0, Registry::new(), metrics);
        let (status, body) = get(&server, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(r#"pulsetrail_web{id="web",result="_status",type="http"} 2"#));
    }

    #[tokio::test]
    async fn test_healthz_and_unknown_route() {
        let server = Server::new(0, Registry::new(), Arc::new(MetricsRegistry::new()));

        let (status, body) = get(&server, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["monitors"], 0);

        let (status, _) = get(&server, "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_monitors_snapshot() {
        let store = Arc::new(MemoryStore::polling_only());
        store.upsert(definition("b"));
        store.upsert(definition("a"));
        let prober = Arc::new(FakeProber::default());
        let ctx = context(prober, store.clone());
        let registry = Registry::new();
        let reconciler = Reconciler::new(
            store,
            registry.clone(),
            ctx,
            ReconcilerOptions {
                poll_interval: Duration::from_secs(10),
                force_polling: true,
                stagger_window: Duration::from_secs(60),
            },
        );
        reconciler.load_initial().await.unwrap();

        let server = Server::new(0, registry, Arc::new(MetricsRegistry::new()));
        let (status, body) = get(&server, "/api/monitors").await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        let entries = json.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["id"], "a");
        assert_eq!(entries[1]["id"], "b");
        assert_eq!(entries[0]["type"], "http");
        assert_eq!(entries[0]["consecutiveFailures"], 0);
        assert_eq!(entries[0]["alerted"], false);

        reconciler.shutdown().await;
    }
}
