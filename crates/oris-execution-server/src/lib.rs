//! C5 Lease Stream Service and the §6 REST surface: the HTTP facade the
//! node lease loop and operator CLI talk to.

pub mod error;
pub mod lease_stream;
pub mod rest;
pub mod state;
pub mod wire;

use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

pub use state::{AppState, ServerConfig};

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Assembles the full router: health check, streaming lease protocol
/// under `/`, REST surface under `/`. Mirrors the teacher's
/// `build_router(state) -> Router` shape from `oris-runtime`'s
/// `execution_server` example.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .merge(lease_stream::router())
        .merge(rest::router())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use oris_events::InMemoryEventPublisher;
    use oris_execution_runtime::{InMemoryLeaseRegistry, InMemoryNodeRegistry, InMemoryRunStore, Scheduler, SchedulerConfig};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let lease_registry = Arc::new(InMemoryLeaseRegistry::new());
        let node_registry = Arc::new(InMemoryNodeRegistry::new());
        let run_store = Arc::new(InMemoryRunStore::new());
        let scheduler = Arc::new(Scheduler::new(
            lease_registry.clone(),
            node_registry.clone(),
            run_store.clone(),
            SchedulerConfig::default(),
        ));
        AppState {
            lease_registry,
            node_registry,
            run_store,
            scheduler,
            events: Arc::new(InMemoryEventPublisher::default()),
            config: ServerConfig::default(),
        }
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_then_get_run_round_trips() {
        let app = build_router(test_state());
        let create_body = serde_json::json!({"agent_id": "a1", "version": "v1"}).to_string();
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/runs")
                    .header("content-type", "application/json")
                    .body(Body::from(create_body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = http_body_util::BodyExt::collect(response.into_body()).await.unwrap().to_bytes();
        let run: oris_kernel::Run = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(run.status, oris_kernel::RunStatus::Pending);

        let response = app
            .oneshot(Request::builder().uri(format!("/runs/{}", run.id)).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_unknown_run_is_404() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/runs/does-not-exist").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
