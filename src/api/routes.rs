//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use super::state::AppState;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/jobs/{job_id}/executions", get(job_executions))
        .route("/metrics", get(metrics))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "peer_enabled": state.manager.peer_enabled()
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

#[derive(Debug, Deserialize)]
struct WindowQuery {
    days: Option<u32>,
}

async fn job_executions(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<WindowQuery>,
) -> (StatusCode, Json<Value>) {
    let days = query.days.unwrap_or_else(|| state.manager.default_days());

    match state.manager.get_job_executions(&job_id, days).await {
        Ok(executions) => (
            StatusCode::OK,
            Json(json!({
                "data": executions,
                "meta": { "job_id": job_id, "days": days, "total": executions.len() }
            })),
        ),
        Err(e) => {
            warn!(%job_id, days, error = %e, "execution request failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "data": null,
                    "meta": { "job_id": job_id, "days": days, "error": e.to_string() }
                })),
            )
        }
    }
}

async fn metrics(State(state): State<AppState>) -> Json<Value> {
    let metrics = state.manager.metrics().await;
    Json(json!({
        "data": metrics,
        "meta": { "timestamp": chrono::Utc::now().to_rfc3339() }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::manager::ExecutionDataManager;
    use crate::model::{ExecutionRecord, ExecutionStatus};
    use crate::store::OwnStore;
    use crate::worker::tests::{target, FakeFactory};
    use crate::worker::{SupervisorPolicy, WorkerSettings, WorkerSupervisor};
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(dir: &tempfile::TempDir) -> Router {
        let records = vec![ExecutionRecord {
            id: "42".to_string(),
            started_at: chrono::Utc::now(),
            status: ExecutionStatus::Succeeded,
            duration_ms: Some(1_500),
            job_average_duration_ms: None,
            peer_metric: None,
        }];
        let supervisor = WorkerSupervisor::new(
            Arc::new(FakeFactory::new(records)),
            target(),
            WorkerSettings::default(),
            SupervisorPolicy::from_config(&Default::default()),
        );
        let manager = ExecutionDataManager::new(
            CacheConfig::default(),
            OwnStore::new(dir.path().join("own.db")),
            None,
            supervisor,
        );
        crate::api::router(AppState { manager })
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let resp = app(&dir)
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["status"], "ok");
        assert_eq!(body["data"]["peer_enabled"], false);
    }

    #[tokio::test]
    async fn test_job_executions() {
        let dir = tempfile::tempdir().unwrap();
        let resp = app(&dir)
            .oneshot(
                Request::get("/api/v1/jobs/job-A/executions?days=3")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["meta"]["total"], 1);
        assert_eq!(body["meta"]["days"], 3);
        assert_eq!(body["data"][0]["id"], "42");
        assert_eq!(body["data"][0]["status"], "succeeded");
    }

    #[tokio::test]
    async fn test_failed_fetch_is_bad_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let resp = app(&dir)
            .oneshot(
                Request::get("/api/v1/jobs/broken/executions")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(resp).await;
        assert!(body["meta"]["error"]
            .as_str()
            .unwrap()
            .contains("connection refused"));
        assert_eq!(body["meta"]["days"], 7);
    }

    #[tokio::test]
    async fn test_metrics_without_worker() {
        let dir = tempfile::tempdir().unwrap();
        let resp = app(&dir)
            .oneshot(Request::get("/api/v1/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["cache_hits"], 0);
        assert!(body["data"]["worker"].is_null());
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let dir = tempfile::tempdir().unwrap();
        let resp = app(&dir)
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_json(resp).await;
        assert!(body["data"].is_null());
        assert_eq!(body["meta"]["path"], "/nope");
    }

    #[tokio::test]
    async fn test_largest_window_is_served() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir);
        for _ in 0..2 {
            let resp = app
                .clone()
                .oneshot(
                    Request::get("/api/v1/jobs/job-A/executions?days=4294967295")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            let body = body_json(resp).await;
            assert_eq!(body["meta"]["total"], 1);
        }
    }
}
