//! HTTP surface: `/api/v1` routes over the shared execution data manager.

mod routes;
pub mod state;

use axum::http::{StatusCode, Uri};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use self::state::AppState;

/// Versioned routes plus request tracing. Unknown paths get the same
/// `{data, meta}` envelope as everything else.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes())
        .fallback(unknown_route)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn unknown_route(uri: Uri) -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "data": null,
            "meta": { "path": uri.path(), "error": "no such route" }
        })),
    )
}
