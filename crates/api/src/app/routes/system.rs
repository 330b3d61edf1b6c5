use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use conductor_infra::Orchestrator;

/// 200 while the pool is not halted and the store answers, 503 otherwise.
pub async fn health(Extension(orchestrator): Extension<Orchestrator>) -> impl IntoResponse {
    let snapshot = orchestrator.capacity().await;
    let status = if snapshot.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "healthy": snapshot.is_healthy(),
            "health": snapshot.health,
            "storeError": snapshot.store_error,
        })),
    )
}

pub async fn capacity(Extension(orchestrator): Extension<Orchestrator>) -> impl IntoResponse {
    Json(orchestrator.capacity().await)
}
