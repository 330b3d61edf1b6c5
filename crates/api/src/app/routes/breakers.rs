use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use conductor_infra::Orchestrator;

use crate::app::errors::ApiError;

pub fn router() -> Router {
    Router::new()
        .route("/breakers", get(list_breakers))
        .route("/breakers/:dependency/reset", post(reset_breaker))
}

pub async fn list_breakers(Extension(orchestrator): Extension<Orchestrator>) -> impl IntoResponse {
    Json(orchestrator.breakers())
}

pub async fn reset_breaker(
    Extension(orchestrator): Extension<Orchestrator>,
    Path(dependency): Path<String>,
) -> Result<StatusCode, ApiError> {
    if orchestrator.reset_breaker(&dependency) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("no circuit breaker for {dependency}")))
    }
}
