use std::time::Duration;

use axum::{
    extract::{Extension, Path, Query},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use conductor_core::DeadLetterId;
use conductor_infra::Orchestrator;

use crate::app::dto;
use crate::app::errors::ApiError;

pub fn router() -> Router {
    Router::new()
        .route("/dead-letters", get(list_dead_letters).delete(purge_dead_letters))
        .route("/dead-letters/:id", get(get_dead_letter))
        .route("/dead-letters/:id/retry", post(retry_dead_letter))
}

pub async fn list_dead_letters(
    Extension(orchestrator): Extension<Orchestrator>,
    Query(query): Query<dto::DeadLetterQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = query.into_filter()?;
    Ok(Json(orchestrator.dead_letters(&filter).await?))
}

pub async fn get_dead_letter(
    Extension(orchestrator): Extension<Orchestrator>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id: DeadLetterId = id.parse()?;
    Ok(Json(orchestrator.dead_letter(id).await?))
}

pub async fn retry_dead_letter(
    Extension(orchestrator): Extension<Orchestrator>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id: DeadLetterId = id.parse()?;
    let job_id = orchestrator.retry_dead_letter(id).await?;
    Ok(Json(dto::RetryResponse { job_id }))
}

pub async fn purge_dead_letters(
    Extension(orchestrator): Extension<Orchestrator>,
    Query(query): Query<dto::PurgeQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let purged = orchestrator
        .purge_dead_letters(Duration::from_secs(query.older_than_secs))
        .await?;
    Ok(Json(dto::PurgeResponse { purged }))
}
