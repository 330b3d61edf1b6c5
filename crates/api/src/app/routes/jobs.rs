use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use conductor_core::JobId;
use conductor_infra::Orchestrator;

use crate::app::dto;
use crate::app::errors::ApiError;
use crate::context::RequestCorrelation;

pub fn router() -> Router {
    Router::new()
        .route("/jobs", post(submit_job))
        .route("/jobs/:id", get(get_job))
}

pub async fn submit_job(
    Extension(orchestrator): Extension<Orchestrator>,
    Extension(correlation): Extension<RequestCorrelation>,
    Json(body): Json<dto::SubmitJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request = body.into_job_request(correlation.id())?;
    let correlation_id = request
        .correlation_id
        .clone()
        .unwrap_or_else(|| correlation.id().clone());

    let job_id = orchestrator.submit(request).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(dto::SubmitJobResponse {
            job_id,
            correlation_id,
        }),
    ))
}

pub async fn get_job(
    Extension(orchestrator): Extension<Orchestrator>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id: JobId = id.parse()?;
    match orchestrator.status(job_id).await? {
        Some(view) => Ok(Json(view)),
        None => Err(ApiError::NotFound(format!("job not found: {job_id}"))),
    }
}
