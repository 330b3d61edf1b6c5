use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use conductor_core::DomainError;
use conductor_infra::{DeadLetterError, QueueError, StoreError, SubmitError};

/// Handler error, rendered as `{"error": code, "message": ...}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    CapacityExceeded(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unavailable(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::CapacityExceeded(_) => (StatusCode::TOO_MANY_REQUESTS, "capacity_exceeded"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        json_error(status, code, self.to_string())
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => ApiError::NotFound(err.to_string()),
            other => ApiError::Unavailable(other.to_string()),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::CapacityExceeded { .. } => ApiError::CapacityExceeded(err.to_string()),
            QueueError::NotFound(_) => ApiError::NotFound(err.to_string()),
            QueueError::InvalidState { .. } => ApiError::BadRequest(err.to_string()),
            QueueError::Store(e) => e.into(),
        }
    }
}

impl From<SubmitError> for ApiError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::CapacityExceeded { .. } => ApiError::CapacityExceeded(err.to_string()),
            SubmitError::InvalidJob(e) => e.into(),
            SubmitError::Store(e) => e.into(),
        }
    }
}

impl From<DeadLetterError> for ApiError {
    fn from(err: DeadLetterError) -> Self {
        match err {
            DeadLetterError::NotFound(_) => ApiError::NotFound(err.to_string()),
            DeadLetterError::Queue(e) => e.into(),
            DeadLetterError::Store(e) => e.into(),
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::DeadLetterId;

    #[test]
    fn errors_map_to_statuses() {
        let cases = [
            (
                ApiError::from(SubmitError::CapacityExceeded { limit: 10 }),
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                ApiError::from(SubmitError::InvalidJob(DomainError::validation("empty"))),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from(DeadLetterError::NotFound(DeadLetterId::new())),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(StoreError::Storage("connection refused".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ApiError::from(DeadLetterError::Queue(QueueError::CapacityExceeded { limit: 1 })),
                StatusCode::TOO_MANY_REQUESTS,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.status_and_code().0, status);
        }
    }
}
