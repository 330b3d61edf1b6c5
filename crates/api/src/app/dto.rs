use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conductor_core::{CorrelationId, DeadLetterFilter, ErrorKind, JobId, JobRequest, Priority};

use crate::app::errors::ApiError;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub dependency: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Overrides the `x-correlation-id` header when present
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl SubmitJobRequest {
    /// Build the domain request, falling back to `header_correlation` when the
    /// body carries no correlation id.
    pub fn into_job_request(self, header_correlation: &CorrelationId) -> Result<JobRequest, ApiError> {
        let correlation_id = match self.correlation_id {
            Some(raw) => CorrelationId::new(raw).map_err(ApiError::from)?,
            None => header_correlation.clone(),
        };

        let mut request = JobRequest::new(self.dependency, self.payload)
            .with_priority(self.priority.unwrap_or_default())
            .with_correlation_id(correlation_id);
        if let Some(max_attempts) = self.max_attempts {
            request = request.with_max_attempts(max_attempts);
        }
        Ok(request)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DeadLetterQuery {
    pub dependency: Option<String>,
    pub error_kind: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl DeadLetterQuery {
    pub fn into_filter(self) -> Result<DeadLetterFilter, ApiError> {
        let mut filter = DeadLetterFilter::default();
        if let Some(dependency) = self.dependency {
            filter = filter.dependency(dependency);
        }
        if let Some(kind) = self.error_kind {
            let kind: ErrorKind = kind.parse().map_err(ApiError::from)?;
            filter = filter.error_kind(kind);
        }
        if let Some(since) = self.since {
            filter = filter.since(since);
        }
        if let Some(until) = self.until {
            filter = filter.until(until);
        }
        if let Some(limit) = self.limit {
            filter = filter.limit(limit);
        }
        Ok(filter)
    }
}

#[derive(Debug, Deserialize)]
pub struct PurgeQuery {
    pub older_than_secs: u64,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub job_id: JobId,
    pub correlation_id: CorrelationId,
}

#[derive(Debug, Serialize)]
pub struct RetryResponse {
    pub job_id: JobId,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub purged: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_correlation_id_wins_over_header() {
        let body: SubmitJobRequest = serde_json::from_value(serde_json::json!({
            "dependency": "ai-provider",
            "priority": "high",
            "payload": {"prompt": "hi"},
            "correlation_id": "from-body",
        }))
        .unwrap();

        let header = CorrelationId::new("from-header").unwrap();
        let request = body.into_job_request(&header).unwrap();
        assert_eq!(request.correlation_id.unwrap().as_str(), "from-body");
        assert_eq!(request.priority, Priority::High);
    }

    #[test]
    fn header_correlation_id_is_the_fallback() {
        let body: SubmitJobRequest =
            serde_json::from_value(serde_json::json!({"dependency": "scan-browser"})).unwrap();
        let header = CorrelationId::new("from-header").unwrap();
        let request = body.into_job_request(&header).unwrap();
        assert_eq!(request.correlation_id, Some(header));
        assert_eq!(request.priority, Priority::Normal);
        assert!(request.payload.is_null());
    }

    #[test]
    fn unknown_error_kind_is_rejected() {
        let query = DeadLetterQuery {
            error_kind: Some("explosive".into()),
            ..Default::default()
        };
        assert!(query.into_filter().is_err());
    }
}
