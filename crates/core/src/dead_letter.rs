//! Dead-letter entries: jobs that exhausted their retries or hit a terminal error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{CorrelationId, DeadLetterId, JobId};
use crate::job::{AttemptRecord, ErrorKind, Job, JobError, Priority};

/// Entry in the dead-letter store.
///
/// Created once, read many times, removed only by an operator retry or the
/// retention sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    pub job_id: JobId,
    pub dependency: String,
    pub priority: Priority,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: JobError,
    /// Every attempt of the original job, oldest first
    pub history: Vec<AttemptRecord>,
    pub correlation_id: CorrelationId,
    pub first_failed_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn from_job(job: &Job, error: JobError, now: DateTime<Utc>) -> Self {
        let first_failed_at = job
            .history
            .iter()
            .find(|a| a.error.is_some())
            .map(|a| a.finished_at)
            .unwrap_or(now);

        Self {
            id: DeadLetterId::new(),
            job_id: job.id,
            dependency: job.dependency.clone(),
            priority: job.priority,
            payload: job.payload.clone(),
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            last_error: error,
            history: job.history.clone(),
            correlation_id: job.correlation_id.clone(),
            first_failed_at,
            dead_lettered_at: now,
        }
    }

    /// Build the fresh job used by a manual retry: new id, zero attempts,
    /// original payload, dependency, priority and correlation id.
    pub fn to_fresh_job(&self, now: DateTime<Utc>) -> Job {
        Job::new(
            self.dependency.clone(),
            self.priority,
            self.payload.clone(),
            self.correlation_id.clone(),
            self.max_attempts.max(1),
            now,
        )
    }
}

/// Query over dead-letter entries. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterFilter {
    pub dependency: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// Inclusive lower bound on `dead_lettered_at`
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `dead_lettered_at`
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl DeadLetterFilter {
    pub fn dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependency = Some(dependency.into());
        self
    }

    pub fn error_kind(mut self, kind: ErrorKind) -> Self {
        self.error_kind = Some(kind);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, entry: &DeadLetterEntry) -> bool {
        self.dependency
            .as_deref()
            .is_none_or(|d| entry.dependency == d)
            && self.error_kind.is_none_or(|k| entry.last_error.kind == k)
            && self.since.is_none_or(|s| entry.dead_lettered_at >= s)
            && self.until.is_none_or(|u| entry.dead_lettered_at < u)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobRequest;

    fn failed_job() -> Job {
        let now = Utc::now();
        let mut job = JobRequest::new("ai-provider", serde_json::json!({"prompt": "x"}))
            .with_priority(Priority::High)
            .with_max_attempts(2)
            .into_job(5, now)
            .unwrap();
        job.mark_active(now);
        job.record_failure(JobError::transient("429"), now, now);
        job.mark_active(now);
        job.record_failure(JobError::transient("429"), now, now);
        job
    }

    #[test]
    fn entry_keeps_full_error_history() {
        let job = failed_job();
        let entry = DeadLetterEntry::from_job(&job, JobError::transient("429"), Utc::now());

        assert_eq!(entry.job_id, job.id);
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.history.len(), 2);
        assert!(entry.first_failed_at <= entry.dead_lettered_at);
    }

    #[test]
    fn fresh_job_resets_attempts_and_keeps_payload() {
        let job = failed_job();
        let entry = DeadLetterEntry::from_job(&job, JobError::transient("429"), Utc::now());
        let fresh = entry.to_fresh_job(Utc::now());

        assert_ne!(fresh.id, job.id);
        assert_eq!(fresh.attempts, 0);
        assert_eq!(fresh.payload, job.payload);
        assert_eq!(fresh.priority, Priority::High);
        assert_eq!(fresh.correlation_id, job.correlation_id);
        assert!(fresh.history.is_empty());
    }

    #[test]
    fn filter_matches_on_every_dimension() {
        let job = failed_job();
        let now = Utc::now();
        let entry = DeadLetterEntry::from_job(&job, JobError::terminal("bad"), now);

        assert!(DeadLetterFilter::default().matches(&entry));
        assert!(DeadLetterFilter::default().dependency("ai-provider").matches(&entry));
        assert!(!DeadLetterFilter::default().dependency("scan-browser").matches(&entry));
        assert!(DeadLetterFilter::default().error_kind(ErrorKind::Terminal).matches(&entry));
        assert!(!DeadLetterFilter::default().error_kind(ErrorKind::Transient).matches(&entry));
        assert!(DeadLetterFilter::default().since(now).matches(&entry));
        assert!(!DeadLetterFilter::default().until(now).matches(&entry));
    }
}
