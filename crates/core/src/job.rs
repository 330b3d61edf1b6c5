//! Job record, lifecycle transitions and the failure taxonomy.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{DomainError, DomainResult};
use crate::id::{CorrelationId, JobId};

/// Dispatch priority.
///
/// Declaration order is dequeue order: `High < Normal < Low`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Numeric rank used for storage and ordering (0 = dequeued first).
    pub fn rank(self) -> i16 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    pub fn from_rank(rank: i16) -> DomainResult<Self> {
        match rank {
            0 => Ok(Priority::High),
            1 => Ok(Priority::Normal),
            2 => Ok(Priority::Low),
            other => Err(DomainError::unknown_variant("priority", other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl FromStr for Priority {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            _ => Err(DomainError::unknown_variant("priority", s)),
        }
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its first dispatch
    Queued,
    /// Claimed by exactly one worker
    Active,
    /// Finished successfully
    Completed,
    /// Failed transiently, waiting for `next_attempt_at`
    RetryScheduled,
    /// Handed over to the dead-letter store
    DeadLettered,
}

impl JobStatus {
    /// Eligible for dequeue once `next_attempt_at` has passed.
    pub fn is_waiting(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::RetryScheduled)
    }

    /// Counts against queue capacity.
    pub fn is_in_flight(self) -> bool {
        self.is_waiting() || self == JobStatus::Active
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::DeadLettered)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::RetryScheduled => "retry_scheduled",
            JobStatus::DeadLettered => "dead_lettered",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "active" => Ok(JobStatus::Active),
            "completed" => Ok(JobStatus::Completed),
            "retry_scheduled" => Ok(JobStatus::RetryScheduled),
            "dead_lettered" => Ok(JobStatus::DeadLettered),
            _ => Err(DomainError::unknown_variant("job status", s)),
        }
    }
}

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timeouts, rate limits, temporarily unavailable dependencies
    Transient,
    /// Malformed payloads, permanent rejections
    Terminal,
    /// Dispatch blocked by the dependency's circuit breaker
    CircuitOpen,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Terminal)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Terminal => "terminal",
            ErrorKind::CircuitOpen => "circuit_open",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(ErrorKind::Transient),
            "terminal" => Ok(ErrorKind::Terminal),
            "circuit_open" => Ok(ErrorKind::CircuitOpen),
            _ => Err(DomainError::unknown_variant("error kind", s)),
        }
    }
}

/// A classified failure returned by an execution callback (or synthesised by
/// the orchestrator for timeouts and open breakers).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind} error: {message}")]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Terminal, message)
    }

    pub fn circuit_open(dependency: &str) -> Self {
        Self::new(
            ErrorKind::CircuitOpen,
            format!("circuit open for dependency `{dependency}`"),
        )
    }

    pub fn timed_out(after: Duration) -> Self {
        Self::transient(format!(
            "execution timed out after {}ms",
            after.as_millis()
        ))
    }
}

/// Record of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error: Option<JobError>,
    pub duration_ms: u64,
}

/// Submission shape accepted from the surrounding application.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub dependency: String,
    pub priority: Priority,
    pub payload: serde_json::Value,
    pub correlation_id: Option<CorrelationId>,
    pub max_attempts: Option<u32>,
}

impl JobRequest {
    pub fn new(dependency: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            dependency: dependency.into(),
            priority: Priority::default(),
            payload,
            correlation_id: None,
            max_attempts: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        let dependency = self.dependency.trim();
        if dependency.is_empty() {
            return Err(DomainError::validation("dependency name must not be empty"));
        }
        if dependency.len() > 128 {
            return Err(DomainError::validation(
                "dependency name must be at most 128 characters",
            ));
        }
        if self.max_attempts == Some(0) {
            return Err(DomainError::validation("max_attempts must be at least 1"));
        }
        Ok(())
    }

    /// Build the job record. `default_max_attempts` applies when the request
    /// did not carry its own budget.
    pub fn into_job(self, default_max_attempts: u32, now: DateTime<Utc>) -> DomainResult<Job> {
        self.validate()?;
        let max_attempts = self.max_attempts.unwrap_or(default_max_attempts);
        if max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be at least 1"));
        }
        Ok(Job::new(
            self.dependency.trim().to_string(),
            self.priority,
            self.payload,
            self.correlation_id.unwrap_or_else(CorrelationId::generate),
            max_attempts,
            now,
        ))
    }
}

/// A unit of work against a named external dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Which external system the job calls; selects the circuit breaker
    pub dependency: String,
    pub priority: Priority,
    /// Opaque to the orchestrator
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Execution attempts started so far
    pub attempts: u32,
    pub max_attempts: u32,
    /// Not eligible for dequeue before this instant
    pub next_attempt_at: DateTime<Utc>,
    pub correlation_id: CorrelationId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set while `Active`; used to reclaim work from dead workers
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_error: Option<JobError>,
    pub history: Vec<AttemptRecord>,
}

impl Job {
    pub fn new(
        dependency: impl Into<String>,
        priority: Priority,
        payload: serde_json::Value,
        correlation_id: CorrelationId,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            dependency: dependency.into(),
            priority,
            payload,
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts,
            next_attempt_at: now,
            correlation_id,
            created_at: now,
            updated_at: now,
            claimed_at: None,
            last_error: None,
            history: Vec::new(),
        }
    }

    /// Check if the job may be dequeued at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status.is_waiting() && self.next_attempt_at <= now
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    /// Claim for execution; starts a new attempt.
    pub fn mark_active(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Active;
        self.attempts += 1;
        self.claimed_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, started_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.claimed_at = None;
        self.updated_at = now;
        self.push_attempt(started_at, now, None);
    }

    /// Record a failed attempt. The status is decided separately by the retry
    /// policy via [`Job::schedule_retry`] or [`Job::mark_dead_lettered`].
    pub fn record_failure(&mut self, error: JobError, started_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.updated_at = now;
        self.push_attempt(started_at, now, Some(error.clone()));
        self.last_error = Some(error);
    }

    /// Put the job back in line after `delay`.
    ///
    /// Refused once the attempt budget is spent: such a job must be
    /// dead-lettered instead.
    pub fn schedule_retry(&mut self, delay: Duration, now: DateTime<Utc>) -> DomainResult<()> {
        if self.attempts >= self.max_attempts {
            return Err(DomainError::validation(format!(
                "job {} has used {} of {} attempts and cannot be retried",
                self.id, self.attempts, self.max_attempts
            )));
        }
        self.status = JobStatus::RetryScheduled;
        self.next_attempt_at = add_std(now, delay);
        self.claimed_at = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_dead_lettered(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::DeadLettered;
        self.claimed_at = None;
        self.updated_at = now;
    }

    /// Return an abandoned `Active` job to the queue.
    ///
    /// The interrupted attempt never reported an outcome, so it is not counted.
    pub fn reclaim(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Queued;
        self.attempts = self.attempts.saturating_sub(1);
        self.next_attempt_at = now;
        self.claimed_at = None;
        self.updated_at = now;
    }

    fn push_attempt(&mut self, started_at: DateTime<Utc>, now: DateTime<Utc>, error: Option<JobError>) {
        self.history.push(AttemptRecord {
            attempt: self.attempts,
            started_at,
            finished_at: now,
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }
}

/// `now + delay`, saturating instead of overflowing.
pub fn add_std(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `now - delay`, saturating instead of overflowing.
pub fn sub_std(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
