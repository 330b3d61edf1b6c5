//! Priority-ordered, persisted job queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use conductor_core::job::sub_std;
use conductor_core::{Job, JobError, JobId, JobStatus};

use crate::store::{Admission, JobStore, QueueDepth, StoreError};

/// Queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    /// Backpressure: the job was not queued.
    #[error("queue is at capacity ({limit} unfinished jobs)")]
    CapacityExceeded { limit: usize },
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// The job is in a state the operation does not apply to
    #[error("job {id} is {status}, expected {expected}")]
    InvalidState {
        id: JobId,
        status: JobStatus,
        expected: JobStatus,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Job queue over a [`JobStore`].
///
/// Cheap to clone; every clone shares the same store.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    max_capacity: usize,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("max_capacity", &self.max_capacity)
            .finish_non_exhaustive()
    }
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, max_capacity: usize) -> Self {
        Self {
            store,
            max_capacity,
        }
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Add a job. Rejected with [`QueueError::CapacityExceeded`] once
    /// `queued + retry_scheduled + active` reaches `max_capacity`.
    pub async fn enqueue(&self, job: Job) -> Result<JobId, QueueError> {
        match self
            .store
            .insert_within_capacity(&job, self.max_capacity)
            .await?
        {
            Admission::Accepted => {
                info!(
                    job_id = %job.id,
                    correlation_id = %job.correlation_id,
                    dependency = %job.dependency,
                    priority = job.priority.as_str(),
                    "job enqueued"
                );
                Ok(job.id)
            }
            Admission::Rejected { in_flight } => {
                warn!(
                    correlation_id = %job.correlation_id,
                    dependency = %job.dependency,
                    in_flight,
                    limit = self.max_capacity,
                    "job rejected: queue at capacity"
                );
                Err(QueueError::CapacityExceeded {
                    limit: self.max_capacity,
                })
            }
        }
    }

    /// Claim the next ready job, flipping it to `active`. Never blocks.
    pub async fn dequeue_next(&self) -> Result<Option<Job>, QueueError> {
        let job = self.store.claim_next(Utc::now()).await?;
        if let Some(job) = &job {
            debug!(
                job_id = %job.id,
                correlation_id = %job.correlation_id,
                dependency = %job.dependency,
                attempt = job.attempts,
                "job dequeued"
            );
        }
        Ok(job)
    }

    /// Record a failed attempt and put the job back in line after `delay`.
    pub async fn reschedule(&self, job: &mut Job, error: JobError, delay: Duration) -> Result<(), QueueError> {
        let claimed_at = self.claim_of(job)?;
        let now = Utc::now();
        job.record_failure(error, claimed_at, now);
        job.schedule_retry(delay, now).map_err(|_| QueueError::InvalidState {
            id: job.id,
            status: job.status,
            expected: JobStatus::Active,
        })?;
        self.store.update_claimed(job, claimed_at).await?;
        Ok(())
    }

    pub async fn mark_completed(&self, job: &mut Job) -> Result<(), QueueError> {
        let claimed_at = self.claim_of(job)?;
        job.mark_completed(claimed_at, Utc::now());
        self.store.update_claimed(job, claimed_at).await?;
        Ok(())
    }

    /// Delete a job record.
    pub async fn remove(&self, id: JobId) -> Result<(), QueueError> {
        if self.store.delete(id).await? {
            Ok(())
        } else {
            Err(QueueError::NotFound(id))
        }
    }

    pub async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn depth(&self) -> Result<QueueDepth, QueueError> {
        Ok(self.store.depth().await?)
    }

    /// Return jobs stuck in `active` for longer than `stale_after` to the
    /// queue.
    pub async fn reclaim_stale(&self, stale_after: Duration) -> Result<Vec<JobId>, QueueError> {
        let now = Utc::now();
        let cutoff = sub_std(now, stale_after);
        let reclaimed = self.store.reclaim_stale(cutoff, now).await?;
        for id in &reclaimed {
            warn!(job_id = %id, "reclaimed stale active job");
        }
        Ok(reclaimed)
    }

    pub async fn purge_completed(&self, older_than: Duration) -> Result<u64, QueueError> {
        let cutoff = sub_std(Utc::now(), older_than);
        Ok(self.store.purge_completed(cutoff).await?)
    }

    fn claim_of(&self, job: &Job) -> Result<chrono::DateTime<Utc>, QueueError> {
        match (job.status, job.claimed_at) {
            (JobStatus::Active, Some(at)) => Ok(at),
            (status, _) => Err(QueueError::InvalidState {
                id: job.id,
                status,
                expected: JobStatus::Active,
            }),
        }
    }
}
