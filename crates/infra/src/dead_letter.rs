//! Dead-letter store: durable capture of jobs that will not be retried.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use conductor_core::job::sub_std;
use conductor_core::{DeadLetterEntry, DeadLetterFilter, DeadLetterId, Job, JobError, JobId};

use crate::queue::{JobQueue, QueueError};
use crate::store::{DeadLetterStorage, Requeue, StoreError};

/// Dead-letter error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeadLetterError {
    /// The entry does not exist, or was already retried or purged.
    #[error("dead-letter entry not found: {0}")]
    NotFound(DeadLetterId),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Dead-letter store over a [`DeadLetterStorage`] and the [`JobQueue`] it
/// takes jobs from and hands retries back to.
#[derive(Clone)]
pub struct DeadLetterStore {
    storage: Arc<dyn DeadLetterStorage>,
    queue: JobQueue,
}

impl std::fmt::Debug for DeadLetterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterStore")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl DeadLetterStore {
    pub fn new(storage: Arc<dyn DeadLetterStorage>, queue: JobQueue) -> Self {
        Self { storage, queue }
    }

    /// Record the final failure of `job` and move it out of the queue.
    ///
    /// The entry is written before the job is deleted. A crash in between
    /// leaves the job `active`; stale reclaim then runs it again, which the
    /// at-least-once contract allows.
    pub async fn capture(&self, job: &mut Job, error: JobError) -> Result<DeadLetterEntry, DeadLetterError> {
        let now = Utc::now();
        let started_at = job.claimed_at.unwrap_or(now);
        job.record_failure(error.clone(), started_at, now);
        job.mark_dead_lettered(now);

        let entry = DeadLetterEntry::from_job(job, error, now);
        self.storage.insert_dead_letter(&entry).await?;

        match self.queue.remove(job.id).await {
            Ok(()) => {}
            Err(QueueError::NotFound(id)) => {
                warn!(job_id = %id, "dead-lettered job was already gone from the queue");
            }
            Err(e) => {
                error!(
                    job_id = %job.id,
                    entry_id = %entry.id,
                    error = %e,
                    "dead letter written but job could not be removed from the queue"
                );
                return Err(e.into());
            }
        }

        warn!(
            job_id = %job.id,
            entry_id = %entry.id,
            correlation_id = %job.correlation_id,
            dependency = %job.dependency,
            attempts = job.attempts,
            error_kind = %entry.last_error.kind,
            error = %entry.last_error.message,
            "job dead-lettered"
        );
        Ok(entry)
    }

    /// Entries matching `filter`, most recent first.
    pub async fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        Ok(self.storage.list_dead_letters(filter).await?)
    }

    pub async fn get(&self, id: DeadLetterId) -> Result<DeadLetterEntry, DeadLetterError> {
        self.storage
            .get_dead_letter(id)
            .await?
            .ok_or(DeadLetterError::NotFound(id))
    }

    pub async fn find_by_job(&self, job_id: JobId) -> Result<Option<DeadLetterEntry>, DeadLetterError> {
        Ok(self.storage.find_dead_letter_by_job(job_id).await?)
    }

    /// Re-enqueue a fresh job (new id, zero attempts, original payload) and
    /// remove the entry, as one storage operation. Retrying an entry twice
    /// yields [`DeadLetterError::NotFound`] the second time.
    ///
    /// When the queue is full, or storage fails, the entry stays where it is.
    pub async fn retry(&self, id: DeadLetterId) -> Result<JobId, DeadLetterError> {
        let limit = self.queue.max_capacity();
        match self.storage.requeue_dead_letter(id, Utc::now(), limit).await? {
            Requeue::Requeued { entry, job } => {
                info!(
                    entry_id = %id,
                    original_job_id = %entry.job_id,
                    job_id = %job.id,
                    correlation_id = %entry.correlation_id,
                    "dead letter re-enqueued"
                );
                Ok(job.id)
            }
            Requeue::Rejected { in_flight } => {
                warn!(entry_id = %id, in_flight, limit, "dead-letter retry rejected: queue full");
                Err(QueueError::CapacityExceeded { limit }.into())
            }
            Requeue::Missing => Err(DeadLetterError::NotFound(id)),
        }
    }

    /// Delete entries dead-lettered more than `older_than` ago.
    pub async fn purge_older_than(&self, older_than: Duration) -> Result<u64, DeadLetterError> {
        let cutoff = sub_std(Utc::now(), older_than);
        let purged = self.storage.purge_dead_letters_before(cutoff).await?;
        if purged > 0 {
            info!(purged, cutoff = %cutoff, "purged dead letters");
        }
        Ok(purged)
    }

    pub async fn count_since(&self, since: DateTime<Utc>) -> Result<u64, DeadLetterError> {
        Ok(self.storage.count_dead_letters_since(since).await?)
    }
}
