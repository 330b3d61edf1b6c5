//! Persistence seams for jobs and dead letters.
//!
//! The queue and the dead-letter store never touch storage directly; they go
//! through [`JobStore`] and [`DeadLetterStorage`]. Two implementations ship:
//! [`InMemoryStore`] for tests/dev and [`PostgresStore`] for durable
//! deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use conductor_core::{DeadLetterEntry, DeadLetterFilter, DeadLetterId, Job, JobId};

mod in_memory;
mod postgres;

pub use in_memory::InMemoryStore;
pub use postgres::PostgresStore;

/// Persistence error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("dead-letter entry already exists: {0}")]
    DeadLetterExists(DeadLetterId),
    /// The job is no longer held by the claim that tried to update it
    #[error("claim on job {0} was lost")]
    ClaimLost(JobId),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result of a capacity-checked insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// `in_flight` unfinished jobs already held the whole capacity
    Rejected { in_flight: usize },
}

/// Result of moving a dead letter back into the queue.
#[derive(Debug, Clone)]
pub enum Requeue {
    /// The entry was removed and `job` inserted in its place
    Requeued { entry: DeadLetterEntry, job: Job },
    /// The queue was full; the entry is untouched
    Rejected { in_flight: usize },
    /// No such entry (never existed, already retried or purged)
    Missing,
}

/// Count of unfinished jobs by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub queued: usize,
    pub retry_scheduled: usize,
    pub active: usize,
}

impl QueueDepth {
    /// Jobs waiting for a worker (`queued + retry_scheduled`).
    pub fn waiting(&self) -> usize {
        self.queued + self.retry_scheduled
    }

    /// Jobs counted against capacity.
    pub fn in_flight(&self) -> usize {
        self.waiting() + self.active
    }
}

/// Job persistence.
///
/// Implementations must make `insert_within_capacity` and `claim_next`
/// atomic: the capacity check and the insert happen together, and a claimed
/// job is flipped to `active` in the same operation that selects it.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job unless `limit` unfinished jobs already exist.
    async fn insert_within_capacity(&self, job: &Job, limit: usize) -> Result<Admission, StoreError>;

    /// Claim the next ready job: highest priority, then oldest, then
    /// first inserted. The returned job is already `active` with its attempt
    /// counter incremented.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Persist the outcome of an attempt. Fails with
    /// [`StoreError::ClaimLost`] unless the stored job is still `active` under
    /// the claim taken at `claimed_at`.
    async fn update_claimed(&self, job: &Job, claimed_at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Remove a job. Returns whether it existed.
    async fn delete(&self, id: JobId) -> Result<bool, StoreError>;

    async fn depth(&self) -> Result<QueueDepth, StoreError>;

    /// Return `active` jobs claimed before `claimed_before` to the queue.
    async fn reclaim_stale(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError>;

    /// Delete completed jobs last updated before `before`.
    async fn purge_completed(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Dead-letter persistence.
///
/// Implementations hold the job table too: requeueing touches both.
#[async_trait]
pub trait DeadLetterStorage: Send + Sync {
    async fn insert_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), StoreError>;

    async fn get_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, StoreError>;

    async fn find_dead_letter_by_job(&self, job_id: JobId) -> Result<Option<DeadLetterEntry>, StoreError>;

    /// Matching entries, most recently dead-lettered first.
    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>, StoreError>;

    /// Remove an entry and insert a fresh job built from it, unless `limit`
    /// unfinished jobs already exist. Both writes commit together or not at
    /// all, so an entry is never lost between leaving the dead-letter store
    /// and reaching the queue. A second call for the same id returns
    /// [`Requeue::Missing`].
    async fn requeue_dead_letter(
        &self,
        id: DeadLetterId,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Requeue, StoreError>;

    async fn count_dead_letters_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn purge_dead_letters_before(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;
}
