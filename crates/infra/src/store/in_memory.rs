//! In-memory store for tests/dev.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use conductor_core::{DeadLetterEntry, DeadLetterFilter, DeadLetterId, Job, JobId, JobStatus};

use super::{Admission, DeadLetterStorage, JobStore, QueueDepth, Requeue, StoreError};

#[derive(Debug)]
struct Slot {
    /// Insertion order, breaks `created_at` ties
    seq: u64,
    job: Job,
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Slot>,
    next_seq: u64,
    dead_letters: HashMap<DeadLetterId, DeadLetterEntry>,
}

impl State {
    fn in_flight(&self) -> usize {
        self.jobs
            .values()
            .filter(|s| s.job.status.is_in_flight())
            .count()
    }

    fn push(&mut self, job: Job) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.jobs.insert(job.id, Slot { seq, job });
    }
}

/// Process-local store. Every operation takes a single lock, which gives the
/// atomicity the traits require.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn insert_within_capacity(&self, job: &Job, limit: usize) -> Result<Admission, StoreError> {
        let mut state = self.state.write();
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }

        let in_flight = state.in_flight();
        if in_flight >= limit {
            return Ok(Admission::Rejected { in_flight });
        }

        state.push(job.clone());
        Ok(Admission::Accepted)
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let mut state = self.state.write();

        let next = state
            .jobs
            .values()
            .filter(|s| s.job.is_ready(now))
            .min_by_key(|s| (s.job.priority, s.job.created_at, s.seq))
            .map(|s| s.job.id);

        Ok(next.and_then(|id| {
            state.jobs.get_mut(&id).map(|slot| {
                slot.job.mark_active(now);
                slot.job.clone()
            })
        }))
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.state.read().jobs.get(&id).map(|s| s.job.clone()))
    }

    async fn update_claimed(&self, job: &Job, claimed_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let slot = state
            .jobs
            .get_mut(&job.id)
            .ok_or(StoreError::NotFound(job.id))?;

        if slot.job.status != JobStatus::Active || slot.job.claimed_at != Some(claimed_at) {
            return Err(StoreError::ClaimLost(job.id));
        }

        slot.job = job.clone();
        Ok(())
    }

    async fn delete(&self, id: JobId) -> Result<bool, StoreError> {
        Ok(self.state.write().jobs.remove(&id).is_some())
    }

    async fn depth(&self) -> Result<QueueDepth, StoreError> {
        let state = self.state.read();
        let mut depth = QueueDepth::default();
        for slot in state.jobs.values() {
            match slot.job.status {
                JobStatus::Queued => depth.queued += 1,
                JobStatus::RetryScheduled => depth.retry_scheduled += 1,
                JobStatus::Active => depth.active += 1,
                JobStatus::Completed | JobStatus::DeadLettered => {}
            }
        }
        Ok(depth)
    }

    async fn reclaim_stale(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError> {
        let mut state = self.state.write();
        let mut reclaimed = Vec::new();
        for slot in state.jobs.values_mut() {
            let stale = slot.job.status == JobStatus::Active
                && slot.job.claimed_at.is_none_or(|at| at < claimed_before);
            if stale {
                slot.job.reclaim(now);
                reclaimed.push(slot.job.id);
            }
        }
        Ok(reclaimed)
    }

    async fn purge_completed(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.write();
        let len = state.jobs.len();
        state
            .jobs
            .retain(|_, s| !(s.job.status == JobStatus::Completed && s.job.updated_at < before));
        Ok((len - state.jobs.len()) as u64)
    }
}

#[async_trait]
impl DeadLetterStorage for InMemoryStore {
    async fn insert_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if state.dead_letters.contains_key(&entry.id) {
            return Err(StoreError::DeadLetterExists(entry.id));
        }
        state.dead_letters.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn get_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, StoreError> {
        Ok(self.state.read().dead_letters.get(&id).cloned())
    }

    async fn find_dead_letter_by_job(&self, job_id: JobId) -> Result<Option<DeadLetterEntry>, StoreError> {
        Ok(self
            .state
            .read()
            .dead_letters
            .values()
            .find(|e| e.job_id == job_id)
            .cloned())
    }

    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let state = self.state.read();
        let mut result: Vec<_> = state
            .dead_letters
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();

        result.sort_by(|a, b| b.dead_lettered_at.cmp(&a.dead_lettered_at));
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn requeue_dead_letter(
        &self,
        id: DeadLetterId,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Requeue, StoreError> {
        let mut state = self.state.write();
        if !state.dead_letters.contains_key(&id) {
            return Ok(Requeue::Missing);
        }

        let in_flight = state.in_flight();
        if in_flight >= limit {
            return Ok(Requeue::Rejected { in_flight });
        }

        let Some(entry) = state.dead_letters.remove(&id) else {
            return Ok(Requeue::Missing);
        };
        let job = entry.to_fresh_job(now);
        state.push(job.clone());
        Ok(Requeue::Requeued { entry, job })
    }

    async fn count_dead_letters_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(self
            .state
            .read()
            .dead_letters
            .values()
            .filter(|e| e.dead_lettered_at >= since)
            .count() as u64)
    }

    async fn purge_dead_letters_before(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.write();
        let len = state.dead_letters.len();
        state.dead_letters.retain(|_, e| e.dead_lettered_at >= before);
        Ok((len - state.dead_letters.len()) as u64)
    }
}
