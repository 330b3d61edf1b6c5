//! Orchestrator facade: one explicitly constructed set of queue, breakers,
//! dead-letter store and reporter, shared by the worker pool and callers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument};

use conductor_observability::CorrelationContext;

use conductor_core::{
    DeadLetterEntry, DeadLetterFilter, DeadLetterId, DomainError, JobError, JobId, JobRequest,
    JobStatus,
};

use crate::breaker::{BreakerSnapshot, CircuitBreakerRegistry};
use crate::capacity::{CapacityReporter, CapacitySnapshot};
use crate::config::{ConfigError, OrchestratorConfig};
use crate::dead_letter::{DeadLetterError, DeadLetterStore};
use crate::queue::{JobQueue, QueueError};
use crate::store::{DeadLetterStorage, InMemoryStore, JobStore, StoreError};
use crate::sweeper::Sweeper;
use crate::worker::{PoolMonitor, WorkerPool};

/// Submission-time error, returned synchronously to the caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SubmitError {
    #[error("queue is at capacity ({limit} unfinished jobs)")]
    CapacityExceeded { limit: usize },
    #[error("invalid job: {0}")]
    InvalidJob(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<QueueError> for SubmitError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::CapacityExceeded { limit } => Self::CapacityExceeded { limit },
            QueueError::Store(e) => Self::Store(e),
            other => Self::Store(StoreError::Storage(other.to_string())),
        }
    }
}

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<JobError>,
}

#[derive(Debug, Clone)]
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    queue: JobQueue,
    dead_letters: DeadLetterStore,
    breakers: Arc<CircuitBreakerRegistry>,
    monitor: PoolMonitor,
    reporter: CapacityReporter,
}

impl Orchestrator {
    /// Wire every component over `store`, which backs both the queue and the
    /// dead-letter store.
    pub fn new<S>(config: OrchestratorConfig, store: Arc<S>) -> Result<Self, ConfigError>
    where
        S: JobStore + DeadLetterStorage + 'static,
    {
        config.validate()?;

        let jobs: Arc<dyn JobStore> = store.clone();
        let letters: Arc<dyn DeadLetterStorage> = store;

        let queue = JobQueue::new(jobs, config.max_capacity);
        let dead_letters = DeadLetterStore::new(letters, queue.clone());
        let breakers = Arc::new(config.breaker_registry());
        let monitor = PoolMonitor::new();
        let reporter = CapacityReporter::new(
            queue.clone(),
            breakers.clone(),
            dead_letters.clone(),
            monitor.clone(),
        )
        .with_window(config.report_window);

        info!(
            max_capacity = config.max_capacity,
            concurrency = config.concurrency,
            max_attempts = config.max_attempts,
            "orchestrator initialised"
        );

        Ok(Self {
            config: Arc::new(config),
            queue,
            dead_letters,
            breakers,
            monitor,
            reporter,
        })
    }

    /// Orchestrator over a fresh [`InMemoryStore`].
    pub fn in_memory(config: OrchestratorConfig) -> Result<Self, ConfigError> {
        Self::new(config, InMemoryStore::arc())
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn dead_letter_store(&self) -> &DeadLetterStore {
        &self.dead_letters
    }

    pub fn breaker_registry(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn monitor(&self) -> &PoolMonitor {
        &self.monitor
    }

    /// A worker pool sharing this orchestrator's state, with maintenance
    /// attached. Register executors on it, then spawn.
    pub fn worker_pool(&self) -> WorkerPool {
        let sweeper = Sweeper::new(
            self.queue.clone(),
            self.dead_letters.clone(),
            self.config.sweeper_config(),
        );
        WorkerPool::new(
            self.queue.clone(),
            self.dead_letters.clone(),
            self.breakers.clone(),
            self.config.retry_policy(),
            self.config.worker_pool_config(),
        )
        .with_monitor(self.monitor.clone())
        .with_sweeper(sweeper)
    }

    /// Validate and enqueue a job.
    ///
    /// A request without a correlation id inherits the caller's
    /// [`CorrelationContext`], so jobs submitted from inside a running job or
    /// a request scope stay traceable to it.
    #[instrument(skip(self, request), fields(dependency = %request.dependency), err)]
    pub async fn submit(&self, request: JobRequest) -> Result<JobId, SubmitError> {
        let request = match request.correlation_id {
            Some(_) => request,
            None => request.with_correlation_id(CorrelationContext::current_or_generate()),
        };
        let job = request.into_job(self.config.max_attempts, Utc::now())?;
        Ok(self.queue.enqueue(job).await?)
    }

    /// Status of a job, whether still queued, finished or dead-lettered.
    /// `None` once the record is gone (never existed, or purged).
    pub async fn status(&self, job_id: JobId) -> Result<Option<JobStatusView>, DeadLetterError> {
        if let Some(job) = self.queue.get(job_id).await? {
            return Ok(Some(JobStatusView {
                job_id,
                status: job.status,
                attempts: job.attempts,
                last_error: job.last_error,
            }));
        }

        Ok(self
            .dead_letters
            .find_by_job(job_id)
            .await?
            .map(|entry| JobStatusView {
                job_id,
                status: JobStatus::DeadLettered,
                attempts: entry.attempts,
                last_error: Some(entry.last_error),
            }))
    }

    pub async fn dead_letters(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        self.dead_letters.list(filter).await
    }

    pub async fn dead_letter(&self, id: DeadLetterId) -> Result<DeadLetterEntry, DeadLetterError> {
        self.dead_letters.get(id).await
    }

    pub async fn retry_dead_letter(&self, id: DeadLetterId) -> Result<JobId, DeadLetterError> {
        self.dead_letters.retry(id).await
    }

    pub async fn purge_dead_letters(&self, older_than: Duration) -> Result<u64, DeadLetterError> {
        self.dead_letters.purge_older_than(older_than).await
    }

    pub async fn capacity(&self) -> CapacitySnapshot {
        self.reporter.snapshot().await
    }

    pub fn breakers(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshot()
    }

    pub fn reset_breaker(&self, dependency: &str) -> bool {
        self.breakers.reset(dependency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{ExecutionContext, OutcomeKind};
    use conductor_core::{CorrelationId, ErrorKind, Priority};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            max_capacity: 10,
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            jitter_ratio: 0.0,
            circuit_open_delay: Duration::from_millis(5),
            poll_interval: Duration::from_millis(5),
            job_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    fn request(dependency: &str) -> JobRequest {
        JobRequest::new(dependency, serde_json::json!({"url": "https://example.com"}))
    }

    #[test]
    fn rejects_invalid_config() {
        let config = OrchestratorConfig {
            concurrency: 0,
            ..Default::default()
        };
        assert!(Orchestrator::in_memory(config).is_err());
    }

    #[tokio::test]
    async fn submission_inherits_the_ambient_correlation_id() {
        let orchestrator = Orchestrator::in_memory(config()).unwrap();
        let ambient = CorrelationId::new("req-parent").unwrap();

        let inherited = CorrelationContext::scope(
            ambient.clone(),
            orchestrator.submit(request("scan-browser")),
        )
        .await
        .unwrap();
        let explicit = CorrelationContext::scope(
            ambient.clone(),
            orchestrator.submit(
                request("scan-browser").with_correlation_id(CorrelationId::new("req-own").unwrap()),
            ),
        )
        .await
        .unwrap();
        let detached = orchestrator.submit(request("scan-browser")).await.unwrap();

        let correlation = |job: Option<conductor_core::Job>| job.unwrap().correlation_id;
        assert_eq!(correlation(orchestrator.queue().get(inherited).await.unwrap()), ambient);
        assert_eq!(
            correlation(orchestrator.queue().get(explicit).await.unwrap()).as_str(),
            "req-own"
        );
        assert_ne!(correlation(orchestrator.queue().get(detached).await.unwrap()), ambient);
    }

    #[tokio::test]
    async fn submit_then_query_status() {
        let orchestrator = Orchestrator::in_memory(config()).unwrap();
        let id = orchestrator
            .submit(request("scan-browser").with_priority(Priority::High))
            .await
            .unwrap();

        let view = orchestrator.status(id).await.unwrap().unwrap();
        assert_eq!(view.status, JobStatus::Queued);
        assert_eq!(view.attempts, 0);
        assert!(view.last_error.is_none());

        assert!(orchestrator.status(JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_request_is_rejected_synchronously() {
        let orchestrator = Orchestrator::in_memory(config()).unwrap();
        let err = orchestrator.submit(request("  ")).await.unwrap_err();
        assert!(matches!(err, SubmitError::InvalidJob(_)));
        assert_eq!(orchestrator.queue().depth().await.unwrap().waiting(), 0);
    }

    #[tokio::test]
    async fn capacity_frees_up_after_completion() {
        let orchestrator = Orchestrator::in_memory(config()).unwrap();
        for _ in 0..10 {
            orchestrator.submit(request("scan-browser")).await.unwrap();
        }
        assert!(matches!(
            orchestrator.submit(request("scan-browser")).await,
            Err(SubmitError::CapacityExceeded { limit: 10 })
        ));

        let mut job = orchestrator.queue().dequeue_next().await.unwrap().unwrap();
        orchestrator.queue().mark_completed(&mut job).await.unwrap();

        orchestrator.submit(request("scan-browser")).await.unwrap();
        assert_eq!(
            orchestrator.status(job.id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn dead_lettered_job_status_and_retry() {
        let orchestrator = Orchestrator::in_memory(config()).unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        let mut pool = orchestrator.worker_pool();
        let counter = calls.clone();
        pool.register("ai-provider", move |_ctx: ExecutionContext| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), JobError>(JobError::transient("upstream 503"))
            }
        });
        let mut outcomes = pool.subscribe();
        let handle = pool.spawn();

        let correlation_id = CorrelationId::new("req-42").unwrap();
        let id = orchestrator
            .submit(request("ai-provider").with_correlation_id(correlation_id.clone()))
            .await
            .unwrap();

        let entry_id = loop {
            let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
                .await
                .unwrap()
                .unwrap();
            if let OutcomeKind::DeadLettered { entry_id, .. } = outcome.kind {
                assert_eq!(outcome.job_id, id);
                assert_eq!(outcome.correlation_id, correlation_id);
                break entry_id;
            }
        };
        handle.shutdown().await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let view = orchestrator.status(id).await.unwrap().unwrap();
        assert_eq!(view.status, JobStatus::DeadLettered);
        assert_eq!(view.attempts, 3);
        assert_eq!(view.last_error.unwrap().kind, ErrorKind::Transient);

        let entries = orchestrator.dead_letters(&DeadLetterFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].history.len(), 3);

        let snapshot = orchestrator.capacity().await;
        assert_eq!(snapshot.dead_letter_count_24h, 1);

        let new_id = orchestrator.retry_dead_letter(entry_id).await.unwrap();
        assert_ne!(new_id, id);
        assert!(matches!(
            orchestrator.retry_dead_letter(entry_id).await,
            Err(DeadLetterError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn breaker_controls_pass_through() {
        let orchestrator = Orchestrator::in_memory(config()).unwrap();
        assert!(!orchestrator.reset_breaker("ai-provider"));

        orchestrator.breaker_registry().trip("ai-provider");
        let breakers = orchestrator.breakers();
        assert_eq!(breakers.len(), 1);
        assert_eq!(breakers[0].dependency, "ai-provider");

        assert!(orchestrator.reset_breaker("ai-provider"));
        assert!(orchestrator.breaker_registry().allow("ai-provider"));
    }
}
