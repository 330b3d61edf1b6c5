//! Bounded worker pool.
//!
//! A fixed number of tokio tasks each loop: claim the next ready job, ask the
//! dependency's circuit breaker for permission, run the registered executor
//! under a timeout, then route the outcome to completion, a scheduled retry
//! or the dead-letter store.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

use conductor_core::{
    CorrelationId, DeadLetterId, ErrorKind, Job, JobError, JobId, RetryDecision, RetryPolicy,
};
use conductor_observability::{CorrelationContext, job_span};

use crate::breaker::CircuitBreakerRegistry;
use crate::dead_letter::{DeadLetterError, DeadLetterStore};
use crate::queue::{JobQueue, QueueError};
use crate::store::StoreError;
use crate::sweeper::Sweeper;

/// Executor registered for every dependency without a dedicated one.
pub const WILDCARD_DEPENDENCY: &str = "*";

const OUTCOME_CHANNEL_CAPACITY: usize = 1024;

/// Everything an executor gets for one attempt.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub job_id: JobId,
    pub dependency: String,
    pub payload: serde_json::Value,
    pub correlation_id: CorrelationId,
    /// 1-indexed attempt number
    pub attempt: u32,
    /// Fired when the orchestrator gives up on the attempt (timeout). The
    /// executor should abandon in-flight work promptly.
    pub cancel: CancellationToken,
}

/// Execution callback for jobs of one dependency.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, ctx: ExecutionContext) -> Result<(), JobError>;
}

#[async_trait]
impl<F, Fut> JobExecutor for F
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn execute(&self, ctx: ExecutionContext) -> Result<(), JobError> {
        (self)(ctx).await
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent worker slots
    pub concurrency: usize,
    /// Per-attempt execution limit
    pub job_timeout: Duration,
    /// Sleep between polls of an empty queue
    pub poll_interval: Duration,
    /// Time a timed-out executor gets to honour cancellation before abort
    pub cancel_grace: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            job_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            cancel_grace: Duration::from_secs(1),
            name: "conductor-worker".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// What happened to a job after one attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OutcomeKind {
    Completed,
    RetryScheduled { delay: Duration, error: JobError },
    DeadLettered { entry_id: DeadLetterId, error: JobError },
}

/// Message broadcast after every finished attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub correlation_id: CorrelationId,
    pub dependency: String,
    pub attempts: u32,
    pub kind: OutcomeKind,
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub concurrency: usize,
    /// Workers currently handling a job
    pub busy: usize,
    pub processed: u64,
    pub succeeded: u64,
    /// Attempts that ended in any error, short-circuits included
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub short_circuited: u64,
    pub timed_out: u64,
}

/// Whether the pool is dequeuing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PoolHealth {
    /// Not spawned, or shut down
    Stopped,
    Running,
    /// The store failed; dequeuing is suspended until it answers again
    Halted { reason: String, since: DateTime<Utc> },
}

#[derive(Debug, Default)]
struct Counters {
    concurrency: AtomicUsize,
    busy: AtomicUsize,
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    short_circuited: AtomicU64,
    timed_out: AtomicU64,
}

#[derive(Debug)]
struct MonitorInner {
    counters: Counters,
    health: RwLock<PoolHealth>,
}

/// Shared, lock-light view of pool statistics and health.
///
/// Reads never block workers, so reporters may poll it at any rate.
#[derive(Debug, Clone)]
pub struct PoolMonitor {
    inner: Arc<MonitorInner>,
}

impl Default for PoolMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolMonitor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                counters: Counters::default(),
                health: RwLock::new(PoolHealth::Stopped),
            }),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.inner.counters;
        PoolStats {
            concurrency: c.concurrency.load(Ordering::Relaxed),
            busy: c.busy.load(Ordering::Relaxed),
            processed: c.processed.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            short_circuited: c.short_circuited.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
        }
    }

    pub fn health(&self) -> PoolHealth {
        self.inner.health.read().clone()
    }

    pub fn is_halted(&self) -> bool {
        matches!(*self.inner.health.read(), PoolHealth::Halted { .. })
    }

    /// Stop dequeuing pool-wide. The first reason wins until resume.
    pub fn halt(&self, reason: impl Into<String>) {
        let mut health = self.inner.health.write();
        if matches!(*health, PoolHealth::Halted { .. }) {
            return;
        }
        let reason = reason.into();
        error!(reason = %reason, "worker pool halted: store unavailable");
        *health = PoolHealth::Halted {
            reason,
            since: Utc::now(),
        };
    }

    fn resume(&self) {
        let mut health = self.inner.health.write();
        if let PoolHealth::Halted { since, .. } = &*health {
            info!(halted_since = %since, "worker pool resumed: store reachable again");
            *health = PoolHealth::Running;
        }
    }

    fn set(&self, health: PoolHealth) {
        *self.inner.health.write() = health;
    }

    fn counters(&self) -> &Counters {
        &self.inner.counters
    }
}

/// Decrements the busy gauge when a job is done, however it ends.
struct BusyGuard<'a>(&'a AtomicUsize);

impl<'a> BusyGuard<'a> {
    fn enter(gauge: &'a AtomicUsize) -> Self {
        gauge.fetch_add(1, Ordering::Relaxed);
        Self(gauge)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Worker pool builder. Register executors, then [`spawn`](Self::spawn).
pub struct WorkerPool {
    queue: JobQueue,
    dead_letters: DeadLetterStore,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryPolicy,
    executors: HashMap<String, Arc<dyn JobExecutor>>,
    config: WorkerPoolConfig,
    monitor: PoolMonitor,
    outcomes: broadcast::Sender<JobOutcome>,
    sweeper: Option<Sweeper>,
}

impl WorkerPool {
    pub fn new(
        queue: JobQueue,
        dead_letters: DeadLetterStore,
        breakers: Arc<CircuitBreakerRegistry>,
        retry: RetryPolicy,
        config: WorkerPoolConfig,
    ) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        Self {
            queue,
            dead_letters,
            breakers,
            retry,
            executors: HashMap::new(),
            config,
            monitor: PoolMonitor::new(),
            outcomes,
            sweeper: None,
        }
    }

    /// Share statistics and health with an existing monitor (e.g. the one a
    /// capacity reporter reads).
    pub fn with_monitor(mut self, monitor: PoolMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    /// Run maintenance alongside the workers.
    pub fn with_sweeper(mut self, sweeper: Sweeper) -> Self {
        self.sweeper = Some(sweeper);
        self
    }

    /// Register the executor for a dependency; `"*"` catches the rest.
    pub fn register<E>(&mut self, dependency: impl Into<String>, executor: E)
    where
        E: JobExecutor + 'static,
    {
        self.executors.insert(dependency.into(), Arc::new(executor));
    }

    pub fn monitor(&self) -> PoolMonitor {
        self.monitor.clone()
    }

    /// Outcome stream; subscribe before spawning to see every job.
    pub fn subscribe(&self) -> broadcast::Receiver<JobOutcome> {
        self.outcomes.subscribe()
    }

    /// Start the workers (and the sweeper, if any) on the current runtime.
    pub fn spawn(self) -> WorkerPoolHandle {
        let shutdown = CancellationToken::new();
        let concurrency = self.config.concurrency.max(1);
        let name = self.config.name.clone();

        self.monitor
            .counters()
            .concurrency
            .store(concurrency, Ordering::Relaxed);
        self.monitor.set(PoolHealth::Running);

        let sweeper = self.sweeper.map(|s| s.spawn(shutdown.child_token()));

        let monitor = self.monitor.clone();
        let outcomes = self.outcomes.clone();
        let shared = Arc::new(Shared {
            queue: self.queue,
            dead_letters: self.dead_letters,
            breakers: self.breakers,
            retry: self.retry,
            executors: self.executors,
            config: self.config,
            monitor: self.monitor,
            outcomes: self.outcomes,
        });

        let workers = (0..concurrency)
            .map(|slot| {
                let shared = shared.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(
                    worker_loop(shared, shutdown)
                        .instrument(tracing::info_span!("worker", pool = %name, slot)),
                )
            })
            .collect();

        info!(pool = %name, concurrency, "worker pool started");

        WorkerPoolHandle {
            shutdown,
            workers,
            sweeper,
            monitor,
            outcomes,
        }
    }
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
    monitor: PoolMonitor,
    outcomes: broadcast::Sender<JobOutcome>,
}

impl WorkerPoolHandle {
    /// Stop dequeuing, let in-flight jobs finish and join every worker.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "worker task failed");
            }
        }
        if let Some(sweeper) = self.sweeper {
            if let Err(e) = sweeper.await {
                error!(error = %e, "sweeper task failed");
            }
        }
        self.monitor.set(PoolHealth::Stopped);
        info!("worker pool stopped");
    }

    pub fn stats(&self) -> PoolStats {
        self.monitor.stats()
    }

    pub fn health(&self) -> PoolHealth {
        self.monitor.health()
    }

    pub fn monitor(&self) -> PoolMonitor {
        self.monitor.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobOutcome> {
        self.outcomes.subscribe()
    }
}

struct Shared {
    queue: JobQueue,
    dead_letters: DeadLetterStore,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryPolicy,
    executors: HashMap<String, Arc<dyn JobExecutor>>,
    config: WorkerPoolConfig,
    monitor: PoolMonitor,
    outcomes: broadcast::Sender<JobOutcome>,
}

/// Sleep for `period`; `true` when shutdown was requested meanwhile.
async fn idle(period: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(period) => false,
    }
}

async fn worker_loop(shared: Arc<Shared>, shutdown: CancellationToken) {
    debug!("worker started");
    let poll = shared.config.poll_interval;

    while !shutdown.is_cancelled() {
        if shared.monitor.is_halted() {
            match shared.queue.depth().await {
                Ok(_) => shared.monitor.resume(),
                Err(_) => {
                    if idle(poll, &shutdown).await {
                        break;
                    }
                    continue;
                }
            }
        }

        match shared.queue.dequeue_next().await {
            Ok(Some(job)) => shared.process(job).await,
            Ok(None) => {
                if idle(poll, &shutdown).await {
                    break;
                }
            }
            Err(e) => {
                shared.monitor.halt(format!("claiming a job failed: {e}"));
                if idle(poll, &shutdown).await {
                    break;
                }
            }
        }
    }
    debug!("worker stopped");
}

impl Shared {
    async fn process(&self, job: Job) {
        let span = job_span(&job);
        let correlation_id = job.correlation_id.clone();
        CorrelationContext::scope(correlation_id, self.dispatch(job).instrument(span)).await
    }

    async fn dispatch(&self, mut job: Job) {
        let counters = self.monitor.counters();
        let _busy = BusyGuard::enter(&counters.busy);
        counters.processed.fetch_add(1, Ordering::Relaxed);
        info!("job dispatched");

        let started = Instant::now();
        let result = self.attempt(&job).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(()) => match self.queue.mark_completed(&mut job).await {
                Ok(()) => {
                    counters.succeeded.fetch_add(1, Ordering::Relaxed);
                    info!(elapsed_ms, "job completed");
                    self.publish(&job, OutcomeKind::Completed);
                }
                Err(e) => self.persist_failed(&job, PersistError::Queue(e)),
            },
            Err(error) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                self.handle_failure(job, error, elapsed_ms).await;
            }
        }
    }

    /// Run one attempt, consulting and updating the breaker.
    async fn attempt(&self, job: &Job) -> Result<(), JobError> {
        let Some(executor) = self.executor_for(&job.dependency) else {
            return Err(JobError::terminal(format!(
                "no executor registered for dependency `{}`",
                job.dependency
            )));
        };

        if !self.breakers.allow(&job.dependency) {
            self.monitor
                .counters()
                .short_circuited
                .fetch_add(1, Ordering::Relaxed);
            info!("job short-circuited: circuit open");
            return Err(JobError::circuit_open(&job.dependency));
        }

        let result = self.execute(executor, job).await;
        match &result {
            Ok(()) => self.breakers.record_success(&job.dependency),
            Err(_) => self.breakers.record_failure(&job.dependency),
        }
        result
    }

    /// Run the executor on its own task under the job timeout.
    async fn execute(&self, executor: Arc<dyn JobExecutor>, job: &Job) -> Result<(), JobError> {
        let cancel = CancellationToken::new();
        let ctx = ExecutionContext {
            job_id: job.id,
            dependency: job.dependency.clone(),
            payload: job.payload.clone(),
            correlation_id: job.correlation_id.clone(),
            attempt: job.attempts,
            cancel: cancel.clone(),
        };

        let call = CorrelationContext::scope(job.correlation_id.clone(), async move {
            executor.execute(ctx).await
        });
        let mut task = tokio::spawn(call.instrument(Span::current()));

        let timeout = self.config.job_timeout;
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                error!(error = %join_error, "executor crashed");
                Err(JobError::transient(format!("executor crashed: {join_error}")))
            }
            Err(_) => {
                self.monitor
                    .counters()
                    .timed_out
                    .fetch_add(1, Ordering::Relaxed);
                warn!(timeout_ms = timeout.as_millis() as u64, "job timed out: cancelling");
                cancel.cancel();

                if tokio::time::timeout(self.config.cancel_grace, &mut task)
                    .await
                    .is_err()
                {
                    warn!("executor ignored cancellation: aborting");
                    task.abort();
                }
                Err(JobError::timed_out(timeout))
            }
        }
    }

    async fn handle_failure(&self, mut job: Job, error: JobError, elapsed_ms: u64) {
        let counters = self.monitor.counters();
        let decision = self.retry.decide(job.attempts, job.max_attempts, &error);

        match decision {
            RetryDecision::Retry(delay) => {
                match self.queue.reschedule(&mut job, error.clone(), delay).await {
                    Ok(()) => {
                        counters.retried.fetch_add(1, Ordering::Relaxed);
                        info!(
                            elapsed_ms,
                            error_kind = %error.kind,
                            error = %error.message,
                            delay_ms = delay.as_millis() as u64,
                            attempts_remaining = job.attempts_remaining(),
                            "job failed: retry scheduled"
                        );
                        self.publish(&job, OutcomeKind::RetryScheduled { delay, error });
                    }
                    Err(e) => self.persist_failed(&job, PersistError::Queue(e)),
                }
            }
            RetryDecision::Terminal => {
                if error.kind != ErrorKind::Terminal {
                    debug!(attempts = job.attempts, "retry budget exhausted");
                }
                match self.dead_letters.capture(&mut job, error.clone()).await {
                    Ok(entry) => {
                        counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                        self.publish(
                            &job,
                            OutcomeKind::DeadLettered {
                                entry_id: entry.id,
                                error,
                            },
                        );
                    }
                    Err(e) => self.persist_failed(&job, PersistError::DeadLetter(e)),
                }
            }
        }
    }

    /// An outcome could not be written. A lost claim means another worker
    /// owns the job now; anything else halts the pool so no further work is
    /// taken while the store is unreliable. The job stays `active` and is
    /// reclaimed once stale.
    fn persist_failed(&self, job: &Job, error: PersistError) {
        if let Some(StoreError::ClaimLost(_)) = error.store_error() {
            warn!(job_id = %job.id, "outcome dropped: claim was lost to a reclaim");
            return;
        }
        error!(job_id = %job.id, error = %error, "failed to persist job outcome");
        self.monitor
            .halt(format!("persisting outcome of job {} failed: {error}", job.id));
    }

    fn executor_for(&self, dependency: &str) -> Option<Arc<dyn JobExecutor>> {
        self.executors
            .get(dependency)
            .or_else(|| self.executors.get(WILDCARD_DEPENDENCY))
            .cloned()
    }

    fn publish(&self, job: &Job, kind: OutcomeKind) {
        // No subscribers is fine.
        let _ = self.outcomes.send(JobOutcome {
            job_id: job.id,
            correlation_id: job.correlation_id.clone(),
            dependency: job.dependency.clone(),
            attempts: job.attempts,
            kind,
        });
    }
}

#[derive(Debug, thiserror::Error)]
enum PersistError {
    #[error(transparent)]
    Queue(QueueError),
    #[error(transparent)]
    DeadLetter(DeadLetterError),
}

impl PersistError {
    fn store_error(&self) -> Option<&StoreError> {
        match self {
            PersistError::Queue(QueueError::Store(e))
            | PersistError::DeadLetter(DeadLetterError::Store(e))
            | PersistError::DeadLetter(DeadLetterError::Queue(QueueError::Store(e))) => Some(e),
            _ => None,
        }
    }
}
