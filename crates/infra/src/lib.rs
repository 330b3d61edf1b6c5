//! Infrastructure layer: persistence, the queue and worker pool, circuit
//! breakers, dead letters and reporting.
//!
//! Everything is constructed explicitly (usually through [`Orchestrator`])
//! and passed by handle; there is no process-global state.

pub mod breaker;
pub mod capacity;
pub mod config;
pub mod dead_letter;
pub mod orchestrator;
pub mod queue;
pub mod store;
pub mod sweeper;
pub mod worker;

pub use breaker::{BreakerConfig, BreakerSnapshot, CircuitBreakerRegistry, CircuitState};
pub use capacity::{CapacityReporter, CapacitySnapshot};
pub use config::{ConfigError, OrchestratorConfig};
pub use dead_letter::{DeadLetterError, DeadLetterStore};
pub use orchestrator::{JobStatusView, Orchestrator, SubmitError};
pub use queue::{JobQueue, QueueError};
pub use store::{
    DeadLetterStorage, InMemoryStore, JobStore, PostgresStore, QueueDepth, Requeue, StoreError,
};
pub use sweeper::{SweepReport, Sweeper, SweeperConfig};
pub use worker::{
    ExecutionContext, JobExecutor, JobOutcome, OutcomeKind, PoolHealth, PoolMonitor, PoolStats,
    WorkerPool, WorkerPoolConfig, WorkerPoolHandle, WILDCARD_DEPENDENCY,
};
