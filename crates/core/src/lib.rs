//! `conductor-core` — job orchestration building blocks.
//!
//! This crate contains **pure domain** primitives (no IO, no async): the job
//! record and its lifecycle, the error taxonomy, the retry decision function,
//! and dead-letter entries.

pub mod dead_letter;
pub mod error;
pub mod id;
pub mod job;
pub mod retry;

pub use dead_letter::{DeadLetterEntry, DeadLetterFilter};
pub use error::{DomainError, DomainResult};
pub use id::{CorrelationId, DeadLetterId, JobId};
pub use job::{AttemptRecord, ErrorKind, Job, JobError, JobRequest, JobStatus, Priority};
pub use retry::{RetryDecision, RetryPolicy};
