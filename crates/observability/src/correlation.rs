//! Correlation context.
//!
//! Every job carries a [`CorrelationId`] from the request that submitted it.
//! Workers run each attempt inside [`CorrelationContext::scope`] and a
//! [`job_span`], so the id shows up on every log line the attempt produces and
//! downstream calls can read it back with [`CorrelationContext::current`].

use std::future::Future;

use conductor_core::{CorrelationId, Job};
use tracing::Span;

tokio::task_local! {
    static CURRENT: CorrelationId;
}

/// Task-local correlation id propagation.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrelationContext;

impl CorrelationContext {
    /// Run `fut` with `id` as the current correlation id.
    pub async fn scope<F>(id: CorrelationId, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT.scope(id, fut).await
    }

    /// The correlation id of the running task, if it was started inside a scope.
    pub fn current() -> Option<CorrelationId> {
        CURRENT.try_with(|id| id.clone()).ok()
    }

    /// The current id, or a freshly generated one outside any scope.
    pub fn current_or_generate() -> CorrelationId {
        Self::current().unwrap_or_else(CorrelationId::generate)
    }
}

/// Span carrying the job's identity; every dispatch runs inside one.
pub fn job_span(job: &Job) -> Span {
    tracing::info_span!(
        "job",
        job_id = %job.id,
        correlation_id = %job.correlation_id,
        dependency = %job.dependency,
        attempt = job.attempts,
    )
}
