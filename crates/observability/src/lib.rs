//! Tracing, logging and correlation (shared setup).

/// Initialize process-wide observability (JSON logs unless
/// `CONDUCTOR_LOG_FORMAT` says otherwise).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Correlation id propagation across tasks and log lines.
pub mod correlation;

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use self::correlation::{CorrelationContext, job_span};
pub use self::tracing::{LOG_FORMAT_ENV, LogFormat, init_with};
