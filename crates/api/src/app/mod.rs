//! HTTP application wiring (Axum router + orchestrator wiring).
//!
//! - `services.rs`: builds the orchestrator from configuration
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request/response DTOs and mapping to domain types
//! - `errors.rs`: consistent error responses

use axum::{Extension, Router};
use tower::ServiceBuilder;

use conductor_infra::Orchestrator;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router over `orchestrator`.
///
/// Mount it into the embedding application's server; the application owns
/// the worker pool and its executors.
pub fn build_app(orchestrator: Orchestrator) -> Router {
    routes::router()
        .layer(Extension(orchestrator))
        .layer(ServiceBuilder::new().layer(axum::middleware::from_fn(
            middleware::correlation_middleware,
        )))
}
