//! HTTP API: job submission and operator endpoints over an
//! [`Orchestrator`](conductor_infra::Orchestrator).

pub mod app;
pub mod context;
pub mod middleware;
