use axum::{routing::get, Router};

pub mod breakers;
pub mod dead_letters;
pub mod jobs;
pub mod system;

pub fn router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/capacity", get(system::capacity))
        .merge(jobs::router())
        .merge(dead_letters::router())
        .merge(breakers::router())
}
