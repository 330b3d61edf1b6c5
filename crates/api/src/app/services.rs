//! Orchestrator wiring: Postgres when a database URL is configured, in-memory
//! otherwise.

use std::sync::Arc;

use conductor_infra::{
    ConfigError, InMemoryStore, Orchestrator, OrchestratorConfig, PostgresStore, StoreError,
};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Build an orchestrator from `config`. Settings are validated before any
/// database connection is attempted.
pub async fn build_orchestrator(config: OrchestratorConfig) -> Result<Orchestrator, ServiceError> {
    config.validate()?;
    match config.database_url.clone() {
        Some(url) => {
            tracing::info!("using postgres job store");
            let store = PostgresStore::connect(&url).await?;
            store.ensure_schema().await?;
            Ok(Orchestrator::new(config, Arc::new(store))?)
        }
        None => {
            tracing::warn!("no database url configured; jobs are kept in memory only");
            Ok(Orchestrator::new(config, InMemoryStore::arc())?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::JobRequest;

    #[tokio::test]
    async fn without_database_url_jobs_live_in_memory() {
        let orchestrator = build_orchestrator(OrchestratorConfig::default()).await.unwrap();
        let id = orchestrator
            .submit(JobRequest::new("scan-browser", serde_json::json!({})))
            .await
            .unwrap();
        assert!(orchestrator.status(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn invalid_settings_fail_before_connecting() {
        let config = OrchestratorConfig {
            concurrency: 0,
            database_url: Some("postgres://nobody@127.0.0.1:1/unreachable".into()),
            ..Default::default()
        };
        assert!(matches!(
            build_orchestrator(config).await,
            Err(ServiceError::Config(_))
        ));
    }
}
