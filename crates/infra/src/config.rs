//! Orchestrator configuration.
//!
//! Every tunable has a default; `from_env` overrides them from `CONDUCTOR_*`
//! variables. Durations are given in milliseconds.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use conductor_core::RetryPolicy;

use crate::breaker::{BreakerConfig, CircuitBreakerRegistry};
use crate::sweeper::SweeperConfig;
use crate::worker::WorkerPoolConfig;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: `{value}` ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// All orchestrator tunables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub concurrency: usize,
    /// Unfinished jobs (`queued + retry_scheduled + active`) before submissions
    /// are rejected
    pub max_capacity: usize,
    /// Default attempt budget for jobs that do not carry their own
    pub max_attempts: u32,
    pub job_timeout: Duration,
    pub poll_interval: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
    pub circuit_open_delay: Duration,
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub breaker_overrides: BTreeMap<String, BreakerConfig>,
    pub stale_after: Duration,
    pub maintenance_interval: Duration,
    pub cancel_grace: Duration,
    pub completed_retention: Duration,
    pub dead_letter_retention: Option<Duration>,
    /// Look-back window of the dead-letter count in capacity snapshots
    pub report_window: Duration,
    pub database_url: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_capacity: 1000,
            max_attempts: 5,
            job_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            jitter_ratio: 0.2,
            circuit_open_delay: Duration::from_secs(10),
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            breaker_overrides: BTreeMap::new(),
            stale_after: Duration::from_secs(5 * 60),
            maintenance_interval: Duration::from_secs(30),
            cancel_grace: Duration::from_secs(1),
            completed_retention: Duration::from_secs(24 * 60 * 60),
            dead_letter_retention: Some(Duration::from_secs(7 * 24 * 60 * 60)),
            report_window: Duration::from_secs(24 * 60 * 60),
            database_url: None,
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each
    /// `CONDUCTOR_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("CONDUCTOR_CONCURRENCY") {
            config.concurrency = parse("CONDUCTOR_CONCURRENCY", &v)?;
        }
        if let Some(v) = get("CONDUCTOR_MAX_CAPACITY") {
            config.max_capacity = parse("CONDUCTOR_MAX_CAPACITY", &v)?;
        }
        if let Some(v) = get("CONDUCTOR_MAX_ATTEMPTS") {
            config.max_attempts = parse("CONDUCTOR_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("CONDUCTOR_JITTER_RATIO") {
            config.jitter_ratio = parse("CONDUCTOR_JITTER_RATIO", &v)?;
        }
        if let Some(v) = get("CONDUCTOR_FAILURE_THRESHOLD") {
            config.failure_threshold = parse("CONDUCTOR_FAILURE_THRESHOLD", &v)?;
        }

        let durations: [(&str, &mut Duration); 11] = [
            ("CONDUCTOR_JOB_TIMEOUT_MS", &mut config.job_timeout),
            ("CONDUCTOR_POLL_INTERVAL_MS", &mut config.poll_interval),
            ("CONDUCTOR_BASE_DELAY_MS", &mut config.base_delay),
            ("CONDUCTOR_MAX_DELAY_MS", &mut config.max_delay),
            ("CONDUCTOR_CIRCUIT_OPEN_DELAY_MS", &mut config.circuit_open_delay),
            ("CONDUCTOR_COOLDOWN_MS", &mut config.cooldown),
            ("CONDUCTOR_STALE_AFTER_MS", &mut config.stale_after),
            ("CONDUCTOR_MAINTENANCE_INTERVAL_MS", &mut config.maintenance_interval),
            ("CONDUCTOR_CANCEL_GRACE_MS", &mut config.cancel_grace),
            ("CONDUCTOR_COMPLETED_RETENTION_MS", &mut config.completed_retention),
            ("CONDUCTOR_REPORT_WINDOW_MS", &mut config.report_window),
        ];
        for (key, slot) in durations {
            if let Some(v) = get(key) {
                *slot = Duration::from_millis(parse(key, &v)?);
            }
        }

        if let Some(v) = get("CONDUCTOR_DEAD_LETTER_RETENTION_MS") {
            config.dead_letter_retention = match v.to_ascii_lowercase().as_str() {
                "off" | "none" | "never" => None,
                _ => Some(Duration::from_millis(parse(
                    "CONDUCTOR_DEAD_LETTER_RETENTION_MS",
                    &v,
                )?)),
            };
        }

        if let Some(v) = get("CONDUCTOR_BREAKER_OVERRIDES") {
            config.breaker_overrides = parse_breaker_overrides(&v)?;
        }

        config.database_url = get("CONDUCTOR_DATABASE_URL").or_else(|| get("DATABASE_URL"));

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.max_capacity == 0 {
            return Err(ConfigError::Invalid("max_capacity must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if self.failure_threshold == 0
            || self.breaker_overrides.values().any(|b| b.failure_threshold == 0)
        {
            return Err(ConfigError::Invalid(
                "failure_threshold must be at least 1".into(),
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::Invalid(format!(
                "base_delay ({}ms) exceeds max_delay ({}ms)",
                self.base_delay.as_millis(),
                self.max_delay.as_millis()
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(ConfigError::Invalid(format!(
                "jitter_ratio must be within [0, 1], got {}",
                self.jitter_ratio
            )));
        }
        // Retries must be scheduled in the future.
        if self.base_delay.is_zero() || self.circuit_open_delay.is_zero() {
            return Err(ConfigError::Invalid(
                "base_delay and circuit_open_delay must be non-zero".into(),
            ));
        }
        if self.job_timeout.is_zero() || self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "job_timeout and poll_interval must be non-zero".into(),
            ));
        }
        // A job still inside its timeout must never look abandoned.
        if self.stale_after <= self.job_timeout + self.cancel_grace {
            return Err(ConfigError::Invalid(format!(
                "stale_after ({}ms) must exceed job_timeout + cancel_grace ({}ms)",
                self.stale_after.as_millis(),
                (self.job_timeout + self.cancel_grace).as_millis()
            )));
        }
        if self.maintenance_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "maintenance_interval must be non-zero".into(),
            ));
        }
        for dependency in self.breakers_outlasting_retries() {
            warn!(
                dependency,
                circuit_open_budget_ms = self.circuit_open_budget().as_millis() as u64,
                "breaker cooldown exceeds the circuit-open retry budget: jobs refused \
                 right after a trip are dead-lettered before the breaker half-opens"
            );
        }
        Ok(())
    }

    /// Time a job can spend waiting out an open breaker before its default
    /// attempt budget is gone.
    pub fn circuit_open_budget(&self) -> Duration {
        self.circuit_open_delay
            .saturating_mul(self.max_attempts.saturating_sub(1))
    }

    /// Breakers (`"*"` for the defaults) whose cooldown is longer than
    /// [`circuit_open_budget`](Self::circuit_open_budget).
    pub fn breakers_outlasting_retries(&self) -> Vec<&str> {
        let budget = self.circuit_open_budget();
        let mut names = Vec::new();
        if self.cooldown > budget {
            names.push("*");
        }
        names.extend(
            self.breaker_overrides
                .iter()
                .filter(|(_, b)| b.cooldown > budget)
                .map(|(name, _)| name.as_str()),
        );
        names
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.base_delay, self.max_delay)
            .with_jitter_ratio(self.jitter_ratio)
            .with_circuit_open_delay(self.circuit_open_delay)
    }

    pub fn breaker_defaults(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown: self.cooldown,
        }
    }

    pub fn breaker_registry(&self) -> CircuitBreakerRegistry {
        self.breaker_overrides.iter().fold(
            CircuitBreakerRegistry::new(self.breaker_defaults()),
            |registry, (dependency, config)| registry.with_override(dependency.clone(), *config),
        )
    }

    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::default()
            .with_concurrency(self.concurrency)
            .with_job_timeout(self.job_timeout)
            .with_poll_interval(self.poll_interval)
            .with_cancel_grace(self.cancel_grace)
    }

    pub fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig {
            stale_after: self.stale_after,
            interval: self.maintenance_interval,
            completed_retention: self.completed_retention,
            dead_letter_retention: self.dead_letter_retention,
        }
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// `name=threshold:cooldown_ms` pairs separated by commas.
fn parse_breaker_overrides(raw: &str) -> Result<BTreeMap<String, BreakerConfig>, ConfigError> {
    const KEY: &str = "CONDUCTOR_BREAKER_OVERRIDES";
    let invalid = |reason: &str| ConfigError::InvalidValue {
        key: KEY.to_string(),
        value: raw.to_string(),
        reason: reason.to_string(),
    };

    let mut overrides = BTreeMap::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, setting) = item
            .split_once('=')
            .ok_or_else(|| invalid("expected name=threshold:cooldown_ms"))?;
        let (threshold, cooldown) = setting
            .split_once(':')
            .ok_or_else(|| invalid("expected name=threshold:cooldown_ms"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(invalid("empty dependency name"));
        }
        overrides.insert(
            name.to_string(),
            BreakerConfig {
                failure_threshold: parse(KEY, threshold.trim())?,
                cooldown: Duration::from_millis(parse(KEY, cooldown.trim())?),
            },
        );
    }
    Ok(overrides)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = OrchestratorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.max_capacity, 1000);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = OrchestratorConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, OrchestratorConfig::default());
    }

    #[test]
    fn environment_overrides_apply() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("CONDUCTOR_CONCURRENCY", "16"),
            ("CONDUCTOR_MAX_CAPACITY", "10"),
            ("CONDUCTOR_COOLDOWN_MS", "1500"),
            ("CONDUCTOR_DEAD_LETTER_RETENTION_MS", "off"),
            ("CONDUCTOR_BREAKER_OVERRIDES", "ai-provider=3:10000, scan-browser=8:60000"),
            ("DATABASE_URL", "postgres://localhost/conductor"),
        ]))
        .unwrap();

        assert_eq!(config.concurrency, 16);
        assert_eq!(config.max_capacity, 10);
        assert_eq!(config.cooldown, Duration::from_millis(1500));
        assert_eq!(config.dead_letter_retention, None);
        assert_eq!(config.breaker_overrides["ai-provider"].failure_threshold, 3);
        assert_eq!(
            config.breaker_overrides["scan-browser"].cooldown,
            Duration::from_secs(60)
        );
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/conductor"));

        let registry = config.breaker_registry();
        assert_eq!(registry.config_for("ai-provider").failure_threshold, 3);
        assert_eq!(registry.config_for("other").failure_threshold, 5);
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = OrchestratorConfig::from_lookup(lookup(&[("CONDUCTOR_CONCURRENCY", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "CONDUCTOR_CONCURRENCY"));

        assert!(
            OrchestratorConfig::from_lookup(lookup(&[("CONDUCTOR_BREAKER_OVERRIDES", "ai-provider")]))
                .is_err()
        );
    }

    #[test]
    fn validation_catches_inconsistent_settings() {
        let zero = OrchestratorConfig {
            concurrency: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());

        let inverted = OrchestratorConfig {
            base_delay: Duration::from_secs(120),
            ..Default::default()
        };
        assert!(inverted.validate().is_err());

        let jitter = OrchestratorConfig {
            jitter_ratio: 1.5,
            ..Default::default()
        };
        assert!(jitter.validate().is_err());

        let reclaim_too_eager = OrchestratorConfig {
            stale_after: Duration::from_secs(30),
            ..Default::default()
        };
        assert!(reclaim_too_eager.validate().is_err());

        let immediate_retry = OrchestratorConfig {
            base_delay: Duration::ZERO,
            ..Default::default()
        };
        assert!(immediate_retry.validate().is_err());

        let no_breaker_wait = OrchestratorConfig {
            circuit_open_delay: Duration::ZERO,
            ..Default::default()
        };
        assert!(no_breaker_wait.validate().is_err());
    }

    #[test]
    fn default_retries_outlast_the_breaker_cooldown() {
        let config = OrchestratorConfig::default();
        assert!(config.circuit_open_budget() >= config.cooldown);
        assert!(config.breakers_outlasting_retries().is_empty());

        let mut slow = BTreeMap::new();
        slow.insert(
            "scan-browser".to_string(),
            BreakerConfig {
                failure_threshold: 3,
                cooldown: Duration::from_secs(120),
            },
        );
        let config = OrchestratorConfig {
            breaker_overrides: slow,
            ..Default::default()
        };
        // Still valid; the mismatch is only reported.
        config.validate().unwrap();
        assert_eq!(config.breakers_outlasting_retries(), vec!["scan-browser"]);
    }

    #[test]
    fn derived_configs_follow_settings() {
        let config = OrchestratorConfig {
            concurrency: 2,
            maintenance_interval: Duration::from_secs(5),
            ..Default::default()
        };
        assert_eq!(config.worker_pool_config().concurrency, 2);
        assert_eq!(config.sweeper_config().interval, Duration::from_secs(5));
        assert_eq!(config.breaker_defaults().failure_threshold, 5);
    }
}
