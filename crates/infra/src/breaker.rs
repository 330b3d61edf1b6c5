//! Per-dependency circuit breakers.
//!
//! Three states per dependency name:
//! Closed (normal operation), Open (failing fast) and Half-Open (one probe
//! call testing recovery). Every transition happens under the registry lock,
//! so the open to half-open gate lets exactly one caller through even when
//! many workers ask at the same instant.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed,
    /// Failure mode - calls are short-circuited until the cooldown expires
    Open,
    /// Testing recovery - one probe call is outstanding
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tuning for one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker
    pub failure_threshold: u32,
    /// Time spent open before a probe is allowed
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub dependency: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    /// Time left before the next probe is allowed; only set while open
    pub cooldown_remaining_ms: Option<u64>,
}

#[derive(Debug)]
struct Breaker {
    config: BreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Breaker {
    fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.probe_in_flight = false;
    }

    fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(at)) => {
                Some(self.config.cooldown.saturating_sub(now.saturating_duration_since(at)))
            }
            _ => None,
        }
    }
}

/// Registry of breakers keyed by dependency name.
///
/// Breakers are created lazily, closed, on first use. Workers only call
/// [`allow`](Self::allow), [`record_success`](Self::record_success) and
/// [`record_failure`](Self::record_failure); everything else is for
/// reporting and operators.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    defaults: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: BreakerConfig) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Use different tuning for one dependency.
    pub fn with_override(mut self, dependency: impl Into<String>, config: BreakerConfig) -> Self {
        self.overrides.insert(dependency.into(), config);
        self
    }

    pub fn config_for(&self, dependency: &str) -> BreakerConfig {
        self.overrides
            .get(dependency)
            .copied()
            .unwrap_or(self.defaults)
    }

    /// May a job for `dependency` be dispatched now?
    pub fn allow(&self, dependency: &str) -> bool {
        self.allow_at(dependency, Instant::now())
    }

    pub fn allow_at(&self, dependency: &str, now: Instant) -> bool {
        let mut breakers = self.breakers.lock();
        let breaker = self.entry(&mut breakers, dependency);

        match breaker.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let expired = breaker
                    .opened_at
                    .is_none_or(|at| now.saturating_duration_since(at) >= breaker.config.cooldown);
                if !expired {
                    return false;
                }
                breaker.state = CircuitState::HalfOpen;
                breaker.probe_in_flight = true;
                info!(dependency, "circuit half-open: dispatching probe");
                true
            }
            CircuitState::HalfOpen => {
                if breaker.probe_in_flight {
                    false
                } else {
                    breaker.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self, dependency: &str) {
        let mut breakers = self.breakers.lock();
        let breaker = self.entry(&mut breakers, dependency);

        match breaker.state {
            CircuitState::Closed => breaker.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                breaker.close();
                info!(dependency, "circuit closed: probe succeeded");
            }
            CircuitState::Open => {
                // A job dispatched before the trip; only a probe may close.
                breaker.consecutive_failures = 0;
                debug!(dependency, "success reported while circuit open");
            }
        }
    }

    pub fn record_failure(&self, dependency: &str) {
        self.record_failure_at(dependency, Instant::now());
    }

    pub fn record_failure_at(&self, dependency: &str, now: Instant) {
        let mut breakers = self.breakers.lock();
        let breaker = self.entry(&mut breakers, dependency);

        match breaker.state {
            CircuitState::Closed => {
                breaker.consecutive_failures = breaker.consecutive_failures.saturating_add(1);
                if breaker.consecutive_failures >= breaker.config.failure_threshold {
                    breaker.open(now);
                    warn!(
                        dependency,
                        consecutive_failures = breaker.consecutive_failures,
                        cooldown_ms = breaker.config.cooldown.as_millis() as u64,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                breaker.consecutive_failures = breaker.consecutive_failures.saturating_add(1);
                breaker.open(now);
                warn!(dependency, "circuit re-opened: probe failed");
            }
            CircuitState::Open => {
                debug!(dependency, "failure reported while circuit open");
            }
        }
    }

    /// Current state without side effects. An open breaker whose cooldown
    /// has expired still reads as open until the next `allow`.
    pub fn state(&self, dependency: &str) -> CircuitState {
        self.breakers
            .lock()
            .get(dependency)
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// State of every known breaker, by name.
    pub fn states(&self) -> BTreeMap<String, CircuitState> {
        self.breakers
            .lock()
            .iter()
            .map(|(name, b)| (name.clone(), b.state))
            .collect()
    }

    /// Detailed view of every known breaker, sorted by dependency.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let now = Instant::now();
        let breakers = self.breakers.lock();
        let mut out: Vec<_> = breakers
            .iter()
            .map(|(name, b)| BreakerSnapshot {
                dependency: name.clone(),
                state: b.state,
                consecutive_failures: b.consecutive_failures,
                failure_threshold: b.config.failure_threshold,
                cooldown_remaining_ms: b.cooldown_remaining(now).map(|d| d.as_millis() as u64),
            })
            .collect();
        drop(breakers);

        out.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        out
    }

    /// Force a breaker closed. Returns whether the breaker existed.
    pub fn reset(&self, dependency: &str) -> bool {
        let mut breakers = self.breakers.lock();
        match breakers.get_mut(dependency) {
            Some(breaker) => {
                breaker.close();
                info!(dependency, "circuit reset by operator");
                true
            }
            None => false,
        }
    }

    /// Force a breaker open, starting a fresh cooldown.
    pub fn trip(&self, dependency: &str) {
        let mut breakers = self.breakers.lock();
        let breaker = self.entry(&mut breakers, dependency);
        breaker.open(Instant::now());
        warn!(dependency, "circuit tripped by operator");
    }

    fn entry<'a>(&self, breakers: &'a mut HashMap<String, Breaker>, dependency: &str) -> &'a mut Breaker {
        breakers
            .entry(dependency.to_string())
            .or_insert_with(|| Breaker::new(self.config_for(dependency)))
    }
}
