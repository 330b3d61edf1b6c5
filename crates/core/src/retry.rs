//! Retry decision: requeue-with-delay versus terminal.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::job::{ErrorKind, JobError};

/// Outcome of consulting the retry policy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue after the given delay
    Retry(Duration),
    /// Dead-letter the job
    Terminal,
}

/// Retry policy configuration.
///
/// Transient failures back off exponentially:
/// `min(base_delay * 2^(attempts-1), max_delay)` plus jitter in
/// `[0, delay * jitter_ratio]`. Circuit-open rejections use the fixed
/// `circuit_open_delay` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the jitter as a fraction of the delay (0.0-1.0)
    pub jitter_ratio: f64,
    pub circuit_open_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            jitter_ratio: 0.2,
            circuit_open_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with exponential backoff and the default jitter.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            ..Default::default()
        }
    }

    pub fn with_jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio;
        self
    }

    pub fn with_circuit_open_delay(mut self, delay: Duration) -> Self {
        self.circuit_open_delay = delay;
        self
    }

    /// Decide what happens after attempt number `attempts` failed with `error`.
    pub fn decide(&self, attempts: u32, max_attempts: u32, error: &JobError) -> RetryDecision {
        let sample = rand::thread_rng().gen_range(0.0..=1.0);
        self.decide_with_jitter(attempts, max_attempts, error.kind, sample)
    }

    /// Deterministic core of [`RetryPolicy::decide`]; `jitter_sample` is a
    /// uniform draw from `[0, 1]`.
    pub fn decide_with_jitter(
        &self,
        attempts: u32,
        max_attempts: u32,
        kind: ErrorKind,
        jitter_sample: f64,
    ) -> RetryDecision {
        if kind == ErrorKind::Terminal || attempts >= max_attempts {
            return RetryDecision::Terminal;
        }

        if kind == ErrorKind::CircuitOpen {
            return RetryDecision::Retry(self.circuit_open_delay);
        }

        let delay = self.backoff(attempts);
        let ratio = self.jitter_ratio.clamp(0.0, 1.0) * jitter_sample.clamp(0.0, 1.0);
        RetryDecision::Retry(delay + delay.mul_f64(ratio))
    }

    /// Backoff before jitter for a 1-indexed attempt number.
    pub fn backoff(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }

        // 2^31 already dwarfs any sane cap; avoid shifting past it.
        let exp = attempts.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy::exponential(Duration::from_millis(100), Duration::from_secs(10))
            .with_jitter_ratio(0.0)
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = no_jitter();

        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = no_jitter();
        assert_eq!(policy.backoff(20), Duration::from_secs(10));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn terminal_errors_never_retry() {
        let policy = no_jitter();
        let decision = policy.decide(1, 5, &JobError::terminal("malformed payload"));
        assert_eq!(decision, RetryDecision::Terminal);
    }

    #[test]
    fn exhausted_budget_is_terminal_even_for_transient_errors() {
        let policy = no_jitter();
        assert_eq!(
            policy.decide(3, 3, &JobError::transient("timeout")),
            RetryDecision::Terminal
        );
        assert_eq!(
            policy.decide(2, 3, &JobError::transient("timeout")),
            RetryDecision::Retry(Duration::from_millis(200))
        );
    }

    #[test]
    fn circuit_open_uses_fixed_delay() {
        let policy = no_jitter().with_circuit_open_delay(Duration::from_secs(2));
        for attempts in 1..4 {
            assert_eq!(
                policy.decide(attempts, 5, &JobError::circuit_open("scan-browser")),
                RetryDecision::Retry(Duration::from_secs(2))
            );
        }
    }

    #[test]
    fn full_jitter_sample_adds_twenty_percent() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100), Duration::from_secs(10));
        assert_eq!(
            policy.decide_with_jitter(1, 5, ErrorKind::Transient, 1.0),
            RetryDecision::Retry(Duration::from_millis(120))
        );
        assert_eq!(
            policy.decide_with_jitter(1, 5, ErrorKind::Transient, 0.0),
            RetryDecision::Retry(Duration::from_millis(100))
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// A job that has used its whole budget is never retried.
        #[test]
        fn no_retry_past_max_attempts(
            max_attempts in 1u32..20,
            extra in 0u32..5,
            sample in 0.0f64..=1.0,
        ) {
            let policy = RetryPolicy::default();
            for kind in [ErrorKind::Transient, ErrorKind::Terminal, ErrorKind::CircuitOpen] {
                let decision = policy.decide_with_jitter(max_attempts + extra, max_attempts, kind, sample);
                prop_assert_eq!(decision, RetryDecision::Terminal);
            }
        }

        /// Transient delays stay within `[backoff, backoff * (1 + jitter)]`
        /// and never exceed the jittered cap.
        #[test]
        fn transient_delay_is_bounded(
            attempts in 1u32..40,
            sample in 0.0f64..=1.0,
            base_ms in 1u64..5_000,
        ) {
            let policy = RetryPolicy::exponential(Duration::from_millis(base_ms), Duration::from_secs(60));
            let backoff = policy.backoff(attempts);
            match policy.decide_with_jitter(attempts, attempts + 1, ErrorKind::Transient, sample) {
                RetryDecision::Retry(delay) => {
                    prop_assert!(delay >= backoff);
                    prop_assert!(delay <= backoff.mul_f64(1.2) + Duration::from_micros(1));
                    prop_assert!(delay <= Duration::from_secs(72) + Duration::from_micros(1));
                }
                RetryDecision::Terminal => prop_assert!(false, "transient failure within budget must retry"),
            }
        }

        #[test]
        fn backoff_is_monotonic(attempts in 1u32..64) {
            let policy = RetryPolicy::default();
            prop_assert!(policy.backoff(attempts) <= policy.backoff(attempts + 1));
        }
    }
}
