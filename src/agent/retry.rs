//! Reliability wrapper for delegated subprocess agents.
//!
//! Failures are classified as retryable (timeouts, allow-listed exit codes,
//! transient error text) or terminal. Retryable failures are re-attempted
//! after an exponential, jittered delay. The delay schedule is a pure function
//! so it can be tested without timers.

use crate::errors::InvokeError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Retry parameters for one delegated agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt (total attempts = 1 + max_retries)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each subsequent retry
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    /// Uniform perturbation of each delay, as a fraction of it (0.0 to 1.0)
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
    /// Exit codes that indicate a transient failure
    #[serde(default)]
    pub retryable_exit_codes: Vec<i32>,
    /// Case-insensitive substrings of error output that indicate a transient failure
    #[serde(default = "default_retryable_patterns")]
    pub retryable_patterns: Vec<String>,
}

fn default_max_retries() -> u32 {
    2
}

fn default_base_backoff_ms() -> u64 {
    1000
}

fn default_jitter_fraction() -> f64 {
    0.2
}

fn default_retryable_patterns() -> Vec<String> {
    [
        "connection reset",
        "connection refused",
        "temporarily unavailable",
        "rate limit",
        "network is unreachable",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            jitter_fraction: default_jitter_fraction(),
            retryable_exit_codes: Vec::new(),
            retryable_patterns: default_retryable_patterns(),
        }
    }
}

/// How a failed attempt should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Retryable,
    Terminal,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Decide whether a failed attempt is worth repeating.
    pub fn classify(&self, error: &InvokeError) -> Classification {
        match error {
            InvokeError::TimedOut { .. } => Classification::Retryable,
            InvokeError::SpawnFailed { .. } | InvokeError::MissingCommand(_) => {
                Classification::Terminal
            }
            _ if error
                .exit_code()
                .is_some_and(|code| self.retryable_exit_codes.contains(&code)) =>
            {
                Classification::Retryable
            }
            other => {
                let text = other.to_string().to_lowercase();
                if self
                    .retryable_patterns
                    .iter()
                    .any(|p| !p.is_empty() && text.contains(&p.to_lowercase()))
                {
                    Classification::Retryable
                } else {
                    Classification::Terminal
                }
            }
        }
    }

    /// Delay before retry `retry` (1-based), drawing jitter from `rng`.
    pub fn delay_for_retry<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let sample = rng.gen_range(-1.0..=1.0);
        backoff_delay(self.base_backoff(), retry, self.jitter_fraction, sample)
    }
}

/// `base * 2^(retry-1)`, scaled by `1 + jitter_fraction * sample`.
///
/// `sample` is a uniform draw from [-1.0, 1.0]; retry 0 means the initial
/// attempt and never waits.
pub fn backoff_delay(base: Duration, retry: u32, jitter_fraction: f64, sample: f64) -> Duration {
    if retry == 0 {
        return Duration::ZERO;
    }
    let exponent = (retry - 1).min(31);
    let nominal = base.as_secs_f64() * f64::from(1u32 << exponent);
    let jitter = jitter_fraction.clamp(0.0, 1.0) * sample.clamp(-1.0, 1.0);
    Duration::try_from_secs_f64((nominal * (1.0 + jitter)).max(0.0)).unwrap_or(Duration::MAX)
}

/// Result of running an operation under a retry policy.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Last result (success, terminal failure, or failure after exhausting retries)
    pub result: Result<T, InvokeError>,
    /// Attempts made, including the initial one
    pub attempts: u32,
    /// Errors from attempts that were retried
    pub retried_errors: Vec<String>,
}

/// Run `operation` until it succeeds, fails terminally, or exhausts `policy`.
///
/// The operation receives the 1-based attempt number.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    agent: &str,
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, InvokeError>>,
{
    let max_attempts = policy.max_attempts();
    let mut retried_errors = Vec::new();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let result = operation(attempt).await;

        let error = match result {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                    retried_errors,
                };
            }
            Err(e) => e,
        };

        let retryable = policy.classify(&error) == Classification::Retryable;
        if !retryable || attempt >= max_attempts {
            tracing::warn!(
                agent,
                attempt,
                retryable,
                error = %error,
                "agent attempt failed, giving up"
            );
            return RetryOutcome {
                result: Err(error),
                attempts: attempt,
                retried_errors,
            };
        }

        let delay = policy.delay_for_retry(attempt, &mut rand::thread_rng());
        tracing::info!(
            agent,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retryable agent failure, backing off"
        );
        retried_errors.push(error.to_string());
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn exit(code: i32, stderr: &str) -> InvokeError {
        InvokeError::NonZeroExit {
            code,
            stderr: stderr.to_string(),
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_backoff_ms: 0,
            jitter_fraction: 0.0,
            retryable_exit_codes: vec![75],
            retryable_patterns: vec!["connection reset".into()],
        }
    }

    #[test]
    fn test_backoff_doubles_per_retry() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0, 0.0, 0.0), Duration::ZERO);
        assert_eq!(backoff_delay(base, 1, 0.0, 0.0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2, 0.0, 0.0), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 3, 0.0, 0.0), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let base = Duration::from_secs(1);
        let low = backoff_delay(base, 1, 0.25, -1.0);
        let high = backoff_delay(base, 1, 0.25, 1.0);
        assert_eq!(low, Duration::from_millis(750));
        assert_eq!(high, Duration::from_millis(1250));
    }

    #[test]
    fn test_backoff_clamps_out_of_range_inputs() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1, 5.0, -1.0), Duration::ZERO);
        assert_eq!(backoff_delay(base, 1, 0.5, 9.0), Duration::from_millis(1500));
    }

    #[test]
    fn test_backoff_saturates_instead_of_overflowing() {
        let huge = Duration::from_millis(u64::MAX / 2);
        assert_eq!(backoff_delay(huge, 33, 0.0, 0.0), Duration::MAX);
        assert_eq!(backoff_delay(huge, 33, 1.0, 1.0), Duration::MAX);
    }

    #[test]
    fn test_delay_for_retry_stays_within_jitter_band() {
        let policy = RetryPolicy {
            base_backoff_ms: 1000,
            jitter_fraction: 0.2,
            ..Default::default()
        };
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let d = policy.delay_for_retry(2, &mut rng);
            assert!(d >= Duration::from_millis(1600) && d <= Duration::from_millis(2400));
        }
    }

    #[test]
    fn test_classify_exit_codes_and_patterns() {
        let policy = fast_policy(2);
        assert_eq!(policy.classify(&exit(75, "")), Classification::Retryable);
        assert_eq!(policy.classify(&exit(1, "boom")), Classification::Terminal);
        assert_eq!(
            policy.classify(&exit(1, "Connection Reset by peer")),
            Classification::Retryable
        );
        assert_eq!(
            policy.classify(&InvokeError::TimedOut { secs: 1 }),
            Classification::Retryable
        );
        assert_eq!(
            policy.classify(&InvokeError::MissingCommand("a".into())),
            Classification::Terminal
        );
    }

    #[test]
    fn test_default_policy_values() {
        let policy: RetryPolicy = toml::from_str("").unwrap();
        assert_eq!(policy, RetryPolicy::default());
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(RetryPolicy::no_retry().max_attempts(), 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_attempted_max_retries_plus_one() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome: RetryOutcome<()> = run_with_retry(&fast_policy(2), "flaky", |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(exit(75, "busy"))
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.retried_errors.len(), 2);
        assert!(outcome.result.is_err());
    }

    #[tokio::test]
    async fn test_terminal_failure_is_not_retried() {
        let outcome: RetryOutcome<()> =
            run_with_retry(&fast_policy(5), "broken", |_| async { Err(exit(2, "bad input")) })
                .await;
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.retried_errors.is_empty());
    }

    #[tokio::test]
    async fn test_success_after_transient_failure() {
        let outcome = run_with_retry(&fast_policy(3), "eventually", |attempt| async move {
            if attempt < 2 {
                Err(exit(75, ""))
            } else {
                Ok(attempt)
            }
        })
        .await;
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.result.unwrap(), 2);
    }
}
