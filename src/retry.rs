//! Bounded retry with exponential backoff.
//!
//! One policy type is shared by the storage gateway calls and the file exporter. Each
//! attempt can carry its own timeout, and the total number of attempts is capped so a
//! failing collaborator can never stall the caller indefinitely.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Errors that can represent an attempt running past its deadline.
pub trait TimeoutError {
    /// Build the error for an attempt cancelled after `after`.
    fn timed_out(after: Duration) -> Self;
}

/// Retry budget exhausted; carries the last failure.
#[derive(Error, Debug)]
#[error("{operation} failed after {attempts} attempt(s): {last}")]
pub struct RetryExhausted<E: std::fmt::Display + std::fmt::Debug> {
    /// Label of the retried operation.
    pub operation: String,
    /// Attempts made.
    pub attempts: u32,
    /// Error of the final attempt.
    pub last: E,
}

/// Attempt count and backoff schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Factor applied to the delay after every failed attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound on a single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    50
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    1000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_attempts` and no delay between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            backoff_multiplier: 1.0,
            max_delay_ms: 0,
        }
    }

    /// Delays slept between attempts, in order. Yields `max_attempts - 1` items.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let cap = self.max_delay_ms as f64;
        let multiplier = self.backoff_multiplier.max(1.0);
        (0..self.max_attempts.saturating_sub(1)).scan(self.initial_delay_ms as f64, move |delay, _| {
            let current = delay.min(cap);
            *delay = (*delay * multiplier).min(cap);
            Some(Duration::from_millis(current as u64))
        })
    }

    /// Worst-case time spent sleeping between attempts.
    pub fn total_backoff(&self) -> Duration {
        self.delays().sum()
    }

    /// Run `op` until it succeeds or the budget is spent.
    ///
    /// When `attempt_timeout` is set, each attempt is cancelled after that long and
    /// counts as a failure.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &str,
        attempt_timeout: Option<Duration>,
        mut op: F,
    ) -> Result<T, RetryExhausted<E>>
    where
        E: TimeoutError + std::fmt::Display + std::fmt::Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut delays = self.delays();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = match attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, op()).await {
                    Ok(result) => result,
                    Err(_) => Err(E::timed_out(limit)),
                },
                None => op().await,
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if attempt < max_attempts => {
                    let delay = delays.next().unwrap_or_default();
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "Attempt failed, retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(err) => {
                    return Err(RetryExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        last: err,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tracing_test::traced_test;

    #[derive(Debug, PartialEq)]
    enum FakeError {
        Down,
        Slow(Duration),
    }

    impl std::fmt::Display for FakeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl TimeoutError for FakeError {
        fn timed_out(after: Duration) -> Self {
            FakeError::Slow(after)
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 300,
        };
        let delays: Vec<u64> = policy.delays().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 300, 300]);
        assert_eq!(policy.total_backoff(), Duration::from_millis(900));
    }

    #[tokio::test]
    #[traced_test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(3);
        let result = policy
            .run("insert", None, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(FakeError::Down)
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(logs_contain("Attempt failed, retrying"));
    }

    #[tokio::test]
    async fn stops_at_attempt_budget() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(3);
        let result: Result<(), _> = policy
            .run("insert", None, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FakeError::Down)
            })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.last, FakeError::Down);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn slow_attempts_time_out() {
        let policy = RetryPolicy::immediate(2);
        let limit = Duration::from_millis(10);
        let result: Result<(), RetryExhausted<FakeError>> = policy
            .run("insert", Some(limit), || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 2);
        assert_eq!(err.last, FakeError::Slow(limit));
    }
}
