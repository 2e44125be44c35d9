//! Resilient boundary request execution
//!
//! Every network operation (transcription, completion, synthesis) runs
//! through [`RequestClient::execute`], which classifies failures, retries
//! the retryable ones with capped exponential backoff plus jitter, and
//! keeps advisory per-operation counters.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

use crate::{Error, Result};

/// Retry configuration for one class of boundary requests.
///
/// Stateless; not mutated at runtime. Callers that need degraded fallback
/// parameters on the last attempt react to [`Attempt::is_final`] instead.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub base_delay_ms: u64,

    /// Cap on the inter-attempt delay
    pub max_delay_ms: u64,

    /// Multiplier applied per attempt
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based), jittered.
    ///
    /// `min(base * factor^(attempt-1) + jitter, max)` where jitter is up to
    /// 10% of the un-capped delay, so the sequence is monotonically
    /// non-decreasing up to the cap.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64;
        let delay = base * self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        let jitter = rand::thread_rng().gen_range(0.0..=0.1) * delay;
        let capped = (delay + jitter).min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Context handed to the operation closure on each try
#[derive(Debug, Clone, Copy)]
pub struct Attempt {
    /// 1-based attempt number
    pub number: u32,

    /// Total attempts the policy allows
    pub of: u32,
}

impl Attempt {
    /// True on the last chance. Operations with a cheaper or more
    /// compatible fallback configuration (e.g. degraded synthesis voice
    /// quality) switch to it when this is set, rather than failing
    /// outright.
    #[must_use]
    pub const fn is_final(self) -> bool {
        self.number >= self.of
    }
}

/// Whether a failure is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts, connection resets, 5xx, rate limits
    Retryable,
    /// Auth and validation failures; retry cannot change the outcome
    Fatal,
}

/// Classify an error for retry purposes
#[must_use]
pub fn classify(error: &Error) -> ErrorClass {
    match error {
        Error::Timeout(_) => ErrorClass::Retryable,
        Error::Api { status, .. } => {
            if status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                ErrorClass::Retryable
            } else {
                ErrorClass::Fatal
            }
        }
        Error::Http(e) => match e.status() {
            Some(status) if status.is_client_error()
                && status != reqwest::StatusCode::TOO_MANY_REQUESTS =>
            {
                ErrorClass::Fatal
            }
            _ => ErrorClass::Retryable,
        },
        // Boundary-level failures without structured status (empty bodies,
        // malformed payloads from overloaded upstreams) are retried
        Error::Stt(_) | Error::Tts(_) | Error::Completion(_) => ErrorClass::Retryable,
        Error::Config(_)
        | Error::Audio(_)
        | Error::Microphone(_)
        | Error::Io(_)
        | Error::Serialization(_)
        | Error::Toml(_) => ErrorClass::Fatal,
    }
}

/// Advisory counters for one operation name.
///
/// Observability only; nothing reads these to make control-flow decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCounters {
    /// Tries started
    pub attempts: u64,
    /// Tries after the first
    pub retries: u64,
    /// Failures that were deadline expiries
    pub timeouts: u64,
    /// Failures that were connect/reset-level network errors
    pub network_errors: u64,
}

/// Executes boundary operations with bounded retry
#[derive(Debug, Default)]
pub struct RequestClient {
    counters: Mutex<HashMap<&'static str, OpCounters>>,
}

impl RequestClient {
    /// Create a new client
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` under `policy`, retrying retryable failures.
    ///
    /// The closure receives the [`Attempt`] context so it can degrade its
    /// parameters on the final try.
    ///
    /// # Errors
    ///
    /// Returns the last error once attempts are exhausted, or immediately
    /// for a non-retryable failure.
    pub async fn execute<T, F, Fut>(
        &self,
        operation_name: &'static str,
        policy: &RetryPolicy,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = policy.max_attempts.max(1);

        for number in 1..=max_attempts {
            let attempt = Attempt {
                number,
                of: max_attempts,
            };
            self.record(operation_name, |c| {
                c.attempts += 1;
                if number > 1 {
                    c.retries += 1;
                }
            });

            match operation(attempt).await {
                Ok(value) => {
                    if number > 1 {
                        tracing::debug!(
                            operation = operation_name,
                            attempt = number,
                            "succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(error) => {
                    self.record(operation_name, |c| match &error {
                        Error::Timeout(_) => c.timeouts += 1,
                        Error::Http(e) if e.is_timeout() => c.timeouts += 1,
                        Error::Http(e) if e.is_connect() => c.network_errors += 1,
                        _ => {}
                    });

                    if classify(&error) == ErrorClass::Fatal {
                        tracing::warn!(
                            operation = operation_name,
                            attempt = number,
                            error = %error,
                            "non-retryable failure"
                        );
                        return Err(error);
                    }

                    if number >= max_attempts {
                        tracing::warn!(
                            operation = operation_name,
                            attempts = max_attempts,
                            error = %error,
                            "giving up"
                        );
                        return Err(error);
                    }

                    let delay = policy.delay_for(number);
                    tracing::debug!(
                        operation = operation_name,
                        attempt = number,
                        delay = ?delay,
                        error = %error,
                        "retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        unreachable!("retry loop returns on final attempt")
    }

    /// Snapshot the counters for one operation name
    #[must_use]
    pub fn counters(&self, operation_name: &str) -> OpCounters {
        self.counters
            .lock()
            .map(|map| map.get(operation_name).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    fn record(&self, operation_name: &'static str, update: impl FnOnce(&mut OpCounters)) {
        if let Ok(mut map) = self.counters.lock() {
            update(map.entry(operation_name).or_default());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            backoff_factor: 2.0,
        }
    }

    #[tokio::test]
    async fn test_permanent_failure_exhausts_attempts() {
        let client = RequestClient::new();
        let calls = AtomicU32::new(0);

        let result: Result<()> = client
            .execute("op", &fast_policy(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Timeout(Duration::from_secs(1))) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let counters = client.counters("op");
        assert_eq!(counters.attempts, 3);
        assert_eq!(counters.retries, 2);
        assert_eq!(counters.timeouts, 3);
    }

    #[tokio::test]
    async fn test_fatal_failure_not_retried() {
        let client = RequestClient::new();
        let calls = AtomicU32::new(0);

        let result: Result<()> = client
            .execute("op", &fast_policy(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Config("bad".to_string())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_after_retry() {
        let client = RequestClient::new();
        let calls = AtomicU32::new(0);

        let result = client
            .execute("op", &fast_policy(), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 1 {
                        Err(Error::Stt("transient".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_final_attempt_flagged() {
        let client = RequestClient::new();
        let finals = AtomicU32::new(0);

        let _: Result<()> = client
            .execute("op", &fast_policy(), |attempt| {
                if attempt.is_final() {
                    finals.fetch_add(1, Ordering::SeqCst);
                }
                async { Err(Error::Tts("down".to_string())) }
            })
            .await;

        assert_eq!(finals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delays_non_decreasing_up_to_cap() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay_ms: 100,
            max_delay_ms: 1000,
            backoff_factor: 2.0,
        };

        let mut previous = Duration::ZERO;
        for attempt in 1..6 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= previous, "delay shrank at attempt {attempt}");
            assert!(delay <= Duration::from_millis(1000));
            previous = delay;
        }
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            classify(&Error::Timeout(Duration::from_secs(30))),
            ErrorClass::Retryable
        );
        assert_eq!(
            classify(&Error::Api {
                service: "stt",
                status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                message: String::new(),
            }),
            ErrorClass::Retryable
        );
        assert_eq!(
            classify(&Error::Api {
                service: "stt",
                status: reqwest::StatusCode::TOO_MANY_REQUESTS,
                message: String::new(),
            }),
            ErrorClass::Retryable
        );
        assert_eq!(
            classify(&Error::Api {
                service: "tts",
                status: reqwest::StatusCode::UNAUTHORIZED,
                message: String::new(),
            }),
            ErrorClass::Fatal
        );
        assert_eq!(
            classify(&Error::Config("x".to_string())),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn test_counters_are_isolated_per_operation() {
        let client = RequestClient::new();
        client.record("a", |c| c.attempts += 1);
        assert_eq!(client.counters("a").attempts, 1);
        assert_eq!(client.counters("b"), OpCounters::default());
    }
}
