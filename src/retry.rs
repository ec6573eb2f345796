//! Retry engine: bounded/unbounded exponential backoff with jitter.
//!
//! Every outbound call in the daemon (Consul API, Terraform subprocess
//! supervision) goes through [`Retry::run`]. The engine retries any
//! error except the classified fatal kinds (see [`crate::errors`]),
//! sleeping `2^n` seconds plus uniform jitter in `[0, 2^n)` between
//! attempts, capped at `max_wait` (default 15 minutes).
//!
//! A test mode clamps every wait to 1 nanosecond so the same loop is
//! exercised by tests without wall-clock cost.

use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{is_non_retryable, BoxError, RetryExhaustedError};

/// Default number of retries after the initial attempt.
pub const DEFAULT_MAX_ATTEMPTS: i64 = 8;

/// Ceiling on any single backoff wait.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(15 * 60);

/// `max_attempts` value meaning "retry forever".
pub const UNBOUNDED: i64 = -1;

// ── Policy ────────────────────────────────────────────────────────────────────

/// Governs a retry loop: attempt bound, jitter seed, wait ceiling.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt. `-1` means unbounded.
    pub max_attempts: i64,
    /// Seed for the jitter PRNG; fixed seeds give reproducible waits.
    pub seed: u64,
    /// Cap applied to every computed wait. Must be > 0.
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            seed: rand::thread_rng().next_u64(),
            max_wait: DEFAULT_MAX_WAIT,
        }
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// Backoff executor. Owns nothing beyond its PRNG; shareable across
/// calls on one subsystem.
#[derive(Debug)]
pub struct Retry {
    policy: RetryPolicy,
    rng: Mutex<StdRng>,
    test_mode: bool,
}

impl Retry {
    pub fn new(policy: RetryPolicy) -> Self {
        let rng = Mutex::new(StdRng::seed_from_u64(policy.seed));
        Self {
            policy,
            rng,
            test_mode: false,
        }
    }

    /// Engine with the given attempt bound and defaults for the rest.
    pub fn with_max_attempts(max_attempts: i64) -> Self {
        Self::new(RetryPolicy {
            max_attempts,
            ..RetryPolicy::default()
        })
    }

    /// Engine whose waits are clamped to 1 ns. Same code path as the
    /// real engine, so tests exercise the sleep/cancel branches too.
    pub fn test_retry(max_attempts: i64) -> Self {
        let mut r = Self::with_max_attempts(max_attempts);
        r.test_mode = true;
        r
    }

    pub fn max_attempts(&self) -> i64 {
        self.policy.max_attempts
    }

    /// Invokes `op` until it succeeds, returns a fatal error, exhausts
    /// the attempt bound, or `cancel` fires.
    ///
    /// The returned error is a [`RetryExhaustedError`] composite with
    /// one line per failed attempt and the last underlying error as its
    /// source, so kind downcasts keep working through it.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
        description: &str,
    ) -> Result<T, BoxError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, BoxError>>,
    {
        let mut attempt_lines: Vec<String> = Vec::new();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                attempt_lines.push(format!("'{}' cancelled", description));
                return Err(self.exhausted(description, attempt_lines, None));
            }

            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if is_non_retryable(err.as_ref()) {
                debug!(
                    operation = description,
                    error = %err,
                    "Non-retryable error, not retrying"
                );
                attempt_lines.push(err.to_string());
                return Err(self.exhausted(description, attempt_lines, Some(err)));
            }

            if attempt == 0 {
                attempt_lines.push(err.to_string());
            } else {
                attempt_lines.push(format!("retry attempt #{}: {}", attempt, err));
            }

            // attempt counts completed invocations; the bound is on retries.
            if self.policy.max_attempts != UNBOUNDED && i64::from(attempt) >= self.policy.max_attempts
            {
                return Err(self.exhausted(description, attempt_lines, Some(err)));
            }

            let wait = self.wait_time(attempt);
            warn!(
                operation = description,
                attempt = attempt + 1,
                wait_ms = wait.as_millis() as u64,
                error = %err,
                "Retrying after error"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    attempt_lines.push(format!("'{}' cancelled while waiting to retry", description));
                    return Err(self.exhausted(description, attempt_lines, Some(err)));
                }
                _ = sleep(wait) => {}
            }

            attempt += 1;
        }
    }

    fn exhausted(
        &self,
        description: &str,
        attempts: Vec<String>,
        source: Option<BoxError>,
    ) -> BoxError {
        Box::new(RetryExhaustedError {
            description: description.to_string(),
            attempts,
            source,
        })
    }

    /// Wait before retry number `attempt + 1`: `2^attempt` seconds plus
    /// uniform jitter in `[0, 2^attempt)` seconds, capped at `max_wait`.
    fn wait_time(&self, attempt: u32) -> Duration {
        if self.test_mode {
            return Duration::from_nanos(1);
        }

        // Saturate the shift well before u64 overflow; the cap applies anyway.
        let base_secs = 1u64 << attempt.min(32);
        let base = Duration::from_secs(base_secs);
        if base >= self.policy.max_wait {
            return self.policy.max_wait;
        }

        let jitter_nanos = {
            let mut rng = self.rng.lock().unwrap();
            rng.gen_range(0..base.as_nanos().max(1) as u64)
        };
        let wait = base + Duration::from_nanos(jitter_nanos);
        wait.min(self.policy.max_wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use thiserror::Error;

    use crate::errors::NonRetryableError;

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    fn engine(max_attempts: i64) -> Retry {
        Retry::test_retry(max_attempts)
    }

    #[test]
    fn wait_time_within_expected_bounds() {
        let retry = Retry::new(RetryPolicy {
            max_attempts: 3,
            seed: 7,
            max_wait: DEFAULT_MAX_WAIT,
        });
        for attempt in 0..8u32 {
            let base = Duration::from_secs(1 << attempt);
            let wait = retry.wait_time(attempt);
            assert!(wait >= base, "attempt {}: {:?} < base {:?}", attempt, wait, base);
            assert!(
                wait < base * 2,
                "attempt {}: {:?} >= 2x base {:?}",
                attempt,
                wait,
                base
            );
        }
    }

    #[test]
    fn wait_time_monotonic_until_cap_then_exactly_cap() {
        let max_wait = Duration::from_secs(64);
        let retry = Retry::new(RetryPolicy {
            max_attempts: 3,
            seed: 42,
            max_wait,
        });
        // Lower bound (2^n) is non-decreasing, so expectation is too.
        let mut prev_base = Duration::ZERO;
        for attempt in 0..12u32 {
            let base = Duration::from_secs(1u64 << attempt.min(32));
            assert!(base >= prev_base);
            prev_base = base;

            let wait = retry.wait_time(attempt);
            if base >= max_wait {
                assert_eq!(wait, max_wait, "attempt {} should be exactly the cap", attempt);
            } else {
                assert!(wait <= max_wait);
            }
        }
    }

    #[test]
    fn identical_seeds_produce_identical_waits() {
        let policy = RetryPolicy {
            max_attempts: 3,
            seed: 1234,
            max_wait: DEFAULT_MAX_WAIT,
        };
        let a = Retry::new(policy.clone());
        let b = Retry::new(policy);
        for attempt in 0..6u32 {
            assert_eq!(a.wait_time(attempt), b.wait_time(attempt));
        }
    }

    #[tokio::test]
    async fn success_returns_immediately() {
        let retry = engine(3);
        let calls = AtomicUsize::new(0);
        let result: Result<u32, BoxError> = retry
            .run(
                &CancellationToken::new(),
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(7) }
                },
                "succeeding op",
            )
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_retryable_called_exactly_once() {
        let retry = engine(5);
        let calls = AtomicUsize::new(0);
        let result: Result<(), BoxError> = retry
            .run(
                &CancellationToken::new(),
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        Err(Box::new(NonRetryableError::new(Box::new(Boom))) as BoxError)
                    }
                },
                "fatal op",
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Cause preserved through the composite.
        assert!(crate::errors::is_non_retryable(result.unwrap_err().as_ref()));
    }

    #[tokio::test]
    async fn bounded_attempts_exhaust() {
        let retry = engine(2);
        let calls = AtomicUsize::new(0);
        let result: Result<(), BoxError> = retry
            .run(
                &CancellationToken::new(),
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(Box::new(Boom) as BoxError) }
                },
                "always failing",
            )
            .await;
        let err = result.unwrap_err();
        // Initial + 2 retries.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let text = err.to_string();
        assert!(text.contains("retry attempt #1"), "missing #1 in: {}", text);
        assert!(text.contains("retry attempt #2"), "missing #2 in: {}", text);
    }

    #[tokio::test]
    async fn zero_max_attempts_means_single_invocation() {
        let retry = engine(0);
        let calls = AtomicUsize::new(0);
        let result: Result<(), BoxError> = retry
            .run(
                &CancellationToken::new(),
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(Box::new(Boom) as BoxError) }
                },
                "no retries",
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_a_never_succeeding_op() {
        // Real (non-test-mode) waits so the loop parks in the sleep; the
        // token fires during the first backoff.
        let retry = Retry::new(RetryPolicy {
            max_attempts: UNBOUNDED,
            seed: 99,
            max_wait: DEFAULT_MAX_WAIT,
        });
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let start = tokio::time::Instant::now();
        let result: Result<(), BoxError> = retry
            .run(
                &token,
                || async { Err(Box::new(Boom) as BoxError) },
                "unbounded failing",
            )
            .await;
        let err = result.unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(5));
        let text = err.to_string();
        assert!(text.contains("cancelled"), "missing cancellation in: {}", text);
        assert!(text.contains("boom"), "missing attempt error in: {}", text);
    }

    #[tokio::test]
    async fn unbounded_retries_until_success() {
        let retry = engine(UNBOUNDED);
        let calls = AtomicUsize::new(0);
        let result: Result<u32, BoxError> = retry
            .run(
                &CancellationToken::new(),
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 20 {
                            Err(Box::new(Boom) as BoxError)
                        } else {
                            Ok(1)
                        }
                    }
                },
                "eventually succeeding",
            )
            .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 21);
    }
}
