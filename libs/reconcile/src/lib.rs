//! Reconciliation loop primitives.
//!
//! Helpers shared by everything that mutates a versioned record without a
//! lock:
//!
//! - **Conflict retry**: read-modify-write attempts are repeated when the
//!   store reports a version conflict, up to a fixed budget.
//! - **Failure streaks**: periodic loops escalate log severity once the same
//!   failure repeats, without ever stopping.
//!
//! # Invariants
//!
//! - Retries are bounded; exhausting the budget is an error, never a hang
//! - Only conflicts are retried; every other error aborts immediately
//! - Each attempt re-reads state, so a retry never reuses a stale version

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// Default reconciliation interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of attempts for a conflicting read-modify-write.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default base backoff between conflicting attempts.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(25);

/// Number of consecutive failures logged as warnings before escalating.
pub const DEFAULT_ESCALATE_AFTER: u32 = 3;

/// Errors that can tell whether they represent a write conflict.
pub trait Conflicting {
    /// Returns true if the operation lost an optimistic-concurrency race and
    /// may succeed on a fresh read.
    fn is_conflict(&self) -> bool;
}

/// Outcome of a failed retry loop.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt hit a conflict.
    #[error("gave up after {attempts} conflicting attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// An attempt failed with a non-conflict error.
    #[error("{0}")]
    Aborted(E),
}

impl<E> RetryError<E> {
    /// Returns the error from the final attempt.
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::Aborted(e) => e,
        }
    }

    /// Returns true if the retry budget was used up by conflicts.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// Bounded retry policy for optimistic read-modify-write loops.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,

    /// Base backoff; attempt `n` sleeps `backoff * n` before retrying.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// A policy that retries immediately. Useful in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Duration::ZERO,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

/// Run `attempt` until it succeeds, fails with a non-conflict error, or the
/// policy's attempt budget is spent.
///
/// The closure receives the 1-based attempt number and must re-read whatever
/// state it modifies.
pub async fn retry_on_conflict<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut attempt: F,
) -> Result<T, RetryError<E>>
where
    E: Conflicting,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut n = 1;

    loop {
        match attempt(n).await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_conflict() => return Err(RetryError::Aborted(e)),
            Err(e) if n >= max_attempts => {
                return Err(RetryError::Exhausted {
                    attempts: n,
                    last: e,
                })
            }
            Err(_) => {
                let delay = policy.delay_for(n);
                debug!(
                    attempt = n,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Write conflict, retrying with fresh read"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                n += 1;
            }
        }
    }
}

/// Tracks consecutive failures of a periodic task.
#[derive(Debug, Clone)]
pub struct FailureStreak {
    consecutive: u32,
    escalate_after: u32,
}

impl Default for FailureStreak {
    fn default() -> Self {
        Self::new(DEFAULT_ESCALATE_AFTER)
    }
}

impl FailureStreak {
    /// Create a tracker that escalates after `escalate_after` failures.
    pub fn new(escalate_after: u32) -> Self {
        Self {
            consecutive: 0,
            escalate_after,
        }
    }

    /// Record a failure.
    ///
    /// Returns true once the streak is long enough to escalate.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive > self.escalate_after
    }

    /// Record a success, resetting the streak.
    ///
    /// Returns the length of the streak that just ended.
    pub fn record_success(&mut self) -> u32 {
        std::mem::take(&mut self.consecutive)
    }

    /// Current number of consecutive failures.
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Conflict,
        Fatal,
    }

    impl Conflicting for TestError {
        fn is_conflict(&self) -> bool {
            matches!(self, TestError::Conflict)
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_conflicts() {
        let calls = AtomicU32::new(0);
        let result = retry_on_conflict(&RetryPolicy::immediate(5), |n| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err(TestError::Conflict)
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_on_conflict(&RetryPolicy::immediate(4), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError::Conflict) }
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.is_exhausted());
        assert!(matches!(err, RetryError::Exhausted { attempts: 4, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_non_conflict_aborts_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_on_conflict(&RetryPolicy::immediate(5), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError::Fatal) }
        })
        .await;

        assert_eq!(result.unwrap_err().into_inner(), TestError::Fatal);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let result = retry_on_conflict(&RetryPolicy::immediate(0), |n| async move {
            Ok::<_, TestError>(n)
        })
        .await;
        assert_eq!(result.unwrap(), 1);
    }

    #[test]
    fn test_failure_streak() {
        let mut streak = FailureStreak::new(3);

        assert!(!streak.record_failure()); // 1st
        assert!(!streak.record_failure()); // 2nd
        assert!(!streak.record_failure()); // 3rd
        assert!(streak.record_failure()); // 4th - escalate

        assert_eq!(streak.record_success(), 4);
        assert_eq!(streak.consecutive(), 0);
        assert!(!streak.record_failure());
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(policy.delay_for(2), DEFAULT_BACKOFF * 2);
    }
}
