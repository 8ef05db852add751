//! Backoff policies and a cancellable retry loop.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Policy for retrying a failed operation.
#[derive(Debug, Clone)]
pub enum RetryPolicy {
    /// A single attempt.
    None,

    /// Fixed delay between retries.
    Fixed {
        /// Maximum number of retry attempts.
        max_attempts: u32,
        /// Delay between attempts.
        delay: Duration,
    },

    /// Exponential backoff between retries.
    Exponential {
        /// Maximum number of retry attempts.
        max_attempts: u32,
        /// Initial delay (doubles each attempt).
        initial_delay: Duration,
        /// Maximum delay cap.
        max_delay: Duration,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::None
    }
}

impl RetryPolicy {
    /// Exponential backoff starting at 200ms, capped at 10s.
    pub fn exponential(max_attempts: u32) -> Self {
        Self::Exponential {
            max_attempts,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }

    /// Create a fixed delay policy.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::Fixed { max_attempts, delay }
    }

    /// Calculate the delay for a given attempt number (1-indexed).
    ///
    /// Returns `None` if max attempts exceeded.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Fixed { max_attempts, delay } => {
                if attempt <= *max_attempts {
                    Some(*delay)
                } else {
                    None
                }
            }
            Self::Exponential {
                max_attempts,
                initial_delay,
                max_delay,
            } => {
                if attempt <= *max_attempts {
                    // 2^(attempt-1) * initial_delay, capped at max_delay
                    let multiplier = 2u64.saturating_pow(attempt.saturating_sub(1));
                    let delay_ms = (initial_delay.as_millis() as u64).saturating_mul(multiplier);
                    let delay = Duration::from_millis(delay_ms.min(max_delay.as_millis() as u64));
                    Some(delay)
                } else {
                    None
                }
            }
        }
    }

    /// Like [`delay_for_attempt`](Self::delay_for_attempt), scaled by a
    /// random factor in `[0.5, 1.0]` so concurrent retries spread out.
    pub fn jittered_delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        self.delay_for_attempt(attempt).map(|delay| {
            let factor = rand::thread_rng().gen_range(0.5..=1.0);
            delay.mul_f64(factor)
        })
    }

    /// Returns the maximum number of attempts allowed.
    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Fixed { max_attempts, .. } => *max_attempts,
            Self::Exponential { max_attempts, .. } => *max_attempts,
        }
    }
}

/// Why [`retry_with_backoff`] gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed, or the next wait would overrun the budget.
    Exhausted { attempts: u32, last: E },
    /// Cancellation fired while waiting between attempts.
    Canceled,
}

/// Run `op` until it succeeds, following `policy` between failures.
///
/// `policy.max_attempts()` counts every call of `op`; at least one call is
/// always made. No wait may push the total elapsed time past `budget`.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    budget: Duration,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let started = Instant::now();
    let max_attempts = policy.max_attempts().max(1);
    let mut attempt = 1;

    loop {
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let delay = if attempt < max_attempts {
            policy.jittered_delay_for_attempt(attempt)
        } else {
            None
        };
        let within_budget = delay.map(|d| started.elapsed() + d <= budget);

        match (delay, within_budget) {
            (Some(delay), Some(true)) => {
                warn!(attempt, max_attempts, error = %err, delay_ms = delay.as_millis() as u64, "Attempt failed, backing off");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Canceled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            _ => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_policy() {
        let policy = RetryPolicy::None;
        assert_eq!(policy.delay_for_attempt(1), None);
        assert_eq!(policy.max_attempts(), 0);
    }

    #[test]
    fn test_fixed_policy() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(1), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay_for_attempt(3), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay_for_attempt(4), None);
    }

    #[test]
    fn test_exponential_policy() {
        let policy = RetryPolicy::Exponential {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        };

        assert_eq!(policy.delay_for_attempt(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for_attempt(2), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_for_attempt(4), Some(Duration::from_secs(8)));
        assert_eq!(policy.delay_for_attempt(6), None);
    }

    #[test]
    fn test_jitter_stays_within_half_to_full_delay() {
        let policy = RetryPolicy::exponential(5);
        for attempt in 1..=5 {
            let base = policy.delay_for_attempt(attempt).unwrap();
            let jittered = policy.jittered_delay_for_attempt(attempt).unwrap();
            assert!(jittered <= base);
            assert!(jittered >= base / 2);
        }
        assert_eq!(policy.jittered_delay_for_attempt(6), None);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));
        let result: Result<u32, RetryError<String>> = retry_with_backoff(
            &policy,
            Duration::from_secs(5),
            &CancellationToken::new(),
            |attempt| async move {
                if attempt < 3 {
                    Err(format!("attempt {attempt}"))
                } else {
                    Ok(attempt)
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_at_max_attempts() {
        let policy = RetryPolicy::fixed(4, Duration::from_millis(1));
        let result: Result<(), RetryError<&str>> = retry_with_backoff(
            &policy,
            Duration::from_secs(5),
            &CancellationToken::new(),
            |_| async { Err("down") },
        )
        .await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 4);
                assert_eq!(last, "down");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_respects_budget() {
        let policy = RetryPolicy::fixed(10, Duration::from_millis(40));
        let result: Result<(), RetryError<&str>> = retry_with_backoff(
            &policy,
            Duration::from_millis(100),
            &CancellationToken::new(),
            |_| async { Err("down") },
        )
        .await;

        // 40ms jittered waits: at most 5 fit in 100ms, at least 2.
        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert!((3..=6).contains(&attempts)),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_canceled_while_waiting() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let policy = RetryPolicy::fixed(3, Duration::from_secs(60));
        let result: Result<(), RetryError<&str>> =
            retry_with_backoff(&policy, Duration::from_secs(600), &cancel, |_| async {
                Err("down")
            })
            .await;

        assert!(matches!(result, Err(RetryError::Canceled)));
    }
}
