//! Bounded exponential-backoff retry for transient provider faults.
//!
//! Retries are bounded three ways: attempt count, total wall-clock budget,
//! and a cutoff when the next computed delay would itself overshoot the
//! remaining budget. In every termination case the last underlying error is
//! surfaced, never swallowed. Non-transient errors propagate immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::debug;

use crate::errors::GatewayError;

/// Upper bound on any single backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Retry configuration for one class of gateway call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Total wall-clock budget across all attempts and delays.
    pub max_duration: Duration,
    /// Base delay when the provider signalled rate limiting.
    pub rate_limit_delay: Duration,
    /// Base delay for other transient faults.
    pub transient_delay: Duration,
    /// Whether to add random jitter in `[0, 1s)` to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            max_duration: Duration::from_secs(300),
            rate_limit_delay: Duration::from_secs(10),
            transient_delay: Duration::from_secs(1),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Tight policy for preflight reachability probes.
    pub fn preflight() -> Self {
        Self {
            max_retries: 3,
            max_duration: Duration::from_secs(60),
            ..Default::default()
        }
    }

    /// Policy for reviewer calls within a round.
    pub fn review() -> Self {
        Self {
            max_retries: 3,
            max_duration: Duration::from_secs(300),
            ..Default::default()
        }
    }

    /// Backoff before retry `n` (1-indexed): `min(base * 2^(n-1), 60s)`
    /// plus jitter.
    pub fn delay_for_retry(&self, n: u32, rate_limited: bool) -> Duration {
        let base = if rate_limited {
            self.rate_limit_delay
        } else {
            self.transient_delay
        };
        let exp = base.saturating_mul(2u32.saturating_pow(n.saturating_sub(1)));
        let capped = exp.min(MAX_BACKOFF);
        if self.jitter {
            capped + Duration::from_millis(rand::thread_rng().gen_range(0..1000))
        } else {
            capped
        }
    }

    /// Run `op`, retrying transient faults per [`GatewayError::is_transient`].
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        self.execute_when(op, GatewayError::is_transient).await
    }

    /// Run `op` with a custom transience predicate.
    pub async fn execute_when<T, F, Fut, P>(
        &self,
        mut op: F,
        is_transient: P,
    ) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
        P: Fn(&GatewayError) -> bool,
    {
        let start = Instant::now();
        let mut retries = 0u32;

        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !is_transient(&err) {
                return Err(err);
            }
            if retries >= self.max_retries {
                debug!(retries, "retry budget exhausted");
                return Err(err);
            }
            let elapsed = start.elapsed();
            if elapsed >= self.max_duration {
                debug!(?elapsed, "retry time budget exhausted");
                return Err(err);
            }

            retries += 1;
            let delay = self.delay_for_retry(retries, err.is_rate_limited());
            if elapsed + delay > self.max_duration {
                debug!(?delay, "next delay would overshoot time budget");
                return Err(err);
            }

            debug!(retry = retries, ?delay, error = %err, "retrying transient fault");
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter(policy: RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            jitter: false,
            ..policy
        }
    }

    #[test]
    fn backoff_doubles_and_caps_at_sixty_seconds() {
        let policy = no_jitter(RetryPolicy::default());
        assert_eq!(policy.delay_for_retry(1, false), Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(2, false), Duration::from_secs(2));
        assert_eq!(policy.delay_for_retry(3, false), Duration::from_secs(4));
        assert_eq!(policy.delay_for_retry(10, false), Duration::from_secs(60));
    }

    #[test]
    fn rate_limit_uses_larger_base_delay() {
        let policy = no_jitter(RetryPolicy::default());
        assert_eq!(policy.delay_for_retry(1, true), Duration::from_secs(10));
        assert_eq!(policy.delay_for_retry(2, true), Duration::from_secs(20));
        assert_eq!(policy.delay_for_retry(3, true), Duration::from_secs(40));
        assert_eq!(policy.delay_for_retry(4, true), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_under_one_second() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let delay = policy.delay_for_retry(1, false);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay < Duration::from_secs(2));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_fifth_attempt_after_four_rate_limits() {
        let policy = no_jitter(RetryPolicy::default());
        let attempts = AtomicU32::new(0);

        let result = policy
            .execute(|| {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 5 {
                        Err(GatewayError::RateLimited)
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_last_error() {
        let policy = no_jitter(RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::default()
        });
        let attempts = AtomicU32::new(0);

        let result: Result<(), _> = policy
            .execute(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(GatewayError::Timeout) }
            })
            .await;

        assert!(matches!(result, Err(GatewayError::Timeout)));
        // Initial attempt plus two retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_error_propagates_immediately() {
        let policy = no_jitter(RetryPolicy::default());
        let attempts = AtomicU32::new(0);

        let result: Result<(), _> = policy
            .execute(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(GatewayError::Http { status: 401 }) }
            })
            .await;

        assert!(matches!(result, Err(GatewayError::Http { status: 401 })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_next_delay_overshoots_time_budget() {
        // Rate-limit backoff starts at 10s; a 5s budget can never fit it.
        let policy = no_jitter(RetryPolicy {
            max_duration: Duration::from_secs(5),
            ..RetryPolicy::default()
        });
        let attempts = AtomicU32::new(0);

        let result: Result<(), _> = policy
            .execute(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Err(GatewayError::RateLimited)
                }
            })
            .await;

        assert!(matches!(result, Err(GatewayError::RateLimited)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_predicate_overrides_classification() {
        let policy = no_jitter(RetryPolicy::default());
        let attempts = AtomicU32::new(0);

        // Treat nothing as transient: even a rate limit fails fast.
        let result: Result<(), _> = policy
            .execute_when(
                || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err(GatewayError::RateLimited) }
                },
                |_| false,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
