use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::Result;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Fixed retry budget with a linearly growing pause: after failed attempt
/// `n` the policy sleeps `n * base_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Runs `op` until it succeeds or the budget is spent. The last error is
    /// returned as a value once every attempt failed.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    warn!(
                        event = "retry.attempt_failed",
                        label,
                        attempt,
                        max_attempts,
                        error = %e,
                        "retry.attempt_failed"
                    );
                    if attempt >= max_attempts {
                        return Err(e);
                    }
                    tokio::time::sleep(self.delay_after(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    use super::*;
    use crate::Error;

    #[test]
    fn delay_grows_linearly() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1000));
        assert_eq!(policy.delay_after(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_after(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_after(3), Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn always_failing_op_is_attempted_exactly_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(20));

        let started = Instant::now();
        let res: Result<()> = policy
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(Error::Transport {
                        message: "boom".to_string(),
                    })
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let err = res.unwrap_err();
        assert!(err.to_string().contains("boom"));
        // 1 * 20ms + 2 * 20ms; no sleep after the last attempt.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(60), "elapsed={elapsed:?}");
        assert!(elapsed < Duration::from_millis(1000), "elapsed={elapsed:?}");
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let res = policy
            .run("test", |attempt| async move {
                if attempt < 3 {
                    Err(Error::Transport {
                        message: format!("attempt {attempt}"),
                    })
                } else {
                    Ok(attempt)
                }
            })
            .await
            .unwrap();
        assert_eq!(res, 3);
    }

    #[tokio::test]
    async fn zero_budget_still_tries_once() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(0, Duration::from_millis(1));
        let _ = policy
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::Cancelled) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
