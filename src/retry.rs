//! Bounded retry with exponential backoff

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Adds up to 25% random delay so parallel sessions don't retry in lockstep.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::translation()
    }
}

impl RetryPolicy {
    /// A single retry, as used for model calls.
    pub fn translation() -> Self {
        Self {
            max_retries: 1,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::translation()
        }
    }

    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let base_ms = (self.initial_delay.as_millis() as f64)
            * self.backoff_multiplier.powi(attempt as i32);
        let mut delay_ms = base_ms.min(self.max_delay.as_millis() as f64);
        if self.jitter && delay_ms > 0.0 {
            delay_ms += rand::thread_rng().gen_range(0.0..=delay_ms * 0.25);
        }
        Duration::from_millis(delay_ms as u64)
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent. The last error is returned unchanged.
    pub async fn retry_with_backoff<F, Fut, T, E>(
        &self,
        mut operation: F,
        is_retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_retries && is_retryable(&e) => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(attempt = attempt + 1, ?delay, error = %e, "Retrying after transient failure");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            jitter: false,
            ..RetryPolicy::translation()
        }
    }

    #[tokio::test]
    async fn test_single_retry_then_success() {
        let attempts = Arc::new(Mutex::new(0));
        let counter = attempts.clone();

        let result = fast()
            .retry_with_backoff(
                move || {
                    let counter = counter.clone();
                    async move {
                        let mut count = counter.lock().unwrap();
                        *count += 1;
                        if *count < 2 {
                            Err::<u32, _>("temporary".to_string())
                        } else {
                            Ok(7)
                        }
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(*attempts.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_budget_exhausted_returns_last_error() {
        let attempts = Arc::new(Mutex::new(0));
        let counter = attempts.clone();

        let result = fast()
            .retry_with_backoff(
                move || {
                    let counter = counter.clone();
                    async move {
                        *counter.lock().unwrap() += 1;
                        Err::<(), _>("still down".to_string())
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result, Err("still down".to_string()));
        assert_eq!(*attempts.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let attempts = Arc::new(Mutex::new(0));
        let counter = attempts.clone();

        let result = fast()
            .retry_with_backoff(
                move || {
                    let counter = counter.clone();
                    async move {
                        *counter.lock().unwrap() += 1;
                        Err::<(), _>("bad credentials".to_string())
                    }
                },
                |_| false,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(*attempts.lock().unwrap(), 1);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            backoff_multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(300));
    }
}
