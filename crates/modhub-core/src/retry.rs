//! Backoff policy for Consul reads and watch reconnects.

use crate::error::{RegistryError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Doubling backoff between `base_delay` and `max_delay`.
///
/// With jitter enabled a delay is drawn uniformly from the upper half of the
/// nominal value, so retries spread out without ever collapsing to zero.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per call, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay after the `failures`-th consecutive failure (0-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let nominal = self
            .base_delay
            .checked_mul(1u32 << failures.min(20))
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        if !self.jitter || nominal.is_zero() {
            return nominal;
        }
        let half = nominal / 2;
        let spread = rand::rng().random_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(spread)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable
    /// [`RegistryError`], or runs out of attempts.
    pub async fn run<F, Fut, T>(&self, what: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut failures = 0u32;
        let mut waited = Duration::ZERO;

        loop {
            let err: RegistryError = match operation().await {
                Ok(value) => {
                    if failures > 0 {
                        debug!(
                            "{} succeeded after {} attempts ({:?} backoff)",
                            what,
                            failures + 1,
                            waited
                        );
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            failures += 1;
            if !err.is_retryable() || failures >= self.max_attempts {
                if failures > 1 {
                    warn!(
                        "{} failed after {} attempts ({:?} backoff): {}",
                        what, failures, waited, err
                    );
                }
                return Err(err);
            }

            let delay = self.delay_for(failures - 1);
            debug!(
                "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                what, failures, self.max_attempts, err, delay
            );
            tokio::time::sleep(delay).await;
            waited += delay;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fixed(attempts: u32) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(attempts)
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(350))
            .with_jitter(false)
    }

    #[test]
    fn test_delay_doubles_then_caps() {
        let config = fixed(3);
        assert_eq!(config.delay_for(0), Duration::from_millis(100));
        assert_eq!(config.delay_for(1), Duration::from_millis(200));
        assert_eq!(config.delay_for(2), Duration::from_millis(350));
        assert_eq!(config.delay_for(u32::MAX), Duration::from_millis(350));
    }

    #[test]
    fn test_jittered_delay_in_upper_half() {
        let config = fixed(3).with_jitter(true);
        for _ in 0..50 {
            let delay = config.delay_for(1);
            assert!(delay >= Duration::from_millis(100) && delay <= Duration::from_millis(200));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_errors_are_retried() {
        let calls = &AtomicU32::new(0);
        let result = fixed(3)
            .run("read", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RegistryError::store("agent unavailable"))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_exhausted() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = fixed(2)
            .run("read", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RegistryError::store("connection refused"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_errors_fail_immediately() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = fixed(3)
            .run("read", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RegistryError::Config {
                    message: "bad".into(),
                })
            })
            .await;

        assert!(matches!(result, Err(RegistryError::Config { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
