//! Bounded remote calls: a per-attempt timeout plus exponential backoff for
//! transient failures.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use driftwood_common::{Error, Result};

/// Upper bound for the backoff exponent.
const MAX_DOUBLINGS: u32 = 16;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubled for each one after.
    pub initial_delay: Duration,
    /// Cap for the backoff delay.
    pub max_delay: Duration,
    /// Bound on a single attempt. An attempt that runs out counts as a
    /// network failure.
    pub request_timeout: Option<Duration>,
    /// Spread delays by +/- 25%.
    pub jitter: bool,
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            request_timeout: None,
            jitter: true,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_request_timeout(mut self, limit: Duration) -> Self {
        self.request_timeout = Some(limit);
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `retry` (zero based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.min(MAX_DOUBLINGS);
        let delay = self.initial_delay.saturating_mul(factor).min(self.max_delay);

        if self.jitter {
            delay.mul_f64(0.75 + rand::random::<f64>() * 0.5)
        } else {
            delay
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Runs remote calls under a [`RetryConfig`].
///
/// Only transient errors (`Error::Network`, timeouts included) are retried.
/// Rejections, authorization failures and version mismatches return at once.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` until it succeeds, fails permanently, or retries are
    /// used up. Returns the latest error.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;

        loop {
            let err = match self.attempt(operation()).await {
                Ok(value) => {
                    if retries > 0 {
                        debug!("Remote call succeeded after {} retries", retries);
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => err,
            };

            if retries >= self.config.max_retries {
                warn!("Remote call gave up after {} attempts: {}", retries + 1, err);
                return Err(err);
            }

            let delay = self.config.backoff(retries);
            retries += 1;
            debug!("Remote call failed ({}); retry {} in {:?}", err, retries, delay);
            sleep(delay).await;
        }
    }

    async fn attempt<Fut, T>(&self, call: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        match self.config.request_timeout {
            Some(limit) => timeout(limit, call).await.unwrap_or_else(|_| {
                Err(Error::Network(format!("request timed out after {:?}", limit)))
            }),
            None => call.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick(max_retries: u32) -> RetryExecutor {
        RetryExecutor::new(
            RetryConfig::new(max_retries)
                .with_initial_delay(Duration::from_millis(1))
                .without_jitter(),
        )
    }

    #[test]
    fn test_backoff_doubles() {
        let config = RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(100))
            .without_jitter();

        assert_eq!(config.backoff(0), Duration::from_millis(100));
        assert_eq!(config.backoff(1), Duration::from_millis(200));
        assert_eq!(config.backoff(2), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig::new(50)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
            .without_jitter();

        assert_eq!(config.backoff(5), Duration::from_secs(10));
        assert_eq!(config.backoff(40), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_band() {
        let config = RetryConfig::new(3).with_initial_delay(Duration::from_millis(1000));

        for _ in 0..50 {
            let delay = config.backoff(0);
            assert!(delay >= Duration::from_millis(750));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[tokio::test]
    async fn test_network_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<&str> = quick(3)
            .execute(|| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::Network("connection reset".to_string()))
                    } else {
                        Ok("stored")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "stored");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = quick(3)
            .execute(|| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::RemoteRejected("weight must be positive".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::RemoteRejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_with_last_error() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = quick(2)
            .execute(|| {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Network(format!("attempt {}", n)))
                }
            })
            .await;

        match result {
            Err(Error::Network(message)) => assert_eq!(message, "attempt 2"),
            other => panic!("expected a network error, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_slow_attempt_times_out() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(
            RetryConfig::new(1)
                .with_initial_delay(Duration::from_millis(1))
                .with_request_timeout(Duration::from_millis(20))
                .without_jitter(),
        );

        let result: Result<()> = executor
            .execute(|| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
            })
            .await;

        assert!(matches!(result, Err(Error::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
