//! Composed resilience pipeline
//!
//! [`ResilienceExecutor`] applies the stages in a fixed order:
//!
//! ```text
//! RateLimiter -> CircuitBreaker -> RetryExecutor -> operation
//! ```
//!
//! Rate limiting comes first, so throttled waits never count against the
//! breaker. The retry loop runs inside a single breaker admission: a breaker
//! rejection is not retried, and an exhausted retry loop counts as one
//! breaker failure. Stages that are not configured are skipped.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{ClassifyError, ResilienceError, ResilienceResult};
use crate::rate_limiter::RateLimiter;
use crate::retry::policies::ClassifiedRetry;
use crate::retry::{NoopRetryHook, RetryConfig, RetryExecutor, RetryHook, RetryPolicy};

/// Executor combining rate limiting, circuit breaking, and retry
///
/// The breaker and limiter are shared handles; clone the same instance into
/// every executor that calls the same dependency.
///
/// # Examples
///
/// ```rust
/// use steadfast_resilience::{
///     CircuitBreaker, CircuitBreakerConfig, RateLimiter, RateLimiterConfig, RemoteError,
///     ResilienceExecutor, RetryConfig,
/// };
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig::default())?;
/// let limiter = RateLimiter::new(RateLimiterConfig::default())?;
///
/// let executor = ResilienceExecutor::new()
///     .with_retry_config(RetryConfig::default())
///     .with_circuit_breaker(breaker.clone())
///     .with_rate_limiter(limiter.clone());
///
/// let value = executor.execute(|| async { Ok::<_, RemoteError>(42) }).await?;
/// assert_eq!(value, 42);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ResilienceExecutor<P = ClassifiedRetry, H = NoopRetryHook> {
    retry: RetryExecutor<P, H>,
    circuit_breaker: Option<CircuitBreaker>,
    rate_limiter: Option<RateLimiter>,
    cancellation: Option<CancellationToken>,
}

impl ResilienceExecutor {
    /// Executor with the default retry configuration and no breaker or
    /// limiter
    pub fn new() -> Self {
        Self {
            retry: RetryExecutor::with_defaults(),
            circuit_breaker: None,
            rate_limiter: None,
            cancellation: None,
        }
    }

    /// Use the classification policy driven by `config`
    pub fn with_retry_config(self, config: RetryConfig) -> Self {
        Self { retry: RetryExecutor::new(config), ..self }
    }
}

impl Default for ResilienceExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl<P, H> ResilienceExecutor<P, H> {
    /// Replace the retry stage, including its policy and hook
    pub fn with_retry<Q, K>(self, retry: RetryExecutor<Q, K>) -> ResilienceExecutor<Q, K> {
        ResilienceExecutor {
            retry,
            circuit_breaker: self.circuit_breaker,
            rate_limiter: self.rate_limiter,
            cancellation: self.cancellation,
        }
    }

    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Abort pending rate-limit waits and retry sleeps when `token` is
    /// cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn retry(&self) -> &RetryExecutor<P, H> {
        &self.retry
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.circuit_breaker.as_ref()
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }

    /// Run `operation` through the configured stages
    ///
    /// Errors are the original operation error, a breaker rejection, or a
    /// cancellation; see [`ResilienceError`].
    #[instrument(
        skip_all,
        fields(
            circuit_breaker = self.circuit_breaker.is_some(),
            rate_limiter = self.rate_limiter.is_some()
        )
    )]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ClassifyError + std::error::Error + Send + Sync + 'static,
        P: RetryPolicy<E>,
        H: RetryHook<E>,
    {
        if let Some(limiter) = &self.rate_limiter {
            match &self.cancellation {
                Some(token) => limiter
                    .wait_if_needed_with_cancellation(token)
                    .await
                    .map_err(|_| ResilienceError::<E>::Cancelled)?,
                None => limiter.wait_if_needed().await,
            }
        }

        match &self.circuit_breaker {
            Some(breaker) => breaker.guarded(|| self.execute_with_retry(operation)).await,
            None => self.execute_with_retry(operation).await,
        }
    }

    async fn execute_with_retry<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ClassifyError + std::error::Error + Send + Sync + 'static,
        P: RetryPolicy<E>,
        H: RetryHook<E>,
    {
        match &self.cancellation {
            Some(token) => self.retry.execute_with_cancellation(operation, token).await,
            None => self.retry.execute(operation).await.map_err(ResilienceError::from),
        }
    }
}

/// Run `operation` through whichever stages are supplied
///
/// A missing `retry_config` means the default [`RetryConfig`]; a missing
/// breaker or limiter skips that stage.
pub async fn execute_with_resilience<F, Fut, T, E>(
    operation: F,
    retry_config: Option<RetryConfig>,
    circuit_breaker: Option<&CircuitBreaker>,
    rate_limiter: Option<&RateLimiter>,
) -> ResilienceResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: ClassifyError + std::error::Error + Send + Sync + 'static,
{
    let mut executor = ResilienceExecutor::new().with_retry_config(retry_config.unwrap_or_default());
    if let Some(breaker) = circuit_breaker {
        executor = executor.with_circuit_breaker(breaker.clone());
    }
    if let Some(limiter) = rate_limiter {
        executor = executor.with_rate_limiter(limiter.clone());
    }

    executor.execute(operation).await
}

#[cfg(test)]
mod tests {
    //! Unit tests for stage composition
    //!
    //! End-to-end scenarios live in `tests/resilience_integration.rs`.

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::error::RemoteError;
    use crate::rate_limiter::RateLimiterConfig;
    use crate::testing::{init_test_tracing, FlakyOperation};

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig::builder()
            .max_retries(max_retries)
            .initial_delay(Duration::from_millis(10))
            .max_delay(Duration::from_millis(50))
            .build()
            .unwrap()
    }

    fn breaker(threshold: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::builder()
                .failure_threshold(threshold)
                .open_timeout(Duration::from_secs(30))
                .build()
                .unwrap(),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_stages_behaves_like_retry() {
        init_test_tracing();
        let op = FlakyOperation::new(2, RemoteError::http(503, "unavailable"));

        let result = execute_with_resilience(|| op.call(), Some(fast_retry(3)), None, None).await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(op.calls(), 3);
    }

    /// One exhausted retry loop is one breaker failure, not one per attempt.
    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_counts_once() {
        let cb = breaker(5);
        let attempts = AtomicU32::new(0);

        let result: ResilienceResult<(), RemoteError> = execute_with_resilience(
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::http(500, "boom"))
            },
            Some(fast_retry(3)),
            Some(&cb),
            None,
        )
        .await;

        assert_eq!(result.unwrap_err().operation_error().and_then(|e| e.status), Some(500));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(cb.failure_count(), 1);
        assert_eq!(cb.get_state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_skips_retry_loop() {
        let cb = breaker(1);
        let executor =
            ResilienceExecutor::new().with_retry_config(fast_retry(3)).with_circuit_breaker(cb.clone());

        let _ = executor.execute(|| async { Err::<(), _>(RemoteError::http(500, "boom")) }).await;
        assert_eq!(cb.get_state(), CircuitState::Open);

        let attempts = AtomicU32::new(0);
        let result = executor
            .execute(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RemoteError>(())
            })
            .await;

        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    /// Rate-limit waits happen before breaker admission.
    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_applied_first() {
        let limiter = RateLimiter::new(
            RateLimiterConfig::builder().max_requests(1).window(Duration::from_secs(10)).build().unwrap(),
        )
        .unwrap();
        let cb = breaker(5);
        let executor = ResilienceExecutor::new()
            .with_retry_config(fast_retry(0))
            .with_circuit_breaker(cb.clone())
            .with_rate_limiter(limiter.clone());

        let start = tokio::time::Instant::now();
        executor.execute(|| async { Ok::<_, RemoteError>(()) }).await.unwrap();
        executor.execute(|| async { Ok::<_, RemoteError>(()) }).await.unwrap();

        assert!(start.elapsed() >= Duration::from_secs(10));
        assert_eq!(cb.metrics().total_calls, 2);
    }

    /// A cancelled retry sleep is not a dependency failure.
    #[tokio::test(start_paused = true)]
    async fn test_cancellation_does_not_trip_breaker() {
        let cb = breaker(1);
        let token = CancellationToken::new();
        let executor = ResilienceExecutor::new()
            .with_retry_config(RetryConfig::default())
            .with_circuit_breaker(cb.clone())
            .with_cancellation(token.clone());

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let result: ResilienceResult<(), RemoteError> =
            executor.execute(|| async { Err(RemoteError::http(502, "bad gateway")) }).await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(cb.get_state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_rate_limit_wait() {
        let token = CancellationToken::new();
        token.cancel();
        let limiter = RateLimiter::new(RateLimiterConfig::default()).unwrap();
        let executor = ResilienceExecutor::new().with_rate_limiter(limiter.clone()).with_cancellation(token);

        let result = executor.execute(|| async { Ok::<_, RemoteError>(()) }).await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(limiter.current_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_retry_stage() {
        let retries = AtomicU32::new(0);
        let executor = ResilienceExecutor::new().with_retry(
            RetryExecutor::new(fast_retry(2))
                .should_retry(|error: &RemoteError, _: u32| error.status == Some(418))
                .on_retry(|_: u32, _: &RemoteError| {
                    retries.fetch_add(1, Ordering::SeqCst);
                }),
        );

        let result: ResilienceResult<(), RemoteError> =
            executor.execute(|| async { Err(RemoteError::http(418, "teapot")) }).await;

        assert!(result.is_err());
        assert_eq!(retries.load(Ordering::SeqCst), 2);
    }
}
