//! Async retry loop

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use super::policies::{ClassifiedRetry, PredicateRetry};
use super::{FnRetryHook, NoopRetryHook, RetryConfig, RetryHook, RetryPolicy};
use crate::backoff::compute_backoff_delay;
use crate::error::{classify_error, ClassifyError, ResilienceError, ResilienceResult};

/// Retry executor for async operations
///
/// Runs an operation up to `max_retries + 1` times. Between attempts it
/// sleeps for the backoff delay computed from the failed attempt's index
/// and error category. The first success is returned; otherwise the last
/// error is returned unchanged.
///
/// The policy `P` decides whether a failure is worth retrying, and the hook
/// `H` observes each scheduled retry.
#[derive(Debug, Clone)]
pub struct RetryExecutor<P = ClassifiedRetry, H = NoopRetryHook> {
    config: RetryConfig,
    policy: P,
    hook: H,
}

impl RetryExecutor {
    /// Create an executor using the classification policy from `config`
    pub fn new(config: RetryConfig) -> Self {
        let policy = ClassifiedRetry::new(config.retryable_categories.clone());
        Self { config, policy, hook: NoopRetryHook }
    }

    /// Create an executor with the default configuration
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl<P, H> RetryExecutor<P, H> {
    /// Replace the retry policy
    ///
    /// The budget in [`RetryConfig::max_retries`] still applies.
    pub fn with_policy<Q>(self, policy: Q) -> RetryExecutor<Q, H> {
        RetryExecutor { config: self.config, policy, hook: self.hook }
    }

    /// Replace the retry hook
    pub fn with_hook<K>(self, hook: K) -> RetryExecutor<P, K> {
        RetryExecutor { config: self.config, policy: self.policy, hook }
    }

    /// Use a closure `Fn(&E, attempt) -> bool` as the retry policy
    pub fn should_retry<F>(self, predicate: F) -> RetryExecutor<PredicateRetry<F>, H> {
        self.with_policy(PredicateRetry::new(predicate))
    }

    /// Use a closure `Fn(attempt, &E)` as the retry hook
    pub fn on_retry<F>(self, hook: F) -> RetryExecutor<P, FnRetryHook<F>> {
        self.with_hook(FnRetryHook::new(hook))
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute an operation with retry logic
    ///
    /// The operation is a factory: it is called once per attempt and must
    /// produce a fresh future each time.
    #[instrument(skip_all, fields(max_retries = self.config.max_retries))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ClassifyError,
        P: RetryPolicy<E>,
        H: RetryHook<E>,
    {
        self.run(
            operation,
            |delay| async move {
                tokio::time::sleep(delay).await;
                Ok(())
            },
            |error| error,
        )
        .await
    }

    /// Execute an operation with retry logic, aborting pending sleeps when
    /// `token` is cancelled
    ///
    /// An attempt that is already running is not interrupted; cancellation
    /// takes effect at the next backoff sleep. A token cancelled before the
    /// first attempt returns [`ResilienceError::Cancelled`] without invoking
    /// the operation.
    #[instrument(skip_all, fields(max_retries = self.config.max_retries))]
    pub async fn execute_with_cancellation<F, Fut, T, E>(
        &self,
        operation: F,
        token: &CancellationToken,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ClassifyError + std::error::Error + Send + Sync + 'static,
        P: RetryPolicy<E>,
        H: RetryHook<E>,
    {
        if token.is_cancelled() {
            return Err(ResilienceError::Cancelled);
        }

        self.run(
            operation,
            |delay| async move {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("Retry sleep cancelled");
                        Err(ResilienceError::Cancelled)
                    }
                    _ = tokio::time::sleep(delay) => Ok(()),
                }
            },
            ResilienceError::from,
        )
        .await
    }

    /// Shared retry loop
    ///
    /// `pause` performs the backoff sleep and may abort it with an error of
    /// the output type; `lift` maps a final operation error into that type.
    async fn run<F, Fut, T, E, X, S, SFut>(
        &self,
        mut operation: F,
        mut pause: S,
        lift: impl Fn(E) -> X,
    ) -> Result<T, X>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        S: FnMut(Duration) -> SFut,
        SFut: Future<Output = Result<(), X>>,
        E: ClassifyError,
        P: RetryPolicy<E>,
        H: RetryHook<E>,
    {
        let max_retries = self.config.max_retries;
        let mut attempt: u32 = 0;

        loop {
            let error = match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(attempts = attempt + 1, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let category = classify_error(&error);

            if attempt >= max_retries {
                error!(
                    attempts = attempt + 1,
                    %category,
                    error = %error.message(),
                    "Retry budget exhausted"
                );
                return Err(lift(error));
            }

            if !self.policy.should_retry(&error, attempt) {
                error!(
                    attempts = attempt + 1,
                    %category,
                    error = %error.message(),
                    "Non-retryable error"
                );
                return Err(lift(error));
            }

            let delay = compute_backoff_delay(attempt, &self.config, category);
            self.hook.on_retry(attempt + 1, &error);
            warn!(
                attempt = attempt + 1,
                max_retries,
                delay_ms = delay.as_millis() as u64,
                %category,
                "Retrying operation after failure"
            );

            pause(delay).await?;
            attempt += 1;
        }
    }
}

/// Retry `operation` according to `config` using the classification policy
///
/// Convenience wrapper around [`RetryExecutor::new`] and
/// [`RetryExecutor::execute`].
pub async fn retry_with_backoff<F, Fut, T, E>(operation: F, config: RetryConfig) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: ClassifyError,
{
    RetryExecutor::new(config).execute(operation).await
}
