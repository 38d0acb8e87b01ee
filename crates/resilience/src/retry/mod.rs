//! Bounded retry with exponential backoff
//!
//! A [`RetryConfig`] is created per call site and describes the retry
//! budget and the backoff curve. Whether a given failure is retried is
//! decided by a [`RetryPolicy`]; the default policy,
//! [`policies::ClassifiedRetry`], retries the categories listed in
//! [`RetryConfig::retryable_categories`] plus the two transient client
//! statuses `408 Request Timeout` and `409 Conflict`.
//!
//! The retry budget is enforced by the executor, never by the policy: a
//! policy is only consulted while retries remain, so a custom predicate can
//! stop early but cannot extend the budget.
//!
//! ```rust
//! # #[cfg(feature = "runtime")]
//! # async fn example() -> Result<(), steadfast_resilience::RemoteError> {
//! use std::time::Duration;
//!
//! use steadfast_resilience::retry::{retry_with_backoff, RetryConfig};
//! use steadfast_resilience::RemoteError;
//!
//! let config = RetryConfig::builder()
//!     .max_retries(3)
//!     .initial_delay(Duration::from_millis(200))
//!     .build()
//!     .map_err(|e| RemoteError::new(e.to_string()))?;
//!
//! let rows = retry_with_backoff(|| async { Ok::<_, RemoteError>(vec![1, 2, 3]) }, config).await?;
//! assert_eq!(rows.len(), 3);
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult, ErrorCategory};

#[cfg(feature = "runtime")]
mod executor;

#[cfg(feature = "runtime")]
pub use executor::{retry_with_backoff, RetryExecutor};

/// Client statuses treated as transient despite the `Client` category
pub const TRANSIENT_CLIENT_STATUSES: [u16; 2] = [408, 409];

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Number of retries after the initial attempt (0 = single attempt)
    pub max_retries: u32,
    /// Base delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any computed delay (doubled for rate-limited errors)
    pub max_delay: Duration,
    /// Growth factor applied per attempt
    pub backoff_multiplier: f64,
    /// Categories the default policy retries
    pub retryable_categories: HashSet<ErrorCategory>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
            retryable_categories: ErrorCategory::default_retryable(),
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration with validation
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Create a configuration builder (alias for `new()`)
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(format!(
                "backoff_multiplier must be a finite value >= 1.0 (got {})",
                self.backoff_multiplier
            )));
        }

        if self.max_delay < self.initial_delay {
            return Err(ConfigError::invalid(format!(
                "max_delay ({:?}) cannot be less than initial_delay ({:?})",
                self.max_delay, self.initial_delay
            )));
        }

        Ok(())
    }
}

/// Builder for RetryConfig with fluent API
#[derive(Debug)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl Default for RetryConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryConfigBuilder {
    pub fn new() -> Self {
        Self { config: RetryConfig::default() }
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.config.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.backoff_multiplier = multiplier;
        self
    }

    /// Replace the set of categories the default policy retries
    pub fn retryable_categories<I>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = ErrorCategory>,
    {
        self.config.retryable_categories = categories.into_iter().collect();
        self
    }

    pub fn build(self) -> ConfigResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Decides whether a failed attempt should be retried
///
/// Implementations must be pure: the same error and attempt index always
/// yield the same answer, and no side effects are performed. Side effects
/// belong in a [`RetryHook`].
pub trait RetryPolicy<E> {
    /// `attempt` is the 0-based index of the attempt that just failed
    fn should_retry(&self, error: &E, attempt: u32) -> bool;
}

/// Side-effecting hook invoked before each retry sleep
pub trait RetryHook<E> {
    /// `attempt` is the 1-based number of the retry about to happen
    fn on_retry(&self, attempt: u32, error: &E);
}

/// Hook that does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRetryHook;

impl<E> RetryHook<E> for NoopRetryHook {
    fn on_retry(&self, _attempt: u32, _error: &E) {}
}

/// Adapts a closure `Fn(u32, &E)` into a [`RetryHook`]
#[derive(Debug, Clone)]
pub struct FnRetryHook<F> {
    hook: F,
}

impl<F> FnRetryHook<F> {
    pub fn new(hook: F) -> Self {
        Self { hook }
    }
}

impl<F, E> RetryHook<E> for FnRetryHook<F>
where
    F: Fn(u32, &E),
{
    fn on_retry(&self, attempt: u32, error: &E) {
        (self.hook)(attempt, error);
    }
}

/// Pre-defined retry policies for common scenarios
pub mod policies {
    use super::*;
    use crate::error::{classify_error, ClassifyError};

    /// Classification-based policy used when no predicate is supplied
    ///
    /// Retries when the error's category is in the configured set, or when
    /// it is a `Client` error with status 408 or 409.
    #[derive(Debug, Clone)]
    pub struct ClassifiedRetry {
        retryable: HashSet<ErrorCategory>,
    }

    impl ClassifiedRetry {
        pub fn new(retryable: HashSet<ErrorCategory>) -> Self {
            Self { retryable }
        }
    }

    impl Default for ClassifiedRetry {
        fn default() -> Self {
            Self::new(ErrorCategory::default_retryable())
        }
    }

    impl<E> RetryPolicy<E> for ClassifiedRetry
    where
        E: ClassifyError,
    {
        fn should_retry(&self, error: &E, _attempt: u32) -> bool {
            let category = classify_error(error);
            if self.retryable.contains(&category) {
                return true;
            }

            category == ErrorCategory::Client
                && error.status_code().is_some_and(|s| TRANSIENT_CLIENT_STATUSES.contains(&s))
        }
    }

    /// Always retry policy - retries on any error
    #[derive(Debug, Clone)]
    pub struct AlwaysRetry;

    impl<E> RetryPolicy<E> for AlwaysRetry {
        fn should_retry(&self, _error: &E, _attempt: u32) -> bool {
            true
        }
    }

    /// Never retry policy - never retries
    #[derive(Debug, Clone)]
    pub struct NeverRetry;

    impl<E> RetryPolicy<E> for NeverRetry {
        fn should_retry(&self, _error: &E, _attempt: u32) -> bool {
            false
        }
    }

    /// Predicate-based retry policy
    #[derive(Debug)]
    pub struct PredicateRetry<F> {
        predicate: F,
    }

    impl<F> PredicateRetry<F> {
        pub fn new(predicate: F) -> Self {
            Self { predicate }
        }
    }

    impl<F, E> RetryPolicy<E> for PredicateRetry<F>
    where
        F: Fn(&E, u32) -> bool,
    {
        fn should_retry(&self, error: &E, attempt: u32) -> bool {
            (self.predicate)(error, attempt)
        }
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for retry configuration and policies
    //!
    //! The retry loop itself is covered in `executor.rs`.

    use std::sync::atomic::{AtomicU32, Ordering};

    use super::policies::*;
    use super::*;
    use crate::error::RemoteError;

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();

        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_delay, Duration::from_millis(1000));
        assert_eq!(config.max_delay, Duration::from_millis(30_000));
        assert_eq!(config.backoff_multiplier, 2.0);
        assert_eq!(config.retryable_categories, ErrorCategory::default_retryable());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_config_validation() {
        let mut config = RetryConfig::default();

        config.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        config.backoff_multiplier = f64::NAN;
        assert!(config.validate().is_err());

        config.backoff_multiplier = 1.0;
        assert!(config.validate().is_ok());

        config.max_delay = Duration::from_millis(10);
        assert!(config.validate().is_err());
    }

    /// Tests builder pattern for retry configuration
    #[test]
    fn test_retry_config_builder() {
        let config = RetryConfig::new()
            .max_retries(5)
            .initial_delay(Duration::from_millis(200))
            .max_delay(Duration::from_secs(10))
            .backoff_multiplier(3.0)
            .retryable_categories([ErrorCategory::Server])
            .build()
            .expect("Builder should create valid config");

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.initial_delay, Duration::from_millis(200));
        assert_eq!(config.max_delay, Duration::from_secs(10));
        assert_eq!(config.backoff_multiplier, 3.0);
        assert_eq!(config.retryable_categories.len(), 1);
    }

    #[test]
    fn test_retry_config_builder_allows_zero_retries() {
        let config = RetryConfig::builder().max_retries(0).build().unwrap();
        assert_eq!(config.max_retries, 0);
    }

    #[test]
    fn test_classified_retry_transient_categories() {
        let policy = ClassifiedRetry::default();

        assert!(policy.should_retry(&RemoteError::new("socket hang up"), 0));
        assert!(policy.should_retry(&RemoteError::http(500, "boom"), 0));
        assert!(policy.should_retry(&RemoteError::http(429, "slow down"), 0));
        assert!(!policy.should_retry(&RemoteError::new("mystery"), 0));
    }

    /// 408 and 409 are retried even though they classify as `Client`.
    #[test]
    fn test_classified_retry_client_exceptions() {
        let policy = ClassifiedRetry::default();

        assert!(policy.should_retry(&RemoteError::http(408, "request expired"), 0));
        assert!(policy.should_retry(&RemoteError::http(409, "conflict"), 0));
        assert!(!policy.should_retry(&RemoteError::http(400, "bad request"), 0));
        assert!(!policy.should_retry(&RemoteError::http(404, "not found"), 0));
    }

    #[test]
    fn test_classified_retry_custom_categories() {
        let policy = ClassifiedRetry::new([ErrorCategory::Server].into_iter().collect());

        assert!(policy.should_retry(&RemoteError::http(503, "unavailable"), 0));
        assert!(!policy.should_retry(&RemoteError::http(429, "slow down"), 0));
        assert!(policy.should_retry(&RemoteError::http(409, "conflict"), 0));
    }

    #[test]
    fn test_always_and_never_retry_policies() {
        let error = "error".to_string();
        assert!(AlwaysRetry.should_retry(&error, 0));
        assert!(AlwaysRetry.should_retry(&error, 100));
        assert!(!NeverRetry.should_retry(&error, 0));
    }

    #[test]
    fn test_predicate_retry_policy() {
        let policy = PredicateRetry::new(|error: &String, attempt: u32| {
            error.contains("retry") && attempt < 2
        });

        assert!(policy.should_retry(&"retryable".to_string(), 0));
        assert!(!policy.should_retry(&"retryable".to_string(), 2));
        assert!(!policy.should_retry(&"fatal".to_string(), 0));
    }

    #[test]
    fn test_fn_retry_hook() {
        let calls = AtomicU32::new(0);
        let hook = FnRetryHook::new(|attempt: u32, _error: &String| {
            calls.fetch_add(attempt, Ordering::SeqCst);
        });

        hook.on_retry(1, &"e".to_string());
        hook.on_retry(2, &"e".to_string());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
