//! Sliding-window rate limiting
//!
//! The limiter keeps the timestamps of admitted requests and admits a new
//! one only while fewer than `max_requests` of them fall inside the trailing
//! `window`. Callers that find the window full are suspended until the
//! oldest timestamp ages out, then re-check before being admitted, so no
//! `window`-length interval ever contains more than `max_requests`
//! admissions even when many callers contend for the same limiter.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::circuit_breaker::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult};

/// Configuration for the sliding-window rate limiter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Maximum admissions inside any window
    pub max_requests: usize,
    /// Length of the trailing window
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self { max_requests: 10, window: Duration::from_secs(60) }
    }
}

impl RateLimiterConfig {
    /// Create a new configuration builder
    pub fn builder() -> RateLimiterConfigBuilder {
        RateLimiterConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_requests == 0 {
            return Err(ConfigError::invalid("max_requests must be greater than 0"));
        }
        if self.window.is_zero() {
            return Err(ConfigError::invalid("window must be greater than zero"));
        }
        Ok(())
    }
}

/// Builder for RateLimiterConfig
#[derive(Debug)]
pub struct RateLimiterConfigBuilder {
    config: RateLimiterConfig,
}

impl Default for RateLimiterConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiterConfigBuilder {
    pub fn new() -> Self {
        Self { config: RateLimiterConfig::default() }
    }

    pub fn max_requests(mut self, max_requests: usize) -> Self {
        self.config.max_requests = max_requests;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.config.window = window;
        self
    }

    pub fn build(self) -> ConfigResult<RateLimiterConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// A rate-limit wait was cancelled before a slot became free
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Rate limiter wait cancelled")]
pub struct WaitCancelled;

/// Sliding-window rate limiter
///
/// Clones share the same window. The suspending waits exist only for
/// [`SystemClock`]: they sleep on tokio's timer, and `SystemClock` reads
/// tokio time, including on a paused test runtime.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
///
/// use steadfast_resilience::rate_limiter::{RateLimiter, RateLimiterConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config =
///     RateLimiterConfig::builder().max_requests(5).window(Duration::from_secs(1)).build()?;
/// let limiter = RateLimiter::new(config)?;
///
/// limiter.wait_if_needed().await;
/// // ... call the dependency
/// # Ok(())
/// # }
/// ```
pub struct RateLimiter<C: Clock = SystemClock> {
    config: RateLimiterConfig,
    requests: Arc<Mutex<VecDeque<Instant>>>,
    clock: Arc<C>,
}

impl<C: Clock> Clone for RateLimiter<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            requests: Arc::clone(&self.requests),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<C: Clock> std::fmt::Debug for RateLimiter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("current_count", &self.requests.lock().len())
            .finish()
    }
}

impl RateLimiter<SystemClock> {
    /// Create a new rate limiter using the system clock
    pub fn new(config: RateLimiterConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }

    /// Suspend until a slot is free, then record the admission
    #[instrument(skip_all, fields(max_requests = self.config.max_requests))]
    pub async fn wait_if_needed(&self) {
        while let Err(wait) = self.admit() {
            Self::log_wait(wait);
            tokio::time::sleep(wait).await;
        }
    }

    /// Like [`wait_if_needed`](Self::wait_if_needed), but gives up when
    /// `token` is cancelled
    ///
    /// A cancelled wait records nothing.
    #[instrument(skip_all, fields(max_requests = self.config.max_requests))]
    pub async fn wait_if_needed_with_cancellation(
        &self,
        token: &CancellationToken,
    ) -> Result<(), WaitCancelled> {
        loop {
            if token.is_cancelled() {
                return Err(WaitCancelled);
            }

            let wait = match self.admit() {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            Self::log_wait(wait);
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Rate limiter wait cancelled");
                    return Err(WaitCancelled);
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

impl Default for RateLimiter<SystemClock> {
    fn default() -> Self {
        Self {
            config: RateLimiterConfig::default(),
            requests: Arc::new(Mutex::new(VecDeque::new())),
            clock: Arc::new(SystemClock),
        }
    }
}

impl<C: Clock> RateLimiter<C> {
    /// Create a rate limiter with a custom clock
    ///
    /// A custom clock supports the non-suspending operations
    /// ([`try_acquire`](Self::try_acquire), [`current_count`](Self::current_count),
    /// [`reset`](Self::reset)). Waiting is only available with [`SystemClock`],
    /// since a clock that does not follow tokio time would never see the
    /// window drain:
    ///
    /// ```compile_fail
    /// use steadfast_resilience::{MockClock, RateLimiter, RateLimiterConfig};
    ///
    /// # async fn example() {
    /// let limiter = RateLimiter::with_clock(RateLimiterConfig::default(), MockClock::new()).unwrap();
    /// limiter.wait_if_needed().await;
    /// # }
    /// ```
    pub fn with_clock(config: RateLimiterConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            requests: Arc::new(Mutex::new(VecDeque::with_capacity(config.max_requests))),
            config,
            clock: Arc::new(clock),
        })
    }

    /// Record an admission if a slot is free, without suspending
    pub fn try_acquire(&self) -> bool {
        self.admit().is_ok()
    }

    /// Number of admissions inside the current window
    pub fn current_count(&self) -> usize {
        let now = self.clock.now();
        let mut requests = self.requests.lock();
        self.prune(&mut requests, now);
        requests.len()
    }

    /// Forget every recorded admission
    pub fn reset(&self) {
        self.requests.lock().clear();
        debug!("Rate limiter reset");
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Admit now, or report how long until the oldest admission leaves the
    /// window
    fn admit(&self) -> Result<(), Duration> {
        let now = self.clock.now();
        let mut requests = self.requests.lock();
        self.prune(&mut requests, now);

        if requests.len() < self.config.max_requests {
            requests.push_back(now);
            return Ok(());
        }

        let oldest = requests.front().copied().unwrap_or(now);
        let wait = self.config.window.saturating_sub(now.saturating_duration_since(oldest));
        // The oldest entry is still inside the window, so the wait is positive
        Err(wait.max(Duration::from_millis(1)))
    }

    /// Drop entries that are no longer strictly inside the window
    fn prune(&self, requests: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&oldest) = requests.front() {
            if now.saturating_duration_since(oldest) >= self.config.window {
                requests.pop_front();
            } else {
                break;
            }
        }
    }

    fn log_wait(wait: Duration) {
        debug!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting for a free slot");
    }
}
