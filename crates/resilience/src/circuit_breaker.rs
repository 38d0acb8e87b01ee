//! Circuit breaker for unhealthy dependencies
//!
//! The breaker is a three-state machine, initially `Closed`:
//!
//! - **Closed**: calls pass through. Each failure increments the failure
//!   count; a success resets it. Reaching `failure_threshold` opens the
//!   circuit.
//! - **Open**: calls fail fast with [`ResilienceError::CircuitOpen`] and the
//!   operation is never invoked, until more than `open_timeout` has passed
//!   since the last failure. The next call then moves the breaker to
//!   half-open and runs as a probe.
//! - **HalfOpen**: exactly one probe is in flight. Success closes the
//!   circuit and clears the failure count; failure re-opens it.
//!
//! All state lives behind a single mutex. Admission (state check, the
//! Open -> HalfOpen transition, probe reservation) and outcome recording are
//! each one critical section, so concurrent callers sharing a breaker never
//! interleave a check with another caller's transition. The lock is never
//! held while the operation runs.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::{ConfigError, ConfigResult, ResilienceError, ResilienceResult};

//==============================================================================
// Time Abstraction for Testability
//==============================================================================

/// Trait for time operations to enable deterministic testing
///
/// Breakers and rate limiters read time only through this trait, so tests
/// can drive timeout-based behavior without real delays.
pub trait Clock: Send + Sync + 'static {
    /// Get current instant (monotonic time)
    fn now(&self) -> Instant;
}

/// Real clock for production use
///
/// Reads tokio's clock, which is the system monotonic clock unless a test
/// runtime has paused time, in which case virtual time is observed. This
/// keeps timestamps consistent with `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// Implement Clock for Arc<T> where T: Clock for convenient cloning
impl<T: Clock> Clock for Arc<T> {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

/// Mock clock for deterministic testing
///
/// Clones share the same elapsed time, so a test can keep one handle and
/// hand another to the component under test.
#[derive(Debug, Clone)]
pub struct MockClock {
    start: Instant,
    elapsed: Arc<Mutex<Duration>>,
}

impl MockClock {
    /// Create a new mock clock starting at the current instant
    pub fn new() -> Self {
        Self { start: Instant::now(), elapsed: Arc::new(Mutex::new(Duration::ZERO)) }
    }

    /// Advance the mock clock by a duration
    pub fn advance(&self, duration: Duration) {
        *self.elapsed.lock() += duration;
    }

    /// Advance the mock clock by milliseconds (convenience method)
    pub fn advance_millis(&self, millis: u64) {
        self.advance(Duration::from_millis(millis));
    }

    /// Set the mock clock to a specific elapsed time
    pub fn set_elapsed(&self, duration: Duration) {
        *self.elapsed.lock() = duration;
    }

    /// Get the current elapsed time
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed()
    }
}

//==============================================================================
// Configuration
//==============================================================================

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Circuit is half-open, admitting a single probe
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of failures before opening the circuit
    pub failure_threshold: u64,
    /// How long to stay open after the last failure before probing
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, open_timeout: Duration::from_secs(60) }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration with validation
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Create a configuration builder (alias for `new()`)
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold must be greater than 0"));
        }

        Ok(())
    }
}

/// Builder for CircuitBreakerConfig
#[derive(Debug)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl Default for CircuitBreakerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_threshold(mut self, threshold: u64) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.config.open_timeout = timeout;
        self
    }

    /// Set a custom clock for the circuit breaker (useful for testing)
    pub fn clock<C: Clock>(self, clock: C) -> CircuitBreakerBuilderWithClock<C> {
        CircuitBreakerBuilderWithClock { config: self.config, clock }
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Builder with custom clock that builds a CircuitBreaker directly
pub struct CircuitBreakerBuilderWithClock<C: Clock> {
    config: CircuitBreakerConfig,
    clock: C,
}

impl<C: Clock> CircuitBreakerBuilderWithClock<C> {
    pub fn failure_threshold(mut self, threshold: u64) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.config.open_timeout = timeout;
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreaker<C>> {
        CircuitBreaker::with_clock(self.config, self.clock)
    }
}

//==============================================================================
// Circuit Breaker
//==============================================================================

/// Circuit breaker metrics for monitoring
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub failure_count: u64,
    /// Calls that reached the operation
    pub total_calls: u64,
    /// Calls refused without invoking the operation
    pub rejected_calls: u64,
    pub last_failure_time: Option<Instant>,
    pub state_change_time: Instant,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u64,
    last_failure_time: Option<Instant>,
    state_change_time: Instant,
    probe_in_flight: bool,
}

impl BreakerState {
    fn transition(&mut self, to: CircuitState, now: Instant) {
        self.state = to;
        self.state_change_time = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

/// Releases the half-open probe slot if the probe future is dropped before
/// its outcome is recorded.
struct ProbeGuard<'a> {
    inner: &'a Mutex<BreakerState>,
    armed: bool,
}

impl<'a> ProbeGuard<'a> {
    fn new(inner: &'a Mutex<BreakerState>, admission: Admission) -> Self {
        Self { inner, armed: admission == Admission::Probe }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.lock().probe_in_flight = false;
            debug!("Circuit breaker probe abandoned, slot released");
        }
    }
}

/// Circuit breaker guarding one downstream dependency
///
/// Cloning is cheap and clones share state, so one breaker can be handed to
/// every call site of the same dependency.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerState>>,
    total_calls: Arc<AtomicU64>,
    rejected_calls: Arc<AtomicU64>,
    clock: Arc<C>,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &inner.state)
            .field("failure_count", &inner.failure_count)
            .finish()
    }
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            inner: Arc::clone(&self.inner),
            total_calls: Arc::clone(&self.total_calls),
            rejected_calls: Arc::clone(&self.rejected_calls),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a new circuit breaker with the given configuration using system
    /// clock
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }

    /// Create a circuit breaker using the builder pattern
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }
}

impl Default for CircuitBreaker<SystemClock> {
    fn default() -> Self {
        Self::with_valid_config(CircuitBreakerConfig::default(), SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a new circuit breaker with a custom clock (useful for testing)
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::with_valid_config(config, clock))
    }

    fn with_valid_config(config: CircuitBreakerConfig, clock: C) -> Self {
        let now = clock.now();
        Self {
            config,
            inner: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_time: None,
                state_change_time: now,
                probe_in_flight: false,
            })),
            total_calls: Arc::new(AtomicU64::new(0)),
            rejected_calls: Arc::new(AtomicU64::new(0)),
            clock: Arc::new(clock),
        }
    }

    /// Execute an operation with circuit breaker protection
    ///
    /// Returns [`ResilienceError::CircuitOpen`] without invoking `operation`
    /// when the breaker refuses admission; otherwise the operation's own
    /// error is returned in [`ResilienceError::Operation`].
    #[instrument(skip_all, fields(state = %self.get_state()))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.guarded(move || async move { operation().await.map_err(ResilienceError::from) }).await
    }

    /// Admission and outcome recording around an operation that may itself
    /// report resilience errors
    ///
    /// Only [`ResilienceError::Operation`] counts as a dependency failure. A
    /// cancelled or nested circuit-open outcome records nothing and, for a
    /// probe, frees the probe slot.
    pub(crate) async fn guarded<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResilienceResult<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let admission = match self.admit() {
            Ok(admission) => admission,
            Err(retry_after) => {
                self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                debug!(?retry_after, "Circuit breaker rejecting call");
                return Err(ResilienceError::CircuitOpen { retry_after });
            }
        };

        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let mut guard = ProbeGuard::new(&self.inner, admission);

        let result = operation().await;

        match &result {
            Ok(_) => {
                guard.disarm();
                self.record_success(admission);
            }
            Err(ResilienceError::Operation { .. }) => {
                guard.disarm();
                self.record_failure(admission);
            }
            Err(_) => {}
        }

        result
    }

    /// Decide whether a call may proceed
    ///
    /// `Err` carries the remaining open time when it is known.
    fn admit(&self) -> Result<Admission, Option<Duration>> {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let now = self.clock.now();
                let since_failure = inner
                    .last_failure_time
                    .map_or(Duration::MAX, |failed_at| now.saturating_duration_since(failed_at));

                if since_failure > self.config.open_timeout {
                    inner.transition(CircuitState::HalfOpen, now);
                    inner.probe_in_flight = true;
                    info!(
                        failure_count = inner.failure_count,
                        "Circuit breaker half-open, admitting probe"
                    );
                    Ok(Admission::Probe)
                } else {
                    Err(Some(self.config.open_timeout.saturating_sub(since_failure)))
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(None)
                } else {
                    inner.probe_in_flight = true;
                    Ok(Admission::Probe)
                }
            }
        }
    }

    fn record_success(&self, admission: Admission) {
        let mut inner = self.inner.lock();

        match (inner.state, admission) {
            (CircuitState::Closed, _) => {
                inner.failure_count = 0;
            }
            (CircuitState::HalfOpen, Admission::Probe) => {
                let now = self.clock.now();
                inner.transition(CircuitState::Closed, now);
                inner.failure_count = 0;
                inner.probe_in_flight = false;
                info!("Circuit breaker closed after successful probe");
            }
            // A call admitted before the circuit opened finished late; only the
            // probe decides recovery.
            _ => {}
        }
    }

    fn record_failure(&self, admission: Admission) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_time = Some(now);

        match (inner.state, admission) {
            (CircuitState::Closed, _) => {
                if inner.failure_count >= self.config.failure_threshold {
                    inner.transition(CircuitState::Open, now);
                    warn!(
                        failure_count = inner.failure_count,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker opened"
                    );
                }
            }
            (CircuitState::HalfOpen, Admission::Probe) => {
                inner.transition(CircuitState::Open, now);
                inner.probe_in_flight = false;
                warn!(
                    failure_count = inner.failure_count,
                    "Circuit breaker re-opened after failed probe"
                );
            }
            _ => {}
        }
    }

    /// Get the current state of the circuit breaker
    ///
    /// A pure read: an elapsed open timeout is only acted on by the next
    /// `execute` call.
    pub fn get_state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Get the current circuit state (alias for `get_state()`)
    pub fn state(&self) -> CircuitState {
        self.get_state()
    }

    /// Consecutive failures recorded since the last reset or recovery
    pub fn failure_count(&self) -> u64 {
        self.inner.lock().failure_count
    }

    /// Fast check that the circuit is not open
    pub fn is_available(&self) -> bool {
        self.get_state() != CircuitState::Open
    }

    /// The configuration this breaker was built with
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get circuit breaker metrics
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            state: inner.state,
            failure_count: inner.failure_count,
            total_calls: self.total_calls.load(Ordering::Acquire),
            rejected_calls: self.rejected_calls.load(Ordering::Acquire),
            last_failure_time: inner.last_failure_time,
            state_change_time: inner.state_change_time,
        }
    }

    /// Reset the circuit breaker to closed state
    ///
    /// Operational escape hatch; unconditionally clears the failure count
    /// and last failure time.
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.transition(CircuitState::Closed, now);
        inner.failure_count = 0;
        inner.last_failure_time = None;
        inner.probe_in_flight = false;
        info!("Circuit breaker manually reset to closed state");
    }
}
