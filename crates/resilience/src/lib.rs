//! Resilience primitives for calls to unreliable remote dependencies.
//!
//! The crate wraps a caller-supplied fallible async operation (the
//! "protected call") in a fixed pipeline:
//!
//! ```text
//! RateLimiter -> CircuitBreaker -> RetryExecutor -> protected call
//! ```
//!
//! Each stage is usable on its own:
//! - [`error`]: error classification into [`ErrorCategory`]
//! - [`backoff`]: exponential backoff with additive jitter
//! - [`retry`]: bounded retry loop driven by classification and backoff
//! - [`circuit_breaker`]: fail-fast guard for unhealthy dependencies
//! - [`rate_limiter`]: sliding-window admission control
//! - [`executor`]: the composed pipeline
//! - [`registry`]: one breaker/limiter pair per named dependency
//!
//! # Feature Tiers
//!
//! - `foundation`: classification, backoff math, configuration types
//! - `runtime` (default): tokio-based executors, breaker, limiter, registry
//! - `observability`: tracing events (implied by `runtime`)
//! - `http`: classification of `reqwest` errors

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

// Foundation tier
// -----------------------------------------------------------------
#[cfg(feature = "foundation")]
pub mod backoff;
#[cfg(feature = "foundation")]
pub mod config;
#[cfg(feature = "foundation")]
pub mod error;
#[cfg(feature = "foundation")]
pub mod retry;
#[cfg(feature = "foundation")]
pub mod utils;

// Runtime tier
// --------------------------------------------------------------------
#[cfg(feature = "runtime")]
pub mod circuit_breaker;
#[cfg(feature = "runtime")]
pub mod executor;
#[cfg(feature = "runtime")]
pub mod rate_limiter;
#[cfg(feature = "runtime")]
pub mod registry;

// Testing utilities
// ---------------------------------------------------------------
#[cfg(any(feature = "test-utils", test))]
pub mod testing;

// Re-export commonly used types and traits for convenience
// ------------------------
#[cfg(feature = "foundation")]
pub use backoff::{compute_backoff_delay, compute_backoff_delay_with};
#[cfg(feature = "runtime")]
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerMetrics,
    CircuitState, Clock, MockClock, SystemClock,
};
#[cfg(feature = "foundation")]
pub use config::{DependencySettings, ResilienceSettings};
#[cfg(feature = "foundation")]
pub use error::{
    classify_error, ClassifyError, ConfigError, ConfigResult, ErrorCategory, RemoteError,
    ResilienceError, ResilienceResult,
};
#[cfg(feature = "runtime")]
pub use executor::{execute_with_resilience, ResilienceExecutor};
#[cfg(feature = "runtime")]
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterConfigBuilder};
#[cfg(feature = "runtime")]
pub use registry::DependencyRegistry;
#[cfg(feature = "foundation")]
pub use retry::{
    policies, FnRetryHook, NoopRetryHook, RetryConfig, RetryConfigBuilder, RetryHook, RetryPolicy,
};
#[cfg(feature = "runtime")]
pub use retry::{retry_with_backoff, RetryExecutor};
#[cfg(feature = "foundation")]
pub use utils::serde::duration_millis;
