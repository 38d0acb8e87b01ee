//! Testing utilities and helpers
//!
//! - [`init_test_tracing`]: install a `tracing` subscriber once per process
//! - [`assert_duration_in_range`]: tolerance-based duration assertions
//! - [`FlakyOperation`]: an operation that fails a fixed number of times
//!   before succeeding
//!
//! Time-dependent tests should run on a paused tokio runtime
//! (`#[tokio::test(start_paused = true)]`) or drive a
//! [`MockClock`](crate::circuit_breaker::MockClock).

// Assertions panic on failure
#![allow(clippy::missing_panics_doc)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::error::RemoteError;

static TRACING: Once = Once::new();

/// Install a test-friendly `fmt` subscriber, honoring `RUST_LOG`
///
/// Safe to call from every test; only the first call has an effect.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
    });
}

/// Assert that `actual` lies within `expected ± tolerance`
pub fn assert_duration_in_range(actual: Duration, expected: Duration, tolerance: Duration) {
    let min = expected.saturating_sub(tolerance);
    let max = expected + tolerance;

    assert!(actual >= min && actual <= max, "Duration {actual:?} not in range [{min:?}, {max:?}]");
}

/// Operation double that fails `failures` times, then succeeds
///
/// Clones share the call counter.
#[derive(Debug, Clone)]
pub struct FlakyOperation {
    failures: u32,
    error: RemoteError,
    calls: Arc<AtomicU32>,
}

impl FlakyOperation {
    pub fn new(failures: u32, error: RemoteError) -> Self {
        Self { failures, error, calls: Arc::new(AtomicU32::new(0)) }
    }

    /// Run one attempt, returning the 1-based call number on success
    pub async fn call(&self) -> Result<u32, RemoteError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            Err(self.error.clone())
        } else {
            Ok(call)
        }
    }

    /// Number of attempts so far
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assert_duration_in_range() {
        assert_duration_in_range(
            Duration::from_millis(105),
            Duration::from_millis(100),
            Duration::from_millis(10),
        );
    }

    #[test]
    #[should_panic(expected = "not in range")]
    fn test_assert_duration_out_of_range() {
        assert_duration_in_range(
            Duration::from_millis(150),
            Duration::from_millis(100),
            Duration::from_millis(10),
        );
    }

    #[test]
    fn test_init_test_tracing_is_idempotent() {
        init_test_tracing();
        init_test_tracing();
    }

    #[tokio::test]
    async fn test_flaky_operation() {
        let op = FlakyOperation::new(2, RemoteError::http(503, "unavailable"));

        assert!(op.call().await.is_err());
        assert!(op.clone().call().await.is_err());
        assert_eq!(op.call().await.unwrap(), 3);
        assert_eq!(op.calls(), 3);
    }
}
