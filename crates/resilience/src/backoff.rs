//! Backoff delay computation
//!
//! ```text
//! exponential = initial_delay * backoff_multiplier ^ attempt
//! jitter      = U[0, 0.3) * exponential
//! delay       = min(exponential + jitter, max_delay)
//! ```
//!
//! Jitter is strictly additive so a retry never lands earlier than the
//! exponential curve. When the triggering error is
//! [`ErrorCategory::RateLimited`] the base term becomes
//! `initial_delay * 10 * (attempt + 1)` and the cap doubles to
//! `2 * max_delay`. The rate-limited term is recomputed from `attempt` on
//! every hit; there is no separate cool-down tracked across calls.
//!
//! Delays are rounded to the nearest millisecond and are at least 1ms
//! whenever `initial_delay` is non-zero.

use std::time::Duration;

use rand::Rng;

use crate::error::ErrorCategory;
use crate::retry::RetryConfig;

/// Upper bound (exclusive) of the jitter fraction
pub const MAX_JITTER_FRACTION: f64 = 0.3;

/// Base-delay inflation applied to rate-limited errors
pub const RATE_LIMIT_DELAY_FACTOR: f64 = 10.0;

/// Compute the delay before retrying after attempt `attempt` (0-based)
///
/// `category` is the classification of the error that triggered the retry.
pub fn compute_backoff_delay(
    attempt: u32,
    config: &RetryConfig,
    category: ErrorCategory,
) -> Duration {
    let jitter_fraction = rand::thread_rng().gen_range(0.0..MAX_JITTER_FRACTION);
    compute_backoff_delay_with(attempt, config, category, jitter_fraction)
}

/// Deterministic form of [`compute_backoff_delay`] with an explicit jitter
/// fraction, clamped to `[0, MAX_JITTER_FRACTION]`
pub fn compute_backoff_delay_with(
    attempt: u32,
    config: &RetryConfig,
    category: ErrorCategory,
    jitter_fraction: f64,
) -> Duration {
    let fraction =
        if jitter_fraction.is_nan() { 0.0 } else { jitter_fraction.clamp(0.0, MAX_JITTER_FRACTION) };
    let initial_ms = config.initial_delay.as_secs_f64() * 1000.0;

    let (base_ms, cap) = if category == ErrorCategory::RateLimited {
        (
            initial_ms * RATE_LIMIT_DELAY_FACTOR * (f64::from(attempt) + 1.0),
            config.max_delay.saturating_mul(2),
        )
    } else {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        (initial_ms * config.backoff_multiplier.powi(exponent), config.max_delay)
    };
    let cap_ms = cap.as_secs_f64() * 1000.0;

    // f64::min discards a NaN operand, so an overflowing base lands on the cap
    let delay_ms = (base_ms + base_ms * fraction).min(cap_ms).round();

    // `as` saturates for out-of-range floats
    let mut millis = delay_ms as u64;
    if millis == 0 && !config.initial_delay.is_zero() {
        millis = 1;
    }

    // Rounding and the 1ms floor may overshoot a sub-millisecond cap
    Duration::from_millis(millis).min(cap)
}

#[cfg(test)]
mod tests {
    //! Unit tests for backoff computation
    //!
    //! Tests cover the exponential curve, jitter bounds, clamping, the
    //! rate-limited inflation, and rounding edge cases.

    use super::*;

    fn config(initial_ms: u64, max_ms: u64, multiplier: f64) -> RetryConfig {
        RetryConfig::builder()
            .initial_delay(Duration::from_millis(initial_ms))
            .max_delay(Duration::from_millis(max_ms))
            .backoff_multiplier(multiplier)
            .build()
            .expect("valid retry config")
    }

    #[test]
    fn test_exponential_without_jitter() {
        let config = config(100, 10_000, 2.0);

        for (attempt, expected) in [(0, 100), (1, 200), (2, 400), (3, 800)] {
            assert_eq!(
                compute_backoff_delay_with(attempt, &config, ErrorCategory::Server, 0.0),
                Duration::from_millis(expected)
            );
        }
    }

    #[test]
    fn test_jitter_is_additive() {
        let config = config(1000, 30_000, 2.0);

        assert_eq!(
            compute_backoff_delay_with(0, &config, ErrorCategory::Network, 0.3),
            Duration::from_millis(1300)
        );
        assert_eq!(
            compute_backoff_delay_with(1, &config, ErrorCategory::Network, 0.15),
            Duration::from_millis(2300)
        );
        // Out-of-range fractions are clamped rather than subtracted
        assert_eq!(
            compute_backoff_delay_with(0, &config, ErrorCategory::Network, -0.5),
            Duration::from_millis(1000)
        );
    }

    /// Random delays for the reference config stay inside their jitter bands.
    #[test]
    fn test_random_jitter_bands() {
        let config = config(1000, 30_000, 2.0);
        let bands = [(0, 1000, 1300), (1, 2000, 2600), (2, 4000, 5200)];

        for _ in 0..200 {
            for (attempt, low, high) in bands {
                let delay = compute_backoff_delay(attempt, &config, ErrorCategory::Server);
                assert!(
                    delay >= Duration::from_millis(low) && delay <= Duration::from_millis(high),
                    "attempt {attempt}: {delay:?} outside [{low}, {high}]ms"
                );
            }
        }
    }

    #[test]
    fn test_monotonic_before_clamp() {
        let config = config(50, 3_600_000, 1.5);

        let mut previous = Duration::ZERO;
        for attempt in 0..15 {
            let delay = compute_backoff_delay_with(attempt, &config, ErrorCategory::Server, 0.2);
            assert!(delay >= previous, "attempt {attempt}: {delay:?} < {previous:?}");
            previous = delay;
        }
    }

    #[test]
    fn test_clamped_to_max_delay() {
        let config = config(1000, 5000, 2.0);

        for attempt in 0..64 {
            let delay = compute_backoff_delay(attempt, &config, ErrorCategory::Server);
            assert!(delay <= Duration::from_millis(5000));
        }
        assert_eq!(
            compute_backoff_delay_with(u32::MAX, &config, ErrorCategory::Server, 0.3),
            Duration::from_millis(5000)
        );
    }

    #[test]
    fn test_rate_limited_inflation() {
        let config = config(100, 5000, 2.0);

        assert_eq!(
            compute_backoff_delay_with(0, &config, ErrorCategory::RateLimited, 0.0),
            Duration::from_millis(1000)
        );
        assert_eq!(
            compute_backoff_delay_with(2, &config, ErrorCategory::RateLimited, 0.0),
            Duration::from_millis(3000)
        );
        // Capped at twice max_delay rather than max_delay
        assert_eq!(
            compute_backoff_delay_with(8, &config, ErrorCategory::RateLimited, 0.0),
            Duration::from_millis(9000)
        );
        assert_eq!(
            compute_backoff_delay_with(20, &config, ErrorCategory::RateLimited, 0.3),
            Duration::from_millis(10_000)
        );
    }

    #[test]
    fn test_rate_limited_bound_with_random_jitter() {
        let config = config(500, 2000, 2.0);

        for attempt in 0..32 {
            let delay = compute_backoff_delay(attempt, &config, ErrorCategory::RateLimited);
            assert!(delay <= Duration::from_millis(4000));
        }
    }

    #[test]
    fn test_never_zero_for_positive_initial_delay() {
        let config = RetryConfig::builder()
            .initial_delay(Duration::from_micros(300))
            .max_delay(Duration::from_secs(1))
            .build()
            .unwrap();

        assert_eq!(
            compute_backoff_delay_with(0, &config, ErrorCategory::Server, 0.0),
            Duration::from_millis(1)
        );
    }

    #[test]
    fn test_zero_initial_delay() {
        let config = config(0, 0, 2.0);
        assert_eq!(
            compute_backoff_delay(3, &config, ErrorCategory::Network),
            Duration::ZERO
        );
    }

    #[test]
    fn test_rounds_to_nearest_millisecond() {
        let config = config(10, 1000, 1.0);
        // 10ms * 1.25 = 12.5ms rounds up
        assert_eq!(
            compute_backoff_delay_with(0, &config, ErrorCategory::Server, 0.25),
            Duration::from_millis(13)
        );
        // 10ms * 1.04 = 10.4ms rounds down
        assert_eq!(
            compute_backoff_delay_with(0, &config, ErrorCategory::Server, 0.04),
            Duration::from_millis(10)
        );
    }

    /// Sub-millisecond caps hold after rounding and the 1ms floor.
    #[test]
    fn test_sub_millisecond_max_delay_is_respected() {
        let fractional_cap = RetryConfig::builder()
            .initial_delay(Duration::from_millis(1000))
            .max_delay(Duration::from_micros(1_000_600))
            .build()
            .unwrap();
        let delay = compute_backoff_delay_with(1, &fractional_cap, ErrorCategory::Server, 0.0);
        assert!(delay <= fractional_cap.max_delay, "{delay:?}");
        assert_eq!(delay, Duration::from_micros(1_000_600));

        let tiny_cap = RetryConfig::builder()
            .initial_delay(Duration::from_micros(200))
            .max_delay(Duration::from_micros(400))
            .build()
            .unwrap();
        let delay = compute_backoff_delay_with(0, &tiny_cap, ErrorCategory::Server, 0.0);
        assert_eq!(delay, Duration::from_micros(400));

        let rate_limited = compute_backoff_delay_with(0, &tiny_cap, ErrorCategory::RateLimited, 0.3);
        assert!(rate_limited > Duration::ZERO && rate_limited <= Duration::from_micros(800));
    }
}
