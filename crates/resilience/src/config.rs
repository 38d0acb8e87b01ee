//! File and environment configuration
//!
//! [`ResilienceSettings`] is the serde view of every tunable in the crate.
//! Durations are integer milliseconds. A minimal TOML document:
//!
//! ```toml
//! [retry]
//! max_retries = 3
//! initial_delay_ms = 1000
//! max_delay_ms = 30000
//! backoff_multiplier = 2.0
//! retryable_categories = ["network", "server", "rate_limited"]
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! open_timeout_ms = 60000
//!
//! [rate_limiter]
//! enabled = false
//! max_requests = 10
//! window_ms = 60000
//!
//! [dependencies.orders-db.circuit_breaker]
//! failure_threshold = 3
//! open_timeout_ms = 10000
//! ```
//!
//! A block under `[dependencies.<name>]` replaces the matching top-level
//! block for that dependency; keys it omits take the built-in defaults.
//!
//! ## Environment Variables
//! Applied by [`ResilienceSettings::apply_env_overrides`] on top of the
//! top-level blocks:
//! - `STEADFAST_RETRY_MAX_RETRIES`
//! - `STEADFAST_RETRY_INITIAL_DELAY_MS`
//! - `STEADFAST_RETRY_MAX_DELAY_MS`
//! - `STEADFAST_RETRY_BACKOFF_MULTIPLIER`
//! - `STEADFAST_BREAKER_FAILURE_THRESHOLD`
//! - `STEADFAST_BREAKER_OPEN_TIMEOUT_MS`
//! - `STEADFAST_RATE_LIMIT_ENABLED`
//! - `STEADFAST_RATE_LIMIT_MAX_REQUESTS`
//! - `STEADFAST_RATE_LIMIT_WINDOW_MS`

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
#[cfg(feature = "observability")]
use tracing::debug;

use crate::error::{ConfigError, ConfigResult, ErrorCategory};
use crate::retry::RetryConfig;
use crate::utils::serde::duration_millis;

#[cfg(feature = "runtime")]
use crate::circuit_breaker::CircuitBreakerConfig;
#[cfg(feature = "runtime")]
use crate::rate_limiter::RateLimiterConfig;

/// Retry block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_retries: u32,
    #[serde(rename = "initial_delay_ms", with = "duration_millis")]
    pub initial_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "duration_millis")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub retryable_categories: Vec<ErrorCategory>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_retries: defaults.max_retries,
            initial_delay: defaults.initial_delay,
            max_delay: defaults.max_delay,
            backoff_multiplier: defaults.backoff_multiplier,
            retryable_categories: vec![
                ErrorCategory::Network,
                ErrorCategory::Server,
                ErrorCategory::RateLimited,
            ],
        }
    }
}

impl RetrySettings {
    /// Convert into a validated [`RetryConfig`]
    pub fn to_config(&self) -> ConfigResult<RetryConfig> {
        RetryConfig::builder()
            .max_retries(self.max_retries)
            .initial_delay(self.initial_delay)
            .max_delay(self.max_delay)
            .backoff_multiplier(self.backoff_multiplier)
            .retryable_categories(self.retryable_categories.iter().copied())
            .build()
    }
}

/// Circuit breaker block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u64,
    #[serde(rename = "open_timeout_ms", with = "duration_millis")]
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self { failure_threshold: 5, open_timeout: Duration::from_secs(60) }
    }
}

#[cfg(feature = "runtime")]
impl CircuitBreakerSettings {
    /// Convert into a validated [`CircuitBreakerConfig`]
    pub fn to_config(&self) -> ConfigResult<CircuitBreakerConfig> {
        CircuitBreakerConfig::builder()
            .failure_threshold(self.failure_threshold)
            .open_timeout(self.open_timeout)
            .build()
    }
}

/// Rate limiter block
///
/// `enabled` only matters for the top-level block: it decides whether
/// dependencies without their own `rate_limiter` block are throttled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimiterSettings {
    pub enabled: bool,
    pub max_requests: usize,
    #[serde(rename = "window_ms", with = "duration_millis")]
    pub window: Duration,
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        Self { enabled: false, max_requests: 10, window: Duration::from_secs(60) }
    }
}

#[cfg(feature = "runtime")]
impl RateLimiterSettings {
    /// Convert into a validated [`RateLimiterConfig`]
    pub fn to_config(&self) -> ConfigResult<RateLimiterConfig> {
        RateLimiterConfig::builder().max_requests(self.max_requests).window(self.window).build()
    }
}

/// Per-dependency overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DependencySettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerSettings>,
    /// Presence of this block throttles the dependency regardless of the
    /// top-level `enabled` flag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limiter: Option<RateLimiterSettings>,
}

/// Complete crate configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResilienceSettings {
    pub retry: RetrySettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub rate_limiter: RateLimiterSettings,
    pub dependencies: BTreeMap<String, DependencySettings>,
}

impl ResilienceSettings {
    /// Parse settings from a TOML document
    pub fn from_toml_str(source: &str) -> ConfigResult<Self> {
        toml::from_str(source).map_err(|e| ConfigError::Parse { message: e.to_string() })
    }

    /// Read and parse a TOML settings file
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        let settings = Self::from_toml_str(&source)?;

        #[cfg(feature = "observability")]
        debug!(
            path = %path.display(),
            dependencies = settings.dependencies.len(),
            "Loaded resilience settings"
        );

        Ok(settings)
    }

    /// File (or defaults when `path` is `None`), then environment overrides,
    /// then validation
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env_overrides()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `STEADFAST_*` environment variables to the top-level blocks
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup` (keyed by environment variable
    /// name)
    pub fn apply_overrides_from<L>(&mut self, lookup: L) -> ConfigResult<()>
    where
        L: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| read_override(&lookup, key);

        if let Some(value) = read("STEADFAST_RETRY_MAX_RETRIES") {
            self.retry.max_retries = parse_var("STEADFAST_RETRY_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read("STEADFAST_RETRY_INITIAL_DELAY_MS") {
            self.retry.initial_delay = parse_millis("STEADFAST_RETRY_INITIAL_DELAY_MS", &value)?;
        }
        if let Some(value) = read("STEADFAST_RETRY_MAX_DELAY_MS") {
            self.retry.max_delay = parse_millis("STEADFAST_RETRY_MAX_DELAY_MS", &value)?;
        }
        if let Some(value) = read("STEADFAST_RETRY_BACKOFF_MULTIPLIER") {
            self.retry.backoff_multiplier =
                parse_var("STEADFAST_RETRY_BACKOFF_MULTIPLIER", &value)?;
        }
        if let Some(value) = read("STEADFAST_BREAKER_FAILURE_THRESHOLD") {
            self.circuit_breaker.failure_threshold =
                parse_var("STEADFAST_BREAKER_FAILURE_THRESHOLD", &value)?;
        }
        if let Some(value) = read("STEADFAST_BREAKER_OPEN_TIMEOUT_MS") {
            self.circuit_breaker.open_timeout =
                parse_millis("STEADFAST_BREAKER_OPEN_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read("STEADFAST_RATE_LIMIT_ENABLED") {
            self.rate_limiter.enabled = parse_bool("STEADFAST_RATE_LIMIT_ENABLED", &value)?;
        }
        if let Some(value) = read("STEADFAST_RATE_LIMIT_MAX_REQUESTS") {
            self.rate_limiter.max_requests =
                parse_var("STEADFAST_RATE_LIMIT_MAX_REQUESTS", &value)?;
        }
        if let Some(value) = read("STEADFAST_RATE_LIMIT_WINDOW_MS") {
            self.rate_limiter.window = parse_millis("STEADFAST_RATE_LIMIT_WINDOW_MS", &value)?;
        }

        Ok(())
    }

    /// Check that every block converts into a valid configuration
    pub fn validate(&self) -> ConfigResult<()> {
        self.retry.to_config()?;
        #[cfg(feature = "runtime")]
        {
            self.circuit_breaker.to_config()?;
            self.rate_limiter.to_config()?;
        }

        for (name, dependency) in &self.dependencies {
            let context = |e: ConfigError| ConfigError::invalid(format!("dependency '{name}': {e}"));
            if let Some(retry) = &dependency.retry {
                retry.to_config().map_err(context)?;
            }
            #[cfg(feature = "runtime")]
            {
                if let Some(breaker) = &dependency.circuit_breaker {
                    breaker.to_config().map_err(context)?;
                }
                if let Some(limiter) = &dependency.rate_limiter {
                    limiter.to_config().map_err(context)?;
                }
            }
        }

        Ok(())
    }

    /// Top-level retry configuration
    pub fn retry_config(&self) -> ConfigResult<RetryConfig> {
        self.retry.to_config()
    }

    /// Retry configuration for `dependency`, falling back to the top-level
    /// block
    pub fn retry_config_for(&self, dependency: &str) -> ConfigResult<RetryConfig> {
        match self.dependencies.get(dependency).and_then(|d| d.retry.as_ref()) {
            Some(retry) => retry.to_config(),
            None => self.retry_config(),
        }
    }
}

#[cfg(feature = "runtime")]
impl ResilienceSettings {
    /// Top-level circuit breaker configuration
    pub fn circuit_breaker_config(&self) -> ConfigResult<CircuitBreakerConfig> {
        self.circuit_breaker.to_config()
    }

    /// Top-level rate limiter configuration (ignores `enabled`)
    pub fn rate_limiter_config(&self) -> ConfigResult<RateLimiterConfig> {
        self.rate_limiter.to_config()
    }

    /// Circuit breaker configuration for `dependency`
    pub fn circuit_breaker_config_for(&self, dependency: &str) -> ConfigResult<CircuitBreakerConfig> {
        match self.dependencies.get(dependency).and_then(|d| d.circuit_breaker.as_ref()) {
            Some(breaker) => breaker.to_config(),
            None => self.circuit_breaker_config(),
        }
    }

    /// Rate limiter configuration for `dependency`, or `None` when it is not
    /// throttled
    pub fn rate_limiter_config_for(
        &self,
        dependency: &str,
    ) -> ConfigResult<Option<RateLimiterConfig>> {
        match self.dependencies.get(dependency).and_then(|d| d.rate_limiter.as_ref()) {
            Some(limiter) => limiter.to_config().map(Some),
            None if self.rate_limiter.enabled => self.rate_limiter_config().map(Some),
            None => Ok(None),
        }
    }
}

fn read_override<L>(lookup: &L, key: &str) -> Option<String>
where
    L: Fn(&str) -> Option<String>,
{
    let value = lookup(key)?.trim().to_owned();

    #[cfg(feature = "observability")]
    debug!(variable = key, "Applying environment override");

    Some(value)
}

fn parse_var<T>(key: &str, value: &str) -> ConfigResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse::<T>().map_err(|e| ConfigError::invalid(format!("{key}={value:?}: {e}")))
}

fn parse_millis(key: &str, value: &str) -> ConfigResult<Duration> {
    parse_var::<u64>(key, value).map(Duration::from_millis)
}

fn parse_bool(key: &str, value: &str) -> ConfigResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(format!("{key}={value:?}: expected a boolean"))),
    }
}
