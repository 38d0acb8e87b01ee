//! Error classification and resilience error types
//!
//! This module provides the error vocabulary shared by every stage of the
//! resilience pipeline:
//!
//! 1. **[`ErrorCategory`]**: the fixed set of categories an arbitrary failure
//!    is mapped into (`Network`, `Server`, `Client`, `RateLimited`,
//!    `Unknown`).
//!
//! 2. **[`ClassifyError`] trait**: the view the classifier needs of an opaque
//!    error value (numeric status, error code, message). Implemented for
//!    [`RemoteError`], [`std::io::Error`], `String`, `&str`, and with the
//!    `http` feature, `reqwest::Error`.
//!
//! 3. **[`ResilienceError`]**: the error surfaced by the circuit breaker and
//!    the composed executor. It is either the original operation error, a
//!    fail-fast `CircuitOpen` rejection, or a `Cancelled` wait.
//!
//! ## Classification Rules
//!
//! Rules are evaluated in precedence order; the first match wins:
//!
//! | # | Condition | Category |
//! |---|-----------|----------|
//! | 1 | Code or message indicates connection, timeout, DNS or socket fault | `Network` |
//! | 2 | Status `429` | `RateLimited` |
//! | 3 | Status `>= 500` | `Server` |
//! | 4 | Status `>= 400` | `Client` |
//! | 5 | Anything else | `Unknown` |
//!
//! ## Examples
//!
//! ```rust
//! use steadfast_resilience::error::{classify_error, ErrorCategory, RemoteError};
//!
//! let err = RemoteError::http(503, "service unavailable");
//! assert_eq!(classify_error(&err), ErrorCategory::Server);
//!
//! let err = RemoteError::new("connect ECONNREFUSED 10.0.0.7:5432");
//! assert_eq!(classify_error(&err), ErrorCategory::Network);
//! ```

use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes that indicate a connection, timeout, DNS, or socket fault.
pub const NETWORK_ERROR_CODES: &[&str] = &[
    "ECONNREFUSED",
    "ECONNRESET",
    "ECONNABORTED",
    "ETIMEDOUT",
    "ENOTFOUND",
    "EAI_AGAIN",
    "EPIPE",
    "EHOSTUNREACH",
    "ENETUNREACH",
    "ENOTCONN",
    "EADDRNOTAVAIL",
];

static NETWORK_MESSAGE_REGEX: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:network|timeout|timed out|connection (?:refused|reset|closed|aborted)|fetch failed|socket|dns|econn[a-z]*|enotfound|etimedout|eai_again|ehostunreach|enetunreach|epipe)\b",
    )
    .ok()
});

/// Category an error is classified into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Connection failure, timeout, DNS or socket-level fault
    Network,
    /// Server-side failure (status >= 500)
    Server,
    /// Client-side failure (status 4xx other than 429)
    Client,
    /// The dependency is throttling us (status 429)
    RateLimited,
    /// No rule matched
    Unknown,
}

impl ErrorCategory {
    /// Categories retried by default: `Network`, `Server`, `RateLimited`
    pub fn default_retryable() -> HashSet<ErrorCategory> {
        [ErrorCategory::Network, ErrorCategory::Server, ErrorCategory::RateLimited]
            .into_iter()
            .collect()
    }

    /// Stable lowercase name used in log fields and configuration
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Server => "server",
            Self::Client => "client",
            Self::RateLimited => "rate_limited",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The view of an error value that classification needs
///
/// Only [`message`](ClassifyError::message) is required. Errors carrying a
/// protocol status (HTTP) or a system error code (`ECONNRESET`) should
/// expose them so the status and code rules can apply.
pub trait ClassifyError {
    /// Numeric status code, e.g. an HTTP status
    fn status_code(&self) -> Option<u16> {
        None
    }

    /// Symbolic error code, e.g. `ECONNREFUSED`
    fn error_code(&self) -> Option<&str> {
        None
    }

    /// Human-readable message
    fn message(&self) -> Cow<'_, str>;
}

/// Classify an error into an [`ErrorCategory`]
///
/// Pure and total: every input maps to exactly one category.
pub fn classify_error<E>(error: &E) -> ErrorCategory
where
    E: ClassifyError + ?Sized,
{
    if is_network_fault(error) {
        return ErrorCategory::Network;
    }

    match error.status_code() {
        Some(429) => ErrorCategory::RateLimited,
        Some(status) if status >= 500 => ErrorCategory::Server,
        Some(status) if status >= 400 => ErrorCategory::Client,
        _ => ErrorCategory::Unknown,
    }
}

fn is_network_fault<E>(error: &E) -> bool
where
    E: ClassifyError + ?Sized,
{
    if let Some(code) = error.error_code() {
        if NETWORK_ERROR_CODES.iter().any(|known| known.eq_ignore_ascii_case(code)) {
            return true;
        }
    }

    match NETWORK_MESSAGE_REGEX.as_ref() {
        Some(regex) => regex.is_match(&error.message()),
        None => false,
    }
}

//==============================================================================
// Remote Error
//==============================================================================

/// A general-purpose error for remote dependency calls
///
/// Callers whose client library has its own error type can map into this
/// struct to get classification without implementing [`ClassifyError`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RemoteError {
    /// Numeric status code, if the dependency answered
    pub status: Option<u16>,
    /// Symbolic error code, if one was reported
    pub code: Option<String>,
    /// Human-readable message
    pub message: String,
}

impl RemoteError {
    /// Create an error with only a message
    pub fn new(message: impl Into<String>) -> Self {
        Self { status: None, code: None, message: message.into() }
    }

    /// Create an error for a response with the given status
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self { status: Some(status), code: None, message: message.into() }
    }

    /// Attach a symbolic error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Classify this error
    pub fn category(&self) -> ErrorCategory {
        classify_error(self)
    }
}

impl ClassifyError for RemoteError {
    fn status_code(&self) -> Option<u16> {
        self.status
    }

    fn error_code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    fn message(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.message)
    }
}

impl ClassifyError for std::io::Error {
    fn error_code(&self) -> Option<&str> {
        use std::io::ErrorKind;

        match self.kind() {
            ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
            ErrorKind::ConnectionReset => Some("ECONNRESET"),
            ErrorKind::ConnectionAborted => Some("ECONNABORTED"),
            ErrorKind::TimedOut => Some("ETIMEDOUT"),
            ErrorKind::BrokenPipe => Some("EPIPE"),
            ErrorKind::NotConnected => Some("ENOTCONN"),
            ErrorKind::AddrNotAvailable => Some("EADDRNOTAVAIL"),
            _ => None,
        }
    }

    fn message(&self) -> Cow<'_, str> {
        Cow::Owned(self.to_string())
    }
}

impl ClassifyError for String {
    fn message(&self) -> Cow<'_, str> {
        Cow::Borrowed(self.as_str())
    }
}

impl ClassifyError for &str {
    fn message(&self) -> Cow<'_, str> {
        Cow::Borrowed(self)
    }
}

#[cfg(feature = "http")]
impl ClassifyError for reqwest::Error {
    fn status_code(&self) -> Option<u16> {
        self.status().map(|status| status.as_u16())
    }

    fn error_code(&self) -> Option<&str> {
        if self.is_timeout() {
            Some("ETIMEDOUT")
        } else if self.is_connect() {
            Some("ECONNREFUSED")
        } else {
            None
        }
    }

    fn message(&self) -> Cow<'_, str> {
        Cow::Owned(self.to_string())
    }
}

//==============================================================================
// Resilience Errors
//==============================================================================

/// Simple configuration error for validation and loading
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration value failed validation
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    /// A configuration document could not be parsed
    #[error("Failed to parse configuration: {message}")]
    Parse { message: String },

    /// A configuration file could not be read
    #[error("Failed to read configuration file '{path}'")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}

/// Configuration result type using simple config errors
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors surfaced by the circuit breaker and the composed executor
///
/// Generic over the protected call's error type `E`, so the original failure
/// is preserved unchanged in [`ResilienceError::Operation`]. The other two
/// variants mean the operation was not (or no longer) attempted.
#[derive(Debug, Error)]
pub enum ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Circuit breaker is open; the operation was never invoked
    #[error("Circuit breaker is open, rejecting calls")]
    CircuitOpen {
        /// Time left before the breaker admits a probe, when known
        retry_after: Option<Duration>,
    },

    /// The caller cancelled a pending wait
    #[error("Operation cancelled")]
    Cancelled,

    /// The underlying operation failed
    #[error(transparent)]
    Operation {
        #[from]
        source: E,
    },
}

impl<E> ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Whether the breaker refused admission
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Whether the call was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Borrow the original operation error, if the operation ran and failed
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            Self::Operation { source } => Some(source),
            _ => None,
        }
    }

    /// Take the original operation error, if the operation ran and failed
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::Operation { source } => Some(source),
            _ => None,
        }
    }
}

/// Result type for resilience operations
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;
