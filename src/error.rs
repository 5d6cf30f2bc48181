use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Represents a result type for operations in the engine.
///
/// This `Result` type is a standard Rust `Result` type where the error variant is defined by the
/// crate-specific [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can be returned to a caller.
///
/// `Error` is `Clone` because one failed load is delivered to every caller waiting on it.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The evaluation request itself is invalid (e.g., empty subject id). Not retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Flag definition failed load-time validation.
    #[error(transparent)]
    ConfigInvalid(ConfigError),

    /// Configuration loader reported an error and there was no cached value to fall back on.
    #[error("configuration load failed: {0}")]
    LoadFailed(String),

    /// Deadline exceeded while waiting for configuration and no stale value was available.
    #[error("deadline exceeded while loading configuration")]
    Timeout,

    /// Invalid base URL configuration of the HTTP loader.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The configuration service rejected the API key.
    #[error("unauthorized, api_key is likely invalid")]
    Unauthorized,

    /// Network error.
    #[error(transparent)]
    // reqwest::Error is not clonable, so we're wrapping it in an Arc.
    Network(Arc<reqwest::Error>),

    /// An I/O error.
    #[error(transparent)]
    Io(Arc<std::io::Error>),

    /// Telemetry worker panicked. This should normally never happen.
    #[error("telemetry worker panicked")]
    TelemetryWorkerPanicked,
}

/// Coarse error classification exposed to callers so they can pick a policy without matching
/// every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Caller error.
    InvalidInput,
    /// Flag is confirmed absent. Never produced by [`Error`] itself, but part of the taxonomy
    /// reported alongside results.
    NotFound,
    /// Malformed flag definition.
    ConfigInvalid,
    /// Loader failure without a fallback value.
    LoadFailed,
    /// Deadline exceeded without a fallback value.
    Timeout,
}

impl Error {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::ConfigInvalid(_) => ErrorKind::ConfigInvalid,
            Error::Timeout => ErrorKind::Timeout,
            Error::LoadFailed(_)
            | Error::InvalidBaseUrl(_)
            | Error::Unauthorized
            | Error::Network(_)
            | Error::Io(_)
            | Error::TelemetryWorkerPanicked => ErrorKind::LoadFailed,
        }
    }

    /// Return `true` if repeating the same load later could succeed.
    pub(crate) fn is_retriable(&self) -> bool {
        !matches!(
            self,
            Error::InvalidInput(_) | Error::InvalidBaseUrl(_) | Error::Unauthorized
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

/// A malformed definition body is a configuration problem, not a transport one.
impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::ConfigInvalid(ConfigError::Parse(value.to_string()))
    }
}

impl From<ConfigError> for Error {
    fn from(value: ConfigError) -> Self {
        Error::ConfigInvalid(value)
    }
}

/// Load-time validation failure of a flag definition.
///
/// A definition that fails validation is cached as invalid and evaluates to `DISABLED`.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("unable to parse flag definition: {0}")]
    Parse(String),

    #[error("rollout percentage must be within 0..=100, found {0}")]
    RolloutOutOfRange(u32),

    #[error("variant weights must not all be zero")]
    ZeroTotalWeight,

    #[error("duplicate variant name {0:?}")]
    DuplicateVariant(String),

    #[error("rule tree exceeds maximum depth of {max}")]
    RuleTooDeep { max: usize },

    #[error("operator {operator} expects {expected}")]
    InvalidOperand {
        operator: &'static str,
        expected: &'static str,
    },

    #[error("invalid regex {pattern:?}: {message}")]
    InvalidRegex { pattern: String, message: String },

    #[error("invalid semantic version {version:?}: {message}")]
    InvalidSemver { version: String, message: String },

    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),

    #[error("invalid time of day {0:?}, expected HH:MM")]
    InvalidTimeOfDay(String),

    #[error("invalid utc offset {0:?}")]
    InvalidUtcOffset(String),

    #[error("unknown weekday {0:?}")]
    InvalidWeekday(String),

    #[error("unknown distance unit {0:?}")]
    InvalidDistanceUnit(String),
}
