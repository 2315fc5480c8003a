use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Stable error classes surfaced from every layer of the search stack.
///
/// The string form is the wire representation; unknown strings at the edges
/// are rejected by `FromStr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Validation,
    Authentication,
    NotFound,
    RateLimit,
    Timeout,
    Network,
    Parse,
    HealthCheck,
    Messaging,
    Serialization,
    Other,
}

impl ErrorClass {
    /// Severity ordering used to pick the error reported when every
    /// provider fails: Authentication > RateLimit > Timeout > Network >
    /// Parse > everything else.
    #[must_use]
    pub const fn severity(self) -> u8 {
        match self {
            Self::Authentication => 6,
            Self::RateLimit => 5,
            Self::Timeout => 4,
            Self::Network => 3,
            Self::Parse => 2,
            _ => 1,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Authentication => "authentication",
            Self::NotFound => "not_found",
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Parse => "parse",
            Self::HealthCheck => "health_check",
            Self::Messaging => "messaging",
            Self::Serialization => "serialization",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "validation" => Ok(Self::Validation),
            "authentication" => Ok(Self::Authentication),
            "not_found" => Ok(Self::NotFound),
            "rate_limit" => Ok(Self::RateLimit),
            "timeout" => Ok(Self::Timeout),
            "network" => Ok(Self::Network),
            "parse" => Ok(Self::Parse),
            "health_check" => Ok(Self::HealthCheck),
            "messaging" => Ok(Self::Messaging),
            "serialization" => Ok(Self::Serialization),
            "other" => Ok(Self::Other),
            other => Err(Error::Validation {
                field: "error_class".to_string(),
                reason: format!("unknown error class '{other}'"),
            }),
        }
    }
}

/// Crate-wide error type covering every layer of the federated search stack.
#[derive(Error, Debug)]
pub enum Error {
    // Input errors (permanent - don't retry)
    #[error("Validation error: {field} - {reason}")]
    Validation { field: String, reason: String },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Not found: {resource} '{id}'")]
    NotFound { resource: String, id: String },

    // Throttling
    #[error("Rate limit exceeded for {provider}")]
    RateLimit {
        provider: String,
        retry_after: Option<Duration>,
    },

    // Transient network-shaped errors
    #[error("Timeout after {timeout:?}: {operation}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Parse error in {context}: {message}")]
    Parse { context: String, message: String },

    #[error("Health check failed for {provider}: {reason}")]
    HealthCheck { provider: String, reason: String },

    // Bus / broker
    #[error("Messaging error: {0}")]
    Messaging(String),

    // Circuit breaker rejections (no upstream call was made)
    #[error("Circuit breaker open for provider: {provider}")]
    CircuitOpen { provider: String },

    // Infrastructure
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Anything else; `retryable` distinguishes 5xx-like upstream failures
    // from terminal conditions.
    #[error("{message}")]
    Other { message: String, retryable: bool },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a retryable upstream failure (5xx-like).
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
            retryable: true,
        }
    }

    /// Shorthand for a terminal failure with no better class.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
            retryable: false,
        }
    }

    /// The stable class of this error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Validation { .. } | Self::Config(_) => ErrorClass::Validation,
            Self::Authentication(_) => ErrorClass::Authentication,
            Self::NotFound { .. } => ErrorClass::NotFound,
            Self::RateLimit { .. } => ErrorClass::RateLimit,
            Self::Timeout { .. } => ErrorClass::Timeout,
            Self::Network { .. } | Self::Io(_) => ErrorClass::Network,
            Self::Parse { .. } => ErrorClass::Parse,
            Self::HealthCheck { .. } => ErrorClass::HealthCheck,
            Self::Messaging(_) => ErrorClass::Messaging,
            Self::Serde(_) => ErrorClass::Serialization,
            Self::Storage(_) | Self::CircuitOpen { .. } | Self::Other { .. } => ErrorClass::Other,
        }
    }

    /// Whether the resilience envelope may transparently retry this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Network { .. } | Self::Io(_) => true,
            Self::Other { retryable, .. } => *retryable,
            // Rate limits retry only when the provider signalled a window.
            Self::RateLimit { retry_after, .. } => retry_after.is_some(),
            _ => false,
        }
    }

    /// Suggested delay before the next attempt, when the upstream told us.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Whether this failure should count against the provider's circuit.
    ///
    /// Validation and not-found outcomes are the caller's problem, not the
    /// provider's; they must not trip the breaker.
    #[must_use]
    pub fn counts_as_circuit_failure(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Network { .. }
                | Self::Authentication(_)
                | Self::HealthCheck { .. }
                | Self::Other {
                    retryable: true,
                    ..
                }
        )
    }

    /// Build the serializable error detail used in responses and events.
    #[must_use]
    pub fn detail(&self) -> ErrorDetail {
        ErrorDetail {
            class: self.class(),
            message: self.to_string(),
            retryable: self.is_retryable(),
            context: HashMap::new(),
        }
    }
}

/// Serializable error detail: class, message, retryable flag and an optional
/// context map, as carried in responses and published events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub class: ErrorClass,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
}

impl ErrorDetail {
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                operation: err
                    .url()
                    .map_or_else(|| "http request".to_string(), ToString::to_string),
                timeout: Duration::from_secs(30),
            }
        } else if err.is_decode() {
            Self::Parse {
                context: "http response body".to_string(),
                message: err.to_string(),
            }
        } else {
            Self::Network {
                message: err.to_string(),
            }
        }
    }
}
