//! Error handling for the psgrid-common crate.

use thiserror::Error;

/// Common error type that abstracts over underlying library errors.
///
/// Every variant carries a human readable message plus an optional source,
/// so callers can chain the original cause without losing structure.
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("Invalid configuration: {message}")]
    ConfigurationError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Network operation failed: {message}")]
    NetworkError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Timeout occurred: {message}")]
    TimeoutError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Internal error: {message}")]
    InternalError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },
}

/// Result type alias for common operations.
pub type Result<T> = std::result::Result<T, CommonError>;

/// Error severity levels for categorizing errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Low severity - operation can continue with degraded functionality
    Low,
    /// Medium severity - operation should be retried or alternative approach used
    Medium,
    /// High severity - operation must be aborted but system can continue
    High,
    /// Critical severity - system integrity is at risk
    Critical,
}

/// Trait for error diagnostics used by retry loops.
pub trait Diagnose {
    /// Get the error severity level.
    fn severity(&self) -> ErrorSeverity;

    /// Check if the error is retryable.
    fn is_retryable(&self) -> bool;

    /// Get the recommended retry delay in milliseconds.
    fn retry_delay_ms(&self) -> Option<u64>;
}

impl CommonError {
    /// Create a configuration error with a custom message.
    pub fn configuration_error<S: Into<String>>(message: S) -> Self {
        Self::ConfigurationError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error with a custom message and source error.
    pub fn configuration_error_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::ConfigurationError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a network error with a custom message.
    pub fn network_error<S: Into<String>>(message: S) -> Self {
        Self::NetworkError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a network error with a custom message and source error.
    pub fn network_error_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::NetworkError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a timeout error with a custom message.
    pub fn timeout_error<S: Into<String>>(message: S) -> Self {
        Self::TimeoutError {
            message: message.into(),
            source: None,
        }
    }

    /// Create an internal error with a custom message.
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::InternalError {
            message: message.into(),
            source: None,
        }
    }

    /// Create an internal error with a custom message and source error.
    pub fn internal_error_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::InternalError {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

impl Diagnose for CommonError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            CommonError::ConfigurationError { .. } => ErrorSeverity::High,
            CommonError::NetworkError { .. } => ErrorSeverity::Medium,
            CommonError::TimeoutError { .. } => ErrorSeverity::Medium,
            CommonError::InternalError { .. } => ErrorSeverity::Critical,
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            CommonError::ConfigurationError { .. } => false,
            CommonError::NetworkError { .. } => true,
            CommonError::TimeoutError { .. } => true,
            CommonError::InternalError { .. } => false,
        }
    }

    fn retry_delay_ms(&self) -> Option<u64> {
        if !self.is_retryable() {
            return None;
        }

        match self {
            CommonError::NetworkError { .. } => Some(100),
            CommonError::TimeoutError { .. } => Some(500),
            _ => None,
        }
    }
}

/// Context helpers for adding rich context to errors.
pub mod context {
    use super::*;

    /// Extension trait for adding context to Results.
    pub trait ErrorContext<T> {
        /// Wrap the error as a configuration error.
        fn with_configuration_context<F>(self, f: F) -> Result<T>
        where
            F: FnOnce() -> String;
    }

    impl<T, E> ErrorContext<T> for std::result::Result<T, E>
    where
        E: Into<anyhow::Error>,
    {
        fn with_configuration_context<F>(self, f: F) -> Result<T>
        where
            F: FnOnce() -> String,
        {
            self.map_err(|e| CommonError::configuration_error_with_source(f(), e.into()))
        }
    }
}

pub use context::ErrorContext;
