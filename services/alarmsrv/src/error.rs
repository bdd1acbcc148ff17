//! Error handling for the Alarm Service
//!
//! Variants map onto the shared [`errors::ErrorCategory`] taxonomy so command
//! replies and logs classify failures the same way every service does.

use errors::{ErrorCategory, ServiceErrorTrait};
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, AlarmError>;

/// Alarm service error type
#[derive(Error, Debug)]
pub enum AlarmError {
    /// Missing or malformed arguments
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Unknown alarm or source
    #[error("{resource} not found")]
    NotFound { resource: String },

    /// Concurrent test, mismatched re-registration, illegal state for the request
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Persistence or network failure while processing side effects
    #[error("{context} failed: {message}")]
    TransientIo { context: String, message: String },

    /// Fatal at startup
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Database error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AlarmError {
    pub fn validation(msg: impl Into<String>) -> Self {
        AlarmError::Validation(msg.into())
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        AlarmError::NotFound {
            resource: resource.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        AlarmError::Conflict(msg.into())
    }

    pub fn transient(context: impl Into<String>, message: impl ToString) -> Self {
        AlarmError::TransientIo {
            context: context.into(),
            message: message.to_string(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        AlarmError::Configuration(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        AlarmError::Internal(msg.into())
    }
}

// ============================================================================
// AlarmError implements ServiceErrorTrait
// ============================================================================

impl ServiceErrorTrait for AlarmError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ALARM_VALIDATION_ERROR",
            Self::NotFound { .. } => "ALARM_NOT_FOUND",
            Self::Conflict(_) => "ALARM_CONFLICT",
            Self::TransientIo { .. } => "ALARM_IO_ERROR",
            Self::Configuration(_) => "ALARM_CONFIG_ERROR",
            Self::Serialization(_) => "ALARM_SERIALIZATION_ERROR",
            Self::Redis(_) => "ALARM_REDIS_ERROR",
            Self::Sqlite(_) => "ALARM_DATABASE_ERROR",
            Self::Internal(_) => "ALARM_INTERNAL_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) | Self::Serialization(_) => ErrorCategory::Validation,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::Conflict(_) => ErrorCategory::Conflict,
            Self::TransientIo { .. } | Self::Redis(_) | Self::Sqlite(_) => {
                ErrorCategory::TransientIo
            },
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Internal(_) => ErrorCategory::Internal,
        }
    }
}
