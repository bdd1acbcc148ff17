//! Unified error handling for the alarm services
//!
//! Services keep their own domain error enums and implement [`ServiceErrorTrait`]
//! to get a common classification, log level and wire representation.

use serde::{Deserialize, Serialize};

// ============================================================================
// ErrorCategory - classification shared by all services
// ============================================================================

/// Error category enum - used for classification, logging and replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Fatal at startup, e.g. the initial alarm set cannot be loaded
    Configuration,
    /// Missing or malformed arguments
    Validation,
    /// Unknown alarm, source or resource
    NotFound,
    /// Concurrent test, mismatched re-registration, illegal state for the request
    Conflict,
    /// Persistence or network failure while processing side effects
    TransientIo,
    /// Everything else
    Internal,
}

impl ErrorCategory {
    /// Numeric code in HTTP style, used in `ErrorInfo`
    pub fn code(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::TransientIo => 503,
            Self::Configuration | Self::Internal => 500,
        }
    }
}

// ============================================================================
// ErrorInfo - reply payload
// ============================================================================

/// Standard error information carried in error replies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error code (HTTP style)
    pub code: u16,
    /// Machine readable error code, e.g. `ALARM_NOT_FOUND`
    pub error_code: String,
    /// Error category
    pub category: ErrorCategory,
    /// Human readable message
    pub message: String,
    /// Detailed error description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorInfo {
    /// Create a new ErrorInfo for a category
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            code: category.code(),
            error_code: "ERROR".to_string(),
            category,
            message: message.into(),
            details: None,
        }
    }

    /// Set the machine readable code
    pub fn with_error_code(mut self, error_code: impl Into<String>) -> Self {
        self.error_code = error_code.into();
        self
    }

    /// Add details
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

// ============================================================================
// ServiceErrorTrait - common capability of service error types
// ============================================================================

/// Capability trait for service error types
///
/// Each service keeps its own error enum and gains the common classification by
/// implementing the two required methods. The rest have category based defaults.
pub trait ServiceErrorTrait: std::error::Error + Send + Sync + 'static {
    /// Get error code (for replies, logs, monitoring)
    fn error_code(&self) -> &'static str;

    /// Get error category
    fn category(&self) -> ErrorCategory;

    /// Whether the failed operation may succeed when repeated
    fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::TransientIo)
    }

    /// Whether the error must stop the service from starting
    fn is_fatal(&self) -> bool {
        matches!(self.category(), ErrorCategory::Configuration)
    }

    /// Log level this error should be reported at
    fn log_level(&self) -> tracing::Level {
        use tracing::Level;
        match self.category() {
            ErrorCategory::Configuration | ErrorCategory::Internal => Level::ERROR,
            ErrorCategory::TransientIo => Level::WARN,
            ErrorCategory::Validation | ErrorCategory::NotFound | ErrorCategory::Conflict => {
                Level::INFO
            },
        }
    }

    /// Convert to reply payload
    fn to_error_info(&self) -> ErrorInfo {
        ErrorInfo::new(self.category(), self.to_string()).with_error_code(self.error_code())
    }
}

// Tests
#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Busy;

    impl std::fmt::Display for Busy {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "store busy")
        }
    }

    impl std::error::Error for Busy {}

    impl ServiceErrorTrait for Busy {
        fn error_code(&self) -> &'static str {
            "STORE_BUSY"
        }

        fn category(&self) -> ErrorCategory {
            ErrorCategory::TransientIo
        }
    }

    #[test]
    fn test_category_codes() {
        assert_eq!(ErrorCategory::Validation.code(), 400);
        assert_eq!(ErrorCategory::NotFound.code(), 404);
        assert_eq!(ErrorCategory::Conflict.code(), 409);
        assert_eq!(ErrorCategory::Configuration.code(), 500);
    }

    #[test]
    fn test_trait_defaults() {
        assert!(Busy.is_retryable());
        assert!(!Busy.is_fatal());
        assert_eq!(Busy.log_level(), tracing::Level::WARN);

        let info = Busy.to_error_info();
        assert_eq!(info.code, 503);
        assert_eq!(info.error_code, "STORE_BUSY");
        assert_eq!(info.message, "store busy");
    }

    #[test]
    fn test_error_info_serialization() {
        let info = ErrorInfo::new(ErrorCategory::NotFound, "Alarm not found: gs").with_details("local");
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["category"], "NOT_FOUND");
        assert_eq!(json["details"], "local");
    }
}
