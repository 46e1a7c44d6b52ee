// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for ledgerflow-core.
//!
//! Two layers of errors exist:
//!
//! - [`CoreError`]: infrastructure failures (storage, serialization, validation)
//!   with stable machine-readable codes.
//! - [`PipelineError`]: the classification the flow hospital acts on. Every error
//!   raised while processing a flow event ends up as one of its three categories.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Infrastructure errors raised by stores, codecs and the worker.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Stored state could not be decoded.
    CorruptState {
        /// What was being decoded.
        what: String,
        /// Decoder error details.
        details: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Publishing output records failed.
    PublishFailed {
        /// Error details.
        details: String,
    },

    /// The worker no longer accepts events.
    WorkerStopped,
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::CorruptState { .. } => "CORRUPT_STATE",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::PublishFailed { .. } => "PUBLISH_FAILED",
            Self::WorkerStopped => "WORKER_STOPPED",
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CorruptState { what, details } => {
                write!(f, "Corrupt {}: {}", what, details)
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
            Self::PublishFailed { details } => {
                write!(f, "Failed to publish records: {}", details)
            }
            Self::WorkerStopped => f.write_str("Flow worker has stopped"),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::CorruptState {
            what: "json".to_string(),
            details: err.to_string(),
        }
    }
}

/// Hospital category of an error raised inside the flow pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Unrecoverable; the flow is dead-lettered.
    Fatal,
    /// The current event is aborted but already computed effects are published.
    Abort,
    /// The event is retried with backoff.
    Transient,
}

impl ErrorCategory {
    /// Returns the string representation of the category.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fatal => "fatal",
            Self::Abort => "abort",
            Self::Transient => "transient",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while processing one flow event.
///
/// Components never suppress or reclassify these; the pipeline hands them to
/// the hospital unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    /// Deployment or programming defect: unregistered handler or factory, corrupt state.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Business-level protocol failure; publish what has been computed so far.
    #[error("aborted: {0}")]
    Abort(String),

    /// Temporary infrastructure fault; retry the event later.
    #[error("transient: {0}")]
    Transient(String),
}

impl PipelineError {
    /// Create a fatal error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Create a pipeline-abort error.
    pub fn abort(message: impl Into<String>) -> Self {
        Self::Abort(message.into())
    }

    /// Create a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// The hospital category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Fatal(_) => ErrorCategory::Fatal,
            Self::Abort(_) => ErrorCategory::Abort,
            Self::Transient(_) => ErrorCategory::Transient,
        }
    }

    /// The error message without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Fatal(m) | Self::Abort(m) | Self::Transient(m) => m,
        }
    }
}

impl From<CoreError> for PipelineError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::CorruptState { .. } | CoreError::ValidationError { .. } => {
                PipelineError::Fatal(err.to_string())
            }
            _ => PipelineError::Transient(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_codes() {
        let test_cases = vec![
            (
                CoreError::CorruptState {
                    what: "checkpoint".to_string(),
                    details: "eof".to_string(),
                },
                "CORRUPT_STATE",
            ),
            (
                CoreError::ValidationError {
                    field: "flow_id".to_string(),
                    message: "empty".to_string(),
                },
                "VALIDATION_ERROR",
            ),
            (
                CoreError::DatabaseError {
                    operation: "insert".to_string(),
                    details: "connection refused".to_string(),
                },
                "DATABASE_ERROR",
            ),
            (
                CoreError::PublishFailed {
                    details: "closed".to_string(),
                },
                "PUBLISH_FAILED",
            ),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_core_error_display() {
        let err = CoreError::WorkerStopped;
        assert_eq!(err.to_string(), "Flow worker has stopped");
        assert_eq!(err.error_code(), "WORKER_STOPPED");

        let err = CoreError::DatabaseError {
            operation: "insert".to_string(),
            details: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Database error during 'insert': connection refused"
        );
    }

    #[test]
    fn test_core_error_classification() {
        let db: PipelineError = CoreError::DatabaseError {
            operation: "select".to_string(),
            details: "timeout".to_string(),
        }
        .into();
        assert_eq!(db.category(), ErrorCategory::Transient);

        let corrupt: PipelineError = CoreError::CorruptState {
            what: "checkpoint".to_string(),
            details: "bad json".to_string(),
        }
        .into();
        assert_eq!(corrupt.category(), ErrorCategory::Fatal);
    }

    #[test]
    fn test_pipeline_error_display_and_message() {
        let err = PipelineError::fatal("no factory 'crypto.sign'");
        assert_eq!(err.to_string(), "fatal: no factory 'crypto.sign'");
        assert_eq!(err.message(), "no factory 'crypto.sign'");
        assert_eq!(PipelineError::abort("x").category(), ErrorCategory::Abort);
        assert_eq!(ErrorCategory::Transient.to_string(), "transient");
    }
}
