// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for dispatch-core.
//!
//! Provides a unified error type for request handlers. Every variant carries a
//! stable error code for wire responses.

use std::fmt;
use std::time::Duration;

use crate::rpc::RpcError;
use crate::tasks::TaskError;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur during request processing.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Nobody consumes the work queue.
    NoSubscriber {
        /// The work queue without consumers.
        queue: String,
    },

    /// No reply arrived in time.
    Timeout {
        /// The work queue the call went to.
        queue: String,
        /// How long the caller waited.
        timeout: Duration,
    },

    /// The worker reported a failure.
    RemoteError {
        /// Error code reported by the worker.
        code: String,
        /// Error message reported by the worker.
        message: String,
    },

    /// The broker failed.
    TransportError {
        /// Error details.
        details: String,
    },

    /// A value could not be serialized to or parsed from JSON.
    EncodingError {
        /// Error details.
        details: String,
    },

    /// Task was not found.
    TaskNotFound {
        /// The task ID that was not found.
        task_id: String,
    },

    /// Task is in an invalid state for the requested operation.
    InvalidTaskState {
        /// The task ID.
        task_id: String,
        /// The expected status.
        expected: String,
        /// The actual status.
        actual: String,
    },

    /// The background executor no longer accepts work.
    Unavailable {
        /// Why work is not accepted.
        reason: String,
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
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NoSubscriber { .. } => "NO_SUBSCRIBER",
            Self::Timeout { .. } => "TIMEOUT",
            Self::RemoteError { .. } => "REMOTE_ERROR",
            Self::TransportError { .. } => "TRANSPORT_ERROR",
            Self::EncodingError { .. } => "ENCODING_ERROR",
            Self::TaskNotFound { .. } => "TASK_NOT_FOUND",
            Self::InvalidTaskState { .. } => "INVALID_TASK_STATE",
            Self::Unavailable { .. } => "UNAVAILABLE",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSubscriber { queue } => {
                write!(f, "No consumer is subscribed to queue '{}'", queue)
            }
            Self::Timeout { queue, timeout } => {
                write!(
                    f,
                    "No reply from queue '{}' within {}s",
                    queue,
                    timeout.as_secs_f64()
                )
            }
            Self::RemoteError { code, message } => {
                write!(f, "Worker failed with {}: {}", code, message)
            }
            Self::TransportError { details } => {
                write!(f, "Transport error: {}", details)
            }
            Self::EncodingError { details } => {
                write!(f, "Encoding error: {}", details)
            }
            Self::TaskNotFound { task_id } => {
                write!(f, "Task '{}' not found", task_id)
            }
            Self::InvalidTaskState {
                task_id,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Task '{}' is in invalid state: expected '{}', got '{}'",
                    task_id, expected, actual
                )
            }
            Self::Unavailable { reason } => {
                write!(f, "Service unavailable: {}", reason)
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
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
        CoreError::EncodingError {
            details: err.to_string(),
        }
    }
}

impl From<RpcError> for CoreError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::NoSubscriber { queue } => CoreError::NoSubscriber { queue },
            RpcError::TimedOut { queue, timeout } => CoreError::Timeout { queue, timeout },
            RpcError::Remote { code, message } => CoreError::RemoteError { code, message },
            other => CoreError::TransportError {
                details: other.to_string(),
            },
        }
    }
}

impl From<TaskError> for CoreError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::NotFound(task_id) => CoreError::TaskNotFound {
                task_id: task_id.to_string(),
            },
            TaskError::InvalidTransition { task_id, from, to } => CoreError::InvalidTaskState {
                task_id: task_id.to_string(),
                expected: "pending".to_string(),
                actual: format!("{from} (attempted {to})"),
            },
            TaskError::Closed => CoreError::Unavailable {
                reason: "task executor is shut down".to_string(),
            },
            TaskError::Store(inner) => inner,
        }
    }
}
