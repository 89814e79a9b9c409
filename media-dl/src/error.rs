//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
///
/// These are caller-facing failures of a command or a repository operation.
/// Failures of a transfer itself are recorded on the task as a
/// [`TaskError`](crate::domain::TaskError) instead.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Retry rejected for task {id}: {reason}")]
    RetryRejected { id: String, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn task_not_found(id: impl Into<String>) -> Self {
        Self::not_found("Task", id)
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Stable code reported to the presentation layer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) | Self::Serialization(_) => "INVALID_ARGUMENT",
            Self::NotFound { .. } => "TASK_NOT_FOUND",
            Self::InvalidStateTransition { .. } => "INVALID_STATE",
            Self::RetryRejected { .. } => "RETRY_REJECTED",
            Self::DatabaseSqlx(_) | Self::Database(_) | Self::Migration(_) | Self::Io(_) => {
                "STORAGE_ERROR"
            }
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Other(_) => "INTERNAL",
        }
    }

    /// Whether this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::task_not_found("abc").code(), "TASK_NOT_FOUND");
        assert_eq!(
            Error::invalid_argument("url is empty").code(),
            "INVALID_ARGUMENT"
        );
        assert_eq!(
            Error::invalid_transition("COMPLETED", "RUNNING").code(),
            "INVALID_STATE"
        );
        assert_eq!(
            Error::RetryRejected {
                id: "t".into(),
                reason: "not retryable".into()
            }
            .code(),
            "RETRY_REJECTED"
        );
    }

    #[test]
    fn test_not_found_message() {
        let err = Error::task_not_found("abc");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Entity not found: Task with id abc");
    }
}
