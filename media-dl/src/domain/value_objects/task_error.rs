//! Task error value object and the error taxonomy.

use serde::{Deserialize, Serialize};

/// Broad family an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Transient transport failures.
    Network,
    /// Local storage failures; need user action.
    Filesystem,
    /// The media itself cannot be downloaded (DRM, live, protocol, URL policy).
    Policy,
    /// Failures of the segmented download as a whole.
    Orchestration,
    /// Caller errors.
    Application,
}

/// Closed set of error codes attached to failed tasks.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NetworkError,
    ConnectionRefused,
    DnsFailure,
    Timeout,
    HttpError,
    FileNotFound,
    PermissionDenied,
    DiskFull,
    FilesystemError,
    DrmProtected,
    LiveStreamUnsupported,
    UnsupportedProtocol,
    InvalidUrl,
    UnsafeUrl,
    RangeNotSupported,
    SegmentsFailed,
    ConcatFailed,
    Interrupted,
    TaskNotFound,
    AlreadyExists,
    Canceled,
}

impl ErrorCode {
    /// Family of this code.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NetworkError
            | Self::ConnectionRefused
            | Self::DnsFailure
            | Self::Timeout
            | Self::HttpError => ErrorKind::Network,
            Self::FileNotFound | Self::PermissionDenied | Self::DiskFull | Self::FilesystemError => {
                ErrorKind::Filesystem
            }
            Self::DrmProtected
            | Self::LiveStreamUnsupported
            | Self::UnsupportedProtocol
            | Self::InvalidUrl
            | Self::UnsafeUrl
            | Self::RangeNotSupported => ErrorKind::Policy,
            Self::SegmentsFailed | Self::ConcatFailed | Self::Interrupted => {
                ErrorKind::Orchestration
            }
            Self::TaskNotFound | Self::AlreadyExists | Self::Canceled => ErrorKind::Application,
        }
    }

    /// Default retryability of the code.
    ///
    /// `HTTP_ERROR` is retryable here; fatal 4xx statuses are classified as
    /// non-retryable where the status is known.
    pub fn is_retryable(&self) -> bool {
        match self.kind() {
            ErrorKind::Network => true,
            ErrorKind::Orchestration => matches!(self, Self::SegmentsFailed | Self::Interrupted),
            ErrorKind::Filesystem | ErrorKind::Policy | ErrorKind::Application => false,
        }
    }

    /// String representation stored in the database.
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Error recorded on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl TaskError {
    /// Create an error with the code's default retryability.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: code.is_retryable(),
            details: None,
        }
    }

    /// Create an error that is never retried.
    pub fn fatal(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::new(code, message)
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.code.kind()
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_code_string_round_trip() {
        assert_eq!(ErrorCode::DrmProtected.as_str(), "DRM_PROTECTED");
        assert_eq!(
            ErrorCode::from_str("LIVE_STREAM_UNSUPPORTED").unwrap(),
            ErrorCode::LiveStreamUnsupported
        );
        assert!(ErrorCode::from_str("NOPE").is_err());
    }

    #[test]
    fn test_taxonomy_retryability() {
        assert!(ErrorCode::Timeout.is_retryable());
        assert!(ErrorCode::ConnectionRefused.is_retryable());
        assert!(!ErrorCode::DiskFull.is_retryable());
        assert!(!ErrorCode::DrmProtected.is_retryable());
        assert!(!ErrorCode::ConcatFailed.is_retryable());
        assert!(ErrorCode::SegmentsFailed.is_retryable());
        assert!(!ErrorCode::TaskNotFound.is_retryable());
    }

    #[test]
    fn test_fatal_overrides_default() {
        let err = TaskError::fatal(ErrorCode::HttpError, "404 Not Found");
        assert!(!err.retryable);
        assert_eq!(err.kind(), ErrorKind::Network);
    }

    #[test]
    fn test_serialization() {
        let err = TaskError::new(ErrorCode::SegmentsFailed, "2 segments failed")
            .with_details(serde_json::json!({"failed": [3, 7]}));
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"SEGMENTS_FAILED\""));
        assert!(json.contains("\"retryable\":true"));
    }
}
