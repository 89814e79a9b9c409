//! Driver-level download errors.
//!
//! A [`DownloadError`] is classified into a [`TaskError`] exactly once, where
//! the failure happens; the scheduler only ever sees the classified form.

use reqwest::StatusCode;
use std::error::Error as _;

use crate::domain::{ErrorCode, TaskError};

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("URL `{url}` rejected: {reason}")]
    UnsafeUrl { url: String, reason: String },

    #[error("unsupported protocol `{protocol}`")]
    UnsupportedProtocol { protocol: String },

    #[error("HTTP request failed: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    #[error("network error: {reason}")]
    Network { reason: String },

    #[error("connection refused by {url}")]
    ConnectionRefused { url: String },

    #[error("DNS lookup failed for {host}")]
    DnsFailure { host: String },

    #[error("operation timed out: {reason}")]
    Timeout { reason: String },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("server ignored the range request for {url}")]
    RangeNotSupported { url: String },

    #[error("media is DRM protected: {reason}")]
    DrmProtected { reason: String },

    #[error("live streams cannot be downloaded to completion: {url}")]
    LiveStream { url: String },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("{failed} of {total} segments failed")]
    SegmentsFailed {
        failed: u32,
        total: u32,
        indices: Vec<u32>,
    },

    #[error("failed to concatenate segments: {reason}")]
    Concat { reason: String },

    #[error("task store error: {source}")]
    Storage {
        #[from]
        source: crate::Error,
    },
}

impl DownloadError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::Timeout {
            reason: reason.into(),
        }
    }

    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network {
            reason: reason.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_retryable(&self) -> bool {
        self.to_task_error().retryable
    }

    /// Classify into the task-visible error taxonomy.
    pub fn to_task_error(&self) -> TaskError {
        let message = self.to_string();
        match self {
            Self::Cancelled => TaskError::fatal(ErrorCode::Canceled, message),
            Self::InvalidUrl { .. } => TaskError::fatal(ErrorCode::InvalidUrl, message),
            Self::UnsafeUrl { .. } => TaskError::fatal(ErrorCode::UnsafeUrl, message),
            Self::UnsupportedProtocol { .. } | Self::Playlist { .. } => {
                TaskError::fatal(ErrorCode::UnsupportedProtocol, message)
            }
            Self::Http { source } => TaskError::new(classify_reqwest(source), message),
            Self::Network { .. } => TaskError::new(ErrorCode::NetworkError, message),
            Self::ConnectionRefused { .. } => TaskError::new(ErrorCode::ConnectionRefused, message),
            Self::DnsFailure { .. } => TaskError::new(ErrorCode::DnsFailure, message),
            Self::Timeout { .. } => TaskError::new(ErrorCode::Timeout, message),
            Self::HttpStatus { status, .. } => {
                let retryable =
                    status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS;
                TaskError {
                    retryable,
                    ..TaskError::new(ErrorCode::HttpError, message)
                }
                .with_details(serde_json::json!({ "status": status.as_u16() }))
            }
            Self::Io { source } => TaskError::fatal(classify_io(source), message),
            Self::RangeNotSupported { .. } => {
                TaskError::fatal(ErrorCode::RangeNotSupported, message)
            }
            Self::DrmProtected { .. } => TaskError::fatal(ErrorCode::DrmProtected, message),
            Self::LiveStream { .. } => TaskError::fatal(ErrorCode::LiveStreamUnsupported, message),
            Self::SegmentsFailed {
                failed,
                total,
                indices,
            } => TaskError::new(ErrorCode::SegmentsFailed, message).with_details(
                serde_json::json!({
                    "failed": failed,
                    "total": total,
                    "failed_indices": indices,
                }),
            ),
            Self::Concat { .. } => TaskError::fatal(ErrorCode::ConcatFailed, message),
            Self::Storage { .. } => TaskError::fatal(ErrorCode::FilesystemError, message),
        }
    }
}

fn classify_io(err: &std::io::Error) -> ErrorCode {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::NotFound => ErrorCode::FileNotFound,
        ErrorKind::PermissionDenied | ErrorKind::ReadOnlyFilesystem => ErrorCode::PermissionDenied,
        ErrorKind::StorageFull => ErrorCode::DiskFull,
        _ => ErrorCode::FilesystemError,
    }
}

fn classify_reqwest(err: &reqwest::Error) -> ErrorCode {
    if err.is_timeout() {
        return ErrorCode::Timeout;
    }
    if err.is_connect() {
        let mut source = err.source();
        while let Some(inner) = source {
            let text = inner.to_string().to_ascii_lowercase();
            if text.contains("dns") || text.contains("failed to lookup") {
                return ErrorCode::DnsFailure;
            }
            if text.contains("refused") {
                return ErrorCode::ConnectionRefused;
            }
            source = inner.source();
        }
    }
    ErrorCode::NetworkError
}
