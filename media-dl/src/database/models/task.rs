//! Task database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::path::PathBuf;
use std::str::FromStr;

use crate::database::time::{datetime_to_ms, ms_to_datetime};
use crate::domain::{
    DownloadProgress, DownloadSpec, DownloadTask, ErrorCode, MediaType, TaskError, TaskStage,
    TaskStatus,
};
use crate::{Error, Result};

/// Row of the `tasks` table.
///
/// Structured fields (headers, variant, retry policy, metadata, segment
/// counters, error details) are stored as JSON text.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TaskDbModel {
    pub id: String,
    pub url: String,
    /// file, hls, dash
    pub media_type: String,
    pub filename: Option<String>,
    pub save_dir: Option<String>,
    pub headers: String,
    pub variant: Option<String>,
    pub retry_policy: Option<String>,
    pub custom_quality: Option<String>,
    pub priority: i64,
    pub metadata: String,
    pub drm_protected: bool,
    pub live: bool,
    /// queued, running, paused, completed, error, canceled
    pub status: String,
    /// transfer, finalizing
    pub stage: String,
    pub percent: f64,
    pub downloaded_bytes: i64,
    pub total_bytes: Option<i64>,
    pub segment_progress: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub error_retryable: Option<bool>,
    pub error_details: Option<String>,
    pub retry_count: i64,
    pub output_path: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub paused_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub updated_at: i64,
}

fn path_to_string(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}

impl TaskDbModel {
    /// Flatten a domain task into a row.
    pub fn from_domain(task: &DownloadTask) -> Result<Self> {
        let spec = &task.spec;
        let error = task.error.as_ref();

        Ok(Self {
            id: task.id.clone(),
            url: spec.url.clone(),
            media_type: spec.media_type.as_str().to_string(),
            filename: spec.filename.clone(),
            save_dir: spec.save_dir.as_deref().map(path_to_string),
            headers: serde_json::to_string(&spec.headers)?,
            variant: spec.variant.as_ref().map(serde_json::to_string).transpose()?,
            retry_policy: spec
                .retry_policy
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            custom_quality: spec.custom_quality.clone(),
            priority: i64::from(spec.priority),
            metadata: serde_json::to_string(&spec.metadata)?,
            drm_protected: spec.drm_protected,
            live: spec.live,
            status: task.status.as_str().to_string(),
            stage: task.stage.as_str().to_string(),
            percent: task.progress.percent,
            downloaded_bytes: to_i64(task.progress.downloaded_bytes),
            total_bytes: task.progress.total_bytes.map(to_i64),
            segment_progress: task
                .progress
                .segments
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            error_code: error.map(|e| e.code.as_str().to_string()),
            error_message: error.map(|e| e.message.clone()),
            error_retryable: error.map(|e| e.retryable),
            error_details: error
                .and_then(|e| e.details.as_ref())
                .map(serde_json::to_string)
                .transpose()?,
            retry_count: i64::from(task.retry_count),
            output_path: task.output_path.as_deref().map(path_to_string),
            created_at: datetime_to_ms(task.created_at),
            started_at: task.started_at.map(datetime_to_ms),
            paused_at: task.paused_at.map(datetime_to_ms),
            completed_at: task.completed_at.map(datetime_to_ms),
            updated_at: datetime_to_ms(task.updated_at),
        })
    }

    /// Rebuild the domain task from a row.
    pub fn into_domain(self) -> Result<DownloadTask> {
        let media_type = MediaType::parse(&self.media_type).ok_or_else(|| {
            Error::Database(format!(
                "task {} has unknown media type '{}'",
                self.id, self.media_type
            ))
        })?;
        let status = TaskStatus::parse(&self.status).ok_or_else(|| {
            Error::Database(format!(
                "task {} has unknown status '{}'",
                self.id, self.status
            ))
        })?;
        let stage = TaskStage::parse(&self.stage).unwrap_or_default();

        let spec = DownloadSpec {
            url: self.url,
            media_type,
            filename: self.filename,
            save_dir: self.save_dir.map(PathBuf::from),
            headers: serde_json::from_str(&self.headers)?,
            variant: self
                .variant
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            retry_policy: self
                .retry_policy
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            priority: i32::try_from(self.priority).unwrap_or_default(),
            custom_quality: self.custom_quality,
            metadata: serde_json::from_str(&self.metadata)?,
            drm_protected: self.drm_protected,
            live: self.live,
        };

        let error = match self.error_code {
            Some(code) => {
                let code = ErrorCode::from_str(&code).map_err(|_| {
                    Error::Database(format!("task {} has unknown error code '{}'", self.id, code))
                })?;
                Some(TaskError {
                    code,
                    message: self.error_message.unwrap_or_default(),
                    retryable: self.error_retryable.unwrap_or_else(|| code.is_retryable()),
                    details: self
                        .error_details
                        .as_deref()
                        .map(serde_json::from_str)
                        .transpose()?,
                })
            }
            None => None,
        };

        let progress = DownloadProgress {
            percent: self.percent,
            downloaded_bytes: to_u64(self.downloaded_bytes),
            total_bytes: self.total_bytes.map(to_u64),
            speed_bps: None,
            eta_ms: None,
            segments: self
                .segment_progress
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
        };

        Ok(DownloadTask {
            id: self.id,
            spec,
            status,
            stage,
            progress,
            error,
            retry_count: u32::try_from(self.retry_count).unwrap_or_default(),
            output_path: self.output_path.map(PathBuf::from),
            created_at: ms_to_datetime(self.created_at),
            started_at: self.started_at.map(ms_to_datetime),
            paused_at: self.paused_at.map(ms_to_datetime),
            completed_at: self.completed_at.map(ms_to_datetime),
            updated_at: ms_to_datetime(self.updated_at),
        })
    }
}

pub(crate) fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}
