//! Download task entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::{TaskStage, TaskStatus};
use crate::domain::{DownloadProgress, DownloadSpec, TaskError};
use crate::{Error, Result};

/// A single download with its persisted lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: String,
    pub spec: DownloadSpec,
    pub status: TaskStatus,
    pub stage: TaskStage,
    pub progress: DownloadProgress,
    pub error: Option<TaskError>,
    /// Number of user-initiated retries (not in-flight attempts).
    pub retry_count: u32,
    pub output_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadTask {
    /// Create a queued task.
    pub fn new(spec: DownloadSpec) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            spec,
            status: TaskStatus::Queued,
            stage: TaskStage::Transfer,
            progress: DownloadProgress::default(),
            error: None,
            retry_count: 0,
            output_path: None,
            created_at: now,
            started_at: None,
            paused_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Create a task rejected at admission; it starts in `error`.
    pub fn rejected(spec: DownloadSpec, error: TaskError) -> Self {
        Self {
            status: TaskStatus::Error,
            error: Some(error),
            ..Self::new(spec)
        }
    }

    fn transition(&mut self, target: TaskStatus) -> Result<()> {
        self.status = self.status.transition_to(target)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// `queued -> running`.
    pub fn mark_running(&mut self) -> Result<()> {
        self.transition(TaskStatus::Running)?;
        self.started_at = Some(self.updated_at);
        self.stage = TaskStage::Transfer;
        Ok(())
    }

    /// `running -> paused`.
    pub fn mark_paused(&mut self) -> Result<()> {
        self.transition(TaskStatus::Paused)?;
        self.paused_at = Some(self.updated_at);
        self.progress.clear_rates();
        Ok(())
    }

    /// `paused -> queued` on resume, `running -> queued` on shutdown/recovery.
    pub fn mark_queued(&mut self) -> Result<()> {
        if self.status == TaskStatus::Error {
            return Err(Error::invalid_transition(self.status, TaskStatus::Queued));
        }
        self.transition(TaskStatus::Queued)?;
        self.progress.clear_rates();
        Ok(())
    }

    /// `running -> completed`.
    pub fn mark_completed(&mut self, output_path: PathBuf) -> Result<()> {
        self.transition(TaskStatus::Completed)?;
        self.completed_at = Some(self.updated_at);
        self.output_path = Some(output_path);
        self.error = None;
        if let Some(total) = self.progress.total_bytes {
            self.progress.downloaded_bytes = self.progress.downloaded_bytes.max(total);
        } else {
            self.progress.total_bytes = Some(self.progress.downloaded_bytes);
        }
        self.progress.clear_rates();
        self.progress.recompute_percent();
        self.progress.percent = 100.0;
        Ok(())
    }

    /// `running -> error`.
    pub fn mark_failed(&mut self, error: TaskError) -> Result<()> {
        self.transition(TaskStatus::Error)?;
        self.error = Some(error);
        self.progress.clear_rates();
        Ok(())
    }

    /// Any non-terminal status `-> canceled`.
    pub fn mark_canceled(&mut self) -> Result<()> {
        self.transition(TaskStatus::Canceled)?;
        self.progress.clear_rates();
        Ok(())
    }

    /// `error -> queued`, only when the last error is retryable.
    ///
    /// Keeps byte/segment progress and bumps the cumulative retry counter.
    pub fn prepare_retry(&mut self) -> Result<()> {
        let Some(error) = &self.error else {
            return Err(Error::RetryRejected {
                id: self.id.clone(),
                reason: format!("task is {}, not in error", self.status),
            });
        };
        if self.status != TaskStatus::Error {
            return Err(Error::RetryRejected {
                id: self.id.clone(),
                reason: format!("task is {}, not in error", self.status),
            });
        }
        if !error.retryable {
            return Err(Error::RetryRejected {
                id: self.id.clone(),
                reason: format!("error {} is not retryable", error.code),
            });
        }

        self.transition(TaskStatus::Queued)?;
        self.error = None;
        self.stage = TaskStage::Transfer;
        self.retry_count += 1;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Effective save directory.
    pub fn save_dir(&self, default_dir: &std::path::Path) -> PathBuf {
        self.spec
            .save_dir
            .clone()
            .unwrap_or_else(|| default_dir.to_path_buf())
    }

    /// Final output path under `default_dir` unless the spec names a directory.
    pub fn target_path(&self, default_dir: &std::path::Path) -> PathBuf {
        self.save_dir(default_dir)
            .join(self.spec.resolved_filename(&self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErrorCode, MediaType};

    fn task() -> DownloadTask {
        DownloadTask::new(DownloadSpec::new("https://x/a.mp4", MediaType::File))
    }

    #[test]
    fn test_new_task_is_queued() {
        let task = task();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.started_at.is_none());
        assert!(!task.id.is_empty());
    }

    #[test]
    fn test_lifecycle_timestamps() {
        let mut task = task();
        task.mark_running().unwrap();
        assert!(task.started_at.is_some());
        task.mark_paused().unwrap();
        assert!(task.paused_at.is_some());
        task.mark_queued().unwrap();
        task.mark_running().unwrap();
        task.progress = DownloadProgress::with_bytes(10, Some(10));
        task.mark_completed(PathBuf::from("/tmp/a.mp4")).unwrap();
        assert!(task.completed_at.is_some());
        assert_eq!(task.progress.percent, 100.0);
        assert!(task.mark_canceled().is_err());
    }

    #[test]
    fn test_retry_requires_retryable_error() {
        let mut task = task();
        task.mark_running().unwrap();
        task.mark_failed(TaskError::new(ErrorCode::DiskFull, "no space"))
            .unwrap();

        let err = task.prepare_retry().unwrap_err();
        assert!(matches!(err, Error::RetryRejected { .. }));
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.retry_count, 0);
    }

    #[test]
    fn test_retry_keeps_progress() {
        let mut task = task();
        task.mark_running().unwrap();
        task.progress = DownloadProgress::with_bytes(500, Some(1000));
        task.mark_failed(TaskError::new(ErrorCode::Timeout, "slow"))
            .unwrap();

        task.prepare_retry().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.progress.downloaded_bytes, 500);
        assert_eq!(task.retry_count, 1);
        assert!(task.error.is_none());
    }

    #[test]
    fn test_rejected_task_is_in_error() {
        let task = DownloadTask::rejected(
            DownloadSpec::new("https://x/a.m3u8", MediaType::Hls),
            TaskError::fatal(ErrorCode::DrmProtected, "drm"),
        );
        assert_eq!(task.status, TaskStatus::Error);
        assert!(!task.error.as_ref().unwrap().retryable);
    }

    #[test]
    fn test_target_path() {
        let task = DownloadTask::new(
            DownloadSpec::new("https://x/v/a.mp4", MediaType::File).with_save_dir("/data"),
        );
        assert_eq!(
            task.target_path(std::path::Path::new("/default")),
            PathBuf::from("/data/a.mp4")
        );
    }
}
