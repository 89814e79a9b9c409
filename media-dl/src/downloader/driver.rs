//! Driver abstraction shared by the simple and segmented downloaders.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::DownloadError;
use crate::domain::{DownloadTask, RetryPolicy, SegmentProgress, TaskStage};

/// Highest ` (n)` suffix tried before giving up on an output name.
const MAX_OUTPUT_SUFFIX: u32 = 1000;

/// Event a driver reports to its supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    /// Absolute byte counters of a single-stream transfer.
    Bytes { downloaded: u64, total: Option<u64> },
    /// Segment counters of a segmented transfer.
    Segments {
        segments: SegmentProgress,
        downloaded_bytes: u64,
    },
    /// The transfer started over from byte 0.
    Restarted { reason: String },
    /// The task moved to another stage.
    Stage(TaskStage),
}

/// Handle to one running download.
#[derive(Debug)]
pub struct DownloadHandle {
    /// Snapshot of the task taken when it was started.
    pub task: DownloadTask,
    /// Preferred output file; the final name may carry a ` (n)` suffix.
    pub output_path: PathBuf,
    /// Effective retry policy.
    pub retry_policy: RetryPolicy,
    pub cancellation_token: CancellationToken,
    pub event_tx: mpsc::Sender<DriverEvent>,
    pub started_at: DateTime<Utc>,
}

impl DownloadHandle {
    pub fn new(
        task: DownloadTask,
        output_path: PathBuf,
        retry_policy: RetryPolicy,
        event_tx: mpsc::Sender<DriverEvent>,
    ) -> Self {
        Self {
            task,
            output_path,
            retry_policy,
            cancellation_token: CancellationToken::new(),
            event_tx,
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.task.id
    }

    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Report a progress sample. Samples are dropped when the supervisor lags.
    pub fn report(&self, event: DriverEvent) {
        let _ = self.event_tx.try_send(event);
    }

    /// Send an event that must not be lost.
    pub async fn emit(&self, event: DriverEvent) {
        if self.event_tx.send(event).await.is_err() {
            debug!(task_id = %self.task.id, "Supervisor gone, event dropped");
        }
    }

    /// Directory holding the output file.
    pub fn save_dir(&self) -> &Path {
        self.output_path.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn part_path(&self) -> PathBuf {
        part_path(self.save_dir(), self.id())
    }
}

/// Performs the transfer of one task.
#[async_trait]
pub trait DownloadDriver: Send + Sync {
    /// Run the task to completion and return the output path.
    ///
    /// Must return [`DownloadError::Cancelled`] promptly once the handle's
    /// token is cancelled, leaving partial data on disk for a later resume.
    async fn run(&self, handle: Arc<DownloadHandle>) -> Result<PathBuf, DownloadError>;
}

/// Partial file of a task, next to its output. Keyed by task id so tasks
/// with the same output name never share it.
pub fn part_path(save_dir: &Path, task_id: &str) -> PathBuf {
    save_dir.join(format!(".{}.part", task_id))
}

/// Directory holding the segment files of a task.
pub fn segments_dir(save_dir: &Path, task_id: &str) -> PathBuf {
    save_dir.join(format!(".{}.parts", task_id))
}

/// File of one segment inside [`segments_dir`].
pub fn segment_file(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("{:06}.seg", index))
}

/// `video.mp4` -> `video (n).mp4`; `n = 0` is the target itself.
fn numbered_path(target: &Path, n: u32) -> PathBuf {
    if n == 0 {
        return target.to_path_buf();
    }
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match target.extension() {
        Some(ext) => format!("{} ({}).{}", stem, n, ext.to_string_lossy()),
        None => format!("{} ({})", stem, n),
    };
    target.with_file_name(name)
}

/// Move a finished partial file to `target`, or to the first free
/// `name (n).ext` beside it when `target` is taken. Returns the final path.
///
/// The name is claimed with `create_new` before the rename, so two tasks
/// finishing at once never pick the same file.
pub async fn finalize_output(part: &Path, target: &Path) -> std::io::Result<PathBuf> {
    for n in 0..MAX_OUTPUT_SUFFIX {
        let candidate = numbered_path(target, n);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }

        if let Err(e) = tokio::fs::rename(part, &candidate).await {
            let _ = tokio::fs::remove_file(&candidate).await;
            return Err(e);
        }
        return Ok(candidate);
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free file name for {}", target.display()),
    ))
}

/// Remove every partial artifact of a task. Missing files are not an error.
pub async fn remove_partials(save_dir: &Path, task_id: &str) -> std::io::Result<()> {
    match tokio::fs::remove_file(part_path(save_dir, task_id)).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    match tokio::fs::remove_dir_all(segments_dir(save_dir, task_id)).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DownloadSpec, MediaType};

    #[test]
    fn test_paths() {
        assert_eq!(part_path(Path::new("/data"), "abc"), PathBuf::from("/data/.abc.part"));
        assert_eq!(
            numbered_path(Path::new("/data/video.mp4"), 2),
            PathBuf::from("/data/video (2).mp4")
        );
        assert_eq!(numbered_path(Path::new("/data/raw"), 1), PathBuf::from("/data/raw (1)"));

        let dir = segments_dir(Path::new("/data"), "abc");
        assert_eq!(dir, PathBuf::from("/data/.abc.parts"));
        assert_eq!(segment_file(&dir, 7), PathBuf::from("/data/.abc.parts/000007.seg"));
    }

    #[tokio::test]
    async fn test_remove_partials() {
        let tmp = tempfile::tempdir().unwrap();
        let part = part_path(tmp.path(), "t1");
        tokio::fs::write(&part, b"partial").await.unwrap();
        let other = part_path(tmp.path(), "t2");
        tokio::fs::write(&other, b"other").await.unwrap();
        let dir = segments_dir(tmp.path(), "t1");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(segment_file(&dir, 0), b"seg").await.unwrap();

        remove_partials(tmp.path(), "t1").await.unwrap();
        assert!(!part.exists());
        assert!(!dir.exists());
        assert!(other.exists());

        // Nothing left to remove.
        remove_partials(tmp.path(), "t1").await.unwrap();
    }

    #[tokio::test]
    async fn test_finalize_output_picks_free_name() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("video.mp4");

        let first = part_path(tmp.path(), "a");
        tokio::fs::write(&first, b"A").await.unwrap();
        assert_eq!(finalize_output(&first, &target).await.unwrap(), target);

        let second = part_path(tmp.path(), "b");
        tokio::fs::write(&second, b"B").await.unwrap();
        let path = finalize_output(&second, &target).await.unwrap();

        assert_eq!(path, tmp.path().join("video (1).mp4"));
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"A");
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"B");
        assert!(!first.exists() && !second.exists());
    }

    #[tokio::test]
    async fn test_report_is_lossy_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let task = DownloadTask::new(DownloadSpec::new("https://x/a", MediaType::File));
        let handle = DownloadHandle::new(
            task,
            PathBuf::from("/tmp/a"),
            RetryPolicy::no_retry(),
            tx,
        );

        handle.report(DriverEvent::Bytes {
            downloaded: 1,
            total: None,
        });
        handle.report(DriverEvent::Bytes {
            downloaded: 2,
            total: None,
        });

        assert_eq!(
            rx.recv().await,
            Some(DriverEvent::Bytes {
                downloaded: 1,
                total: None
            })
        );
        assert!(rx.try_recv().is_err());
    }
}
