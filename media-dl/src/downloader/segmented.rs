//! Segmented (HLS/DASH) driver.
//!
//! The segment list is resolved once per task and persisted; later runs
//! (resume, retry, restart after a crash) work from the persisted table and
//! only fetch segments that are not completed. Segments are fetched with
//! bounded concurrency, each under the task's retry policy. A segment whose
//! retries are exhausted is marked `failed` and the remaining segments keep
//! going; the task fails at the end if the failed share exceeds the
//! configured tolerance. Completed segments are concatenated in index order.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use super::DownloadError;
use super::driver::{
    DownloadDriver, DownloadHandle, DriverEvent, finalize_output, segment_file, segments_dir,
};
use super::engine::{ByteRange, FetchRequest, Transport};
use super::resolver::{ResolvedPlaylist, SegmentResolver};
use super::retry::retry_with_backoff;
use crate::database::models::{SegmentDbModel, SegmentStatus};
use crate::database::repositories::TaskRepository;
use crate::domain::{ErrorKind, SegmentProgress, TaskStage};

/// Settings of the segmented driver.
#[derive(Debug, Clone, Copy)]
pub struct SegmentedConfig {
    /// Segments fetched in parallel within one task.
    pub concurrency: usize,
    /// Share of permanently failed segments (0.0..=1.0) a task may tolerate.
    pub failure_tolerance: f64,
}

impl Default for SegmentedConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            failure_tolerance: 0.0,
        }
    }
}

pub struct SegmentedDriver {
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn SegmentResolver>,
    repo: Arc<dyn TaskRepository>,
    config: SegmentedConfig,
}

/// Running counters of one run.
struct Tally {
    progress: SegmentProgress,
    downloaded_bytes: u64,
    failed_indices: Vec<u32>,
}

impl SegmentedDriver {
    pub fn new(
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn SegmentResolver>,
        repo: Arc<dyn TaskRepository>,
        config: SegmentedConfig,
    ) -> Self {
        Self {
            transport,
            resolver,
            repo,
            config,
        }
    }

    /// Load the persisted segment table, resolving the playlist on first use.
    async fn load_segments(
        &self,
        handle: &DownloadHandle,
    ) -> Result<(Vec<SegmentDbModel>, Option<ResolvedPlaylist>), DownloadError> {
        let task_id = handle.id();
        let existing = self.repo.list_segments(task_id).await?;
        if !existing.is_empty() {
            debug!(task_id = %task_id, segments = existing.len(), "Using persisted segment list");
            return Ok((existing, None));
        }

        let spec = &handle.task.spec;
        let playlist = tokio::select! {
            _ = handle.cancellation_token.cancelled() => return Err(DownloadError::Cancelled),
            playlist = self.resolver.resolve(spec, self.transport.as_ref()) => playlist?,
        };

        if playlist.drm_protected {
            return Err(DownloadError::DrmProtected {
                reason: format!("encrypted segments in {}", spec.url),
            });
        }
        if playlist.live {
            return Err(DownloadError::LiveStream {
                url: spec.url.clone(),
            });
        }
        if playlist.segments.is_empty() {
            return Err(DownloadError::playlist(format!(
                "{} contains no segments",
                spec.url
            )));
        }

        let rows: Vec<SegmentDbModel> = playlist
            .segments
            .iter()
            .enumerate()
            .map(|(index, segment)| {
                let mut row = SegmentDbModel::new(task_id, index as u32, &segment.url);
                row.range_offset = segment.range.map(|r| r.offset as i64);
                row.range_length = segment.range.and_then(|r| r.length).map(|l| l as i64);
                row.duration_secs = segment.duration_secs;
                row
            })
            .collect();

        self.repo.ensure_segments(task_id, &rows).await?;
        info!(task_id = %task_id, segments = rows.len(), "Resolved segment list");
        Ok((self.repo.list_segments(task_id).await?, Some(playlist)))
    }

    /// Fetch one segment into `path`, returning its size.
    async fn fetch_segment(
        &self,
        handle: &DownloadHandle,
        segment: &SegmentDbModel,
        path: &Path,
    ) -> Result<u64, DownloadError> {
        let token = &handle.cancellation_token;
        let range = segment.range_offset.map(|offset| match segment.range_length {
            Some(length) => ByteRange::new(offset as u64, length as u64),
            None => ByteRange::from_offset(offset as u64),
        });
        let request = FetchRequest::new(&segment.url)
            .with_headers(handle.task.spec.headers.clone())
            .with_range(range);

        let response = tokio::select! {
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            response = self.transport.fetch(request) => response?,
        };
        if range.is_some() && !response.range_honoured {
            return Err(DownloadError::RangeNotSupported {
                url: segment.url.clone(),
            });
        }

        let expected = range.and_then(|r| r.length).or(response.total_size);
        let file = File::create(path).await?;
        let mut writer = BufWriter::new(file);
        let mut body = response.body;
        let mut written = 0u64;
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
                next = body.next() => next,
            };
            match next {
                Some(chunk) => {
                    let chunk = chunk?;
                    writer.write_all(&chunk).await?;
                    written += chunk.len() as u64;
                }
                None => break,
            }
        }
        writer.flush().await?;

        if let Some(expected) = expected
            && written < expected
        {
            return Err(DownloadError::network(format!(
                "segment {} truncated at {} of {} bytes",
                segment.segment_index, written, expected
            )));
        }
        Ok(written)
    }

    /// Run one segment under the retry policy and persist the outcome.
    async fn process_segment(
        &self,
        handle: &DownloadHandle,
        dir: &Path,
        mut segment: SegmentDbModel,
    ) -> (SegmentDbModel, Result<u64, DownloadError>) {
        let path = segment_file(dir, segment.index());
        segment.set_status(SegmentStatus::Downloading);
        segment.temp_path = Some(path.to_string_lossy().into_owned());
        if let Err(e) = self.repo.update_segment(&segment).await {
            return (segment, Err(e.into()));
        }

        let mut attempts = 0u32;
        let label = format!("segment {}", segment.segment_index);
        let result = retry_with_backoff(
            &handle.retry_policy,
            &handle.cancellation_token,
            &label,
            |attempt| {
                attempts = attempt;
                let mut row = segment.clone();
                let path = &path;
                async move {
                    if attempt > 0 {
                        row.retry_count = i64::from(attempt);
                        self.repo.update_segment(&row).await?;
                    }
                    self.fetch_segment(handle, &row, path).await
                }
            },
        )
        .await;
        segment.retry_count = i64::from(attempts);

        match &result {
            Ok(size) => {
                segment.set_status(SegmentStatus::Completed);
                segment.size_bytes = Some(*size as i64);
                segment.error_message = None;
            }
            Err(e) if e.is_cancelled() => {
                segment.set_status(SegmentStatus::Pending);
            }
            Err(e) => {
                segment.set_status(SegmentStatus::Failed);
                segment.error_message = Some(e.to_string());
            }
        }
        if let Err(e) = self.repo.update_segment(&segment).await {
            return (segment, Err(e.into()));
        }
        (segment, result)
    }

    /// Concatenate completed segments by index into the output file.
    async fn concatenate(
        &self,
        handle: &DownloadHandle,
        dir: &Path,
        segments: &[SegmentDbModel],
    ) -> Result<PathBuf, DownloadError> {
        let concat_err = |e: std::io::Error| DownloadError::Concat {
            reason: e.to_string(),
        };

        let part = handle.part_path();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&part)
            .await
            .map_err(concat_err)?;
        let mut writer = BufWriter::new(file);

        for segment in segments
            .iter()
            .filter(|s| s.status() == SegmentStatus::Completed)
        {
            if handle.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            let mut input = File::open(segment_file(dir, segment.index()))
                .await
                .map_err(concat_err)?;
            tokio::io::copy(&mut input, &mut writer)
                .await
                .map_err(concat_err)?;
        }

        writer.flush().await.map_err(concat_err)?;
        writer.get_ref().sync_all().await.map_err(concat_err)?;
        drop(writer);
        finalize_output(&part, &handle.output_path)
            .await
            .map_err(concat_err)
    }
}

#[async_trait]
impl DownloadDriver for SegmentedDriver {
    async fn run(&self, handle: Arc<DownloadHandle>) -> Result<PathBuf, DownloadError> {
        let task_id = handle.id().to_string();
        let dir = segments_dir(handle.save_dir(), &task_id);
        tokio::fs::create_dir_all(&dir).await?;

        let (mut segments, playlist) = self.load_segments(&handle).await?;

        // Completed rows whose file vanished are fetched again.
        for segment in segments.iter_mut() {
            if segment.status() == SegmentStatus::Completed
                && !tokio::fs::try_exists(segment_file(&dir, segment.index()))
                    .await
                    .unwrap_or(false)
            {
                warn!(
                    task_id = %task_id,
                    segment = segment.segment_index,
                    "Segment file missing, refetching"
                );
                segment.set_status(SegmentStatus::Pending);
                self.repo.update_segment(segment).await?;
            }
        }

        let previous = handle.task.progress.segments.clone().unwrap_or_default();
        let total = segments.len() as u32;
        let mut tally = Tally {
            progress: SegmentProgress {
                total: Some(total),
                downloaded: 0,
                failed: 0,
                current_index: None,
                target_duration_secs: playlist
                    .as_ref()
                    .and_then(|p| p.target_duration_secs)
                    .or(previous.target_duration_secs),
                media_sequence: playlist
                    .as_ref()
                    .and_then(|p| p.media_sequence)
                    .or(previous.media_sequence),
            },
            downloaded_bytes: 0,
            failed_indices: Vec::new(),
        };

        let mut pending = Vec::new();
        for segment in &segments {
            if segment.status() == SegmentStatus::Completed {
                tally.progress.downloaded += 1;
                tally.downloaded_bytes += segment.size_bytes.unwrap_or(0).max(0) as u64;
            } else {
                pending.push(segment.clone());
            }
        }
        handle.report(DriverEvent::Segments {
            segments: tally.progress.clone(),
            downloaded_bytes: tally.downloaded_bytes,
        });

        info!(
            task_id = %task_id,
            total,
            pending = pending.len(),
            concurrency = self.config.concurrency,
            "Fetching segments"
        );

        let mut queue = pending.into_iter();
        let mut in_flight = FuturesUnordered::new();
        for segment in queue.by_ref().take(self.config.concurrency.max(1)) {
            in_flight.push(self.process_segment(&handle, &dir, segment));
        }

        while let Some((segment, result)) = in_flight.next().await {
            let index = segment.index();
            match result {
                Ok(size) => {
                    tally.progress.downloaded += 1;
                    tally.downloaded_bytes += size;
                }
                Err(e) if e.is_cancelled() => {
                    drop(in_flight);
                    self.repo.reset_downloading_segments(&task_id).await?;
                    return Err(e);
                }
                Err(e)
                    if matches!(
                        e.to_task_error().kind(),
                        ErrorKind::Filesystem | ErrorKind::Policy
                    ) =>
                {
                    warn!(
                        task_id = %task_id,
                        segment = index,
                        error = %e,
                        "Aborting segmented download"
                    );
                    drop(in_flight);
                    self.repo.reset_downloading_segments(&task_id).await?;
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        task_id = %task_id,
                        segment = index,
                        error = %e,
                        "Segment failed permanently"
                    );
                    tally.progress.failed += 1;
                    tally.failed_indices.push(index);
                }
            }

            tally.progress.current_index = Some(index);
            handle.report(DriverEvent::Segments {
                segments: tally.progress.clone(),
                downloaded_bytes: tally.downloaded_bytes,
            });

            if let Some(next) = queue.next() {
                in_flight.push(self.process_segment(&handle, &dir, next));
            }
        }
        drop(in_flight);
        handle
            .emit(DriverEvent::Segments {
                segments: tally.progress.clone(),
                downloaded_bytes: tally.downloaded_bytes,
            })
            .await;

        let failed = tally.progress.failed;
        if failed > 0 && f64::from(failed) / f64::from(total) > self.config.failure_tolerance {
            tally.failed_indices.sort_unstable();
            return Err(DownloadError::SegmentsFailed {
                failed,
                total,
                indices: tally.failed_indices,
            });
        }

        self.repo.set_stage(&task_id, TaskStage::Finalizing).await?;
        handle.emit(DriverEvent::Stage(TaskStage::Finalizing)).await;

        // Failed rows within tolerance are skipped.
        let segments = self.repo.list_segments(&task_id).await?;
        let output = self.concatenate(&handle, &dir, &segments).await?;

        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            warn!(task_id = %task_id, error = %e, "Failed to remove segment directory");
        }
        info!(
            task_id = %task_id,
            path = %output.display(),
            segments = total,
            "Segmented download finished"
        );
        Ok(output)
    }
}
