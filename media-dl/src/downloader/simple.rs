//! Single-stream driver for plain files.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use super::DownloadError;
use super::driver::{DownloadDriver, DownloadHandle, DriverEvent, finalize_output};
use super::engine::{ByteRange, FetchRequest, Transport};
use super::retry::retry_with_backoff;

const WRITE_BUFFER_SIZE: usize = 256 * 1024;

/// What to do when a server ignores the range request of a resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeFallback {
    /// Fail the task with `RANGE_NOT_SUPPORTED`.
    #[default]
    Fail,
    /// Truncate the partial file and download from byte 0.
    Restart,
}

impl RangeFallback {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fail => "fail",
            Self::Restart => "restart",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "fail" => Some(Self::Fail),
            "restart" => Some(Self::Restart),
            _ => None,
        }
    }
}

/// Downloads one URL into the task's partial file and moves it to the
/// output on success.
///
/// The length of the partial file is the resume offset.
pub struct SimpleDriver {
    transport: Arc<dyn Transport>,
    range_fallback: RangeFallback,
}

impl SimpleDriver {
    pub fn new(transport: Arc<dyn Transport>, range_fallback: RangeFallback) -> Self {
        Self {
            transport,
            range_fallback,
        }
    }

    async fn attempt(
        &self,
        handle: &DownloadHandle,
        part: &Path,
        attempt: u32,
    ) -> Result<(), DownloadError> {
        let spec = &handle.task.spec;
        let token = &handle.cancellation_token;

        let offset = match tokio::fs::metadata(part).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        if offset > 0
            && let Some(total) = handle.task.progress.total_bytes
            && offset >= total
        {
            debug!(task_id = %handle.id(), offset, "Partial file already complete");
            return Ok(());
        }

        let range = (offset > 0).then(|| ByteRange::from_offset(offset));
        let request = FetchRequest::new(&spec.url)
            .with_headers(spec.headers.clone())
            .with_range(range);

        debug!(task_id = %handle.id(), attempt, offset, "Requesting file");
        let response = tokio::select! {
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            response = self.transport.fetch(request) => response?,
        };

        let mut written = offset;
        let file = if offset > 0 && !response.range_honoured {
            match self.range_fallback {
                RangeFallback::Fail => {
                    return Err(DownloadError::RangeNotSupported {
                        url: spec.url.clone(),
                    });
                }
                RangeFallback::Restart => {
                    warn!(
                        task_id = %handle.id(),
                        offset,
                        "Server ignored range request, restarting from zero"
                    );
                    handle
                        .emit(DriverEvent::Restarted {
                            reason: format!("range request at offset {} was ignored", offset),
                        })
                        .await;
                    written = 0;
                    OpenOptions::new()
                        .create(true)
                        .write(true)
                        .truncate(true)
                        .open(part)
                        .await?
                }
            }
        } else if offset > 0 {
            info!(task_id = %handle.id(), offset, "Resuming download");
            OpenOptions::new().append(true).open(part).await?
        } else {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(part)
                .await?
        };

        let total = response.total_size;
        handle.report(DriverEvent::Bytes {
            downloaded: written,
            total,
        });

        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
        let mut body = response.body;
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => {
                    writer.flush().await?;
                    return Err(DownloadError::Cancelled);
                }
                next = body.next() => next,
            };

            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    writer.flush().await?;
                    return Err(e);
                }
                None => break,
            };

            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
            handle.report(DriverEvent::Bytes {
                downloaded: written,
                total,
            });
        }

        writer.flush().await?;
        writer.get_ref().sync_data().await?;
        handle
            .emit(DriverEvent::Bytes {
                downloaded: written,
                total,
            })
            .await;

        if let Some(total) = total
            && written < total
        {
            return Err(DownloadError::network(format!(
                "connection closed after {} of {} bytes",
                written, total
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl DownloadDriver for SimpleDriver {
    async fn run(&self, handle: Arc<DownloadHandle>) -> Result<PathBuf, DownloadError> {
        tokio::fs::create_dir_all(handle.save_dir()).await?;
        let part = handle.part_path();

        retry_with_backoff(
            &handle.retry_policy,
            &handle.cancellation_token,
            "file",
            |attempt| self.attempt(&handle, &part, attempt),
        )
        .await?;

        let output = finalize_output(&part, &handle.output_path).await?;
        info!(task_id = %handle.id(), path = %output.display(), "Download finished");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DownloadSpec, DownloadTask, MediaType, RetryPolicy};
    use crate::downloader::engine::FetchResponse;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    /// Serves `data`; honours ranges only when `ranges` is set. The first
    /// `short_reads` responses are cut in half.
    struct FakeTransport {
        data: Vec<u8>,
        ranges: bool,
        short_reads: Mutex<u32>,
        requests: Mutex<Vec<Option<ByteRange>>>,
    }

    impl FakeTransport {
        fn new(data: &[u8], ranges: bool) -> Self {
            Self {
                data: data.to_vec(),
                ranges,
                short_reads: Mutex::new(0),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, DownloadError> {
            self.requests.lock().push(request.range);
            let start = match request.range {
                Some(range) if self.ranges => range.offset as usize,
                _ => 0,
            };
            let mut body = self.data[start..].to_vec();
            {
                let mut short = self.short_reads.lock();
                if *short > 0 {
                    *short -= 1;
                    body.truncate(body.len() / 2);
                }
            }
            let chunks: Vec<Result<Bytes, DownloadError>> = body
                .chunks(4)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            Ok(FetchResponse {
                status: if start > 0 { 206 } else { 200 },
                total_size: Some(self.data.len() as u64),
                range_honoured: request.range.is_none() || self.ranges,
                body: Box::pin(futures::stream::iter(chunks)),
            })
        }
    }

    fn handle(dir: &Path, policy: RetryPolicy) -> (Arc<DownloadHandle>, mpsc::Receiver<DriverEvent>) {
        let (tx, rx) = mpsc::channel(1024);
        let task = DownloadTask::new(DownloadSpec::new("https://cdn.test/a.bin", MediaType::File));
        let handle = DownloadHandle::new(task, dir.join("a.bin"), policy, tx);
        (Arc::new(handle), rx)
    }

    const DATA: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    #[tokio::test]
    async fn test_fresh_download() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new(DATA, true));
        let driver = SimpleDriver::new(transport.clone(), RangeFallback::Fail);
        let (handle, mut rx) = handle(tmp.path(), RetryPolicy::no_retry());

        let path = driver.run(handle.clone()).await.unwrap();
        assert_eq!(path, tmp.path().join("a.bin"));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), DATA);
        assert!(!handle.part_path().exists());
        assert_eq!(transport.requests.lock().as_slice(), &[None]);

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        assert_eq!(
            last,
            Some(DriverEvent::Bytes {
                downloaded: DATA.len() as u64,
                total: Some(DATA.len() as u64)
            })
        );
    }

    #[tokio::test]
    async fn test_existing_output_is_not_overwritten() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("a.bin"), b"keep").await.unwrap();
        let (handle, _rx) = handle(tmp.path(), RetryPolicy::no_retry());

        let driver = SimpleDriver::new(Arc::new(FakeTransport::new(DATA, true)), RangeFallback::Fail);
        let path = driver.run(handle).await.unwrap();

        assert_eq!(path, tmp.path().join("a (1).bin"));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), DATA);
        assert_eq!(tokio::fs::read(tmp.path().join("a.bin")).await.unwrap(), b"keep");
    }

    #[tokio::test]
    async fn test_resume_sends_range_from_part_length() {
        let tmp = tempfile::tempdir().unwrap();
        let (handle, _rx) = handle(tmp.path(), RetryPolicy::no_retry());
        tokio::fs::write(handle.part_path(), &DATA[..10])
            .await
            .unwrap();

        let transport = Arc::new(FakeTransport::new(DATA, true));
        let driver = SimpleDriver::new(transport.clone(), RangeFallback::Fail);
        let path = driver.run(handle).await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), DATA);
        assert_eq!(
            transport.requests.lock().as_slice(),
            &[Some(ByteRange::from_offset(10))]
        );
    }

    #[tokio::test]
    async fn test_ignored_range_fails_by_default() {
        let tmp = tempfile::tempdir().unwrap();
        let (handle, _rx) = handle(tmp.path(), RetryPolicy::exponential(3, 10, None));
        tokio::fs::write(handle.part_path(), &DATA[..10])
            .await
            .unwrap();

        let transport = Arc::new(FakeTransport::new(DATA, false));
        let driver = SimpleDriver::new(transport.clone(), RangeFallback::Fail);
        let err = driver.run(handle).await.unwrap_err();

        assert!(matches!(err, DownloadError::RangeNotSupported { .. }));
        assert!(!err.is_retryable());
        assert_eq!(transport.requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_ignored_range_restarts_when_configured() {
        let tmp = tempfile::tempdir().unwrap();
        let (handle, mut rx) = handle(tmp.path(), RetryPolicy::no_retry());
        tokio::fs::write(handle.part_path(), b"garbage!!!")
            .await
            .unwrap();

        let transport = Arc::new(FakeTransport::new(DATA, false));
        let driver = SimpleDriver::new(transport, RangeFallback::Restart);
        let path = driver.run(handle).await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), DATA);
        assert!(matches!(rx.try_recv(), Ok(DriverEvent::Restarted { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_body_is_retried_with_resume() {
        let tmp = tempfile::tempdir().unwrap();
        let (handle, _rx) = handle(tmp.path(), RetryPolicy::fixed(3, 100));
        let transport = Arc::new(FakeTransport::new(DATA, true));
        *transport.short_reads.lock() = 1;

        let driver = SimpleDriver::new(transport.clone(), RangeFallback::Fail);
        let path = driver.run(handle).await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), DATA);
        let requests = transport.requests.lock();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1], Some(ByteRange::from_offset(DATA.len() as u64 / 2)));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_keeps_partial() {
        let tmp = tempfile::tempdir().unwrap();
        let (handle, _rx) = handle(tmp.path(), RetryPolicy::no_retry());
        tokio::fs::write(handle.part_path(), &DATA[..5])
            .await
            .unwrap();
        handle.cancel();

        let driver = SimpleDriver::new(Arc::new(FakeTransport::new(DATA, true)), RangeFallback::Fail);
        let err = driver.run(handle.clone()).await.unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(
            tokio::fs::read(handle.part_path()).await.unwrap(),
            &DATA[..5]
        );
    }
}
