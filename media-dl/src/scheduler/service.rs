//! Task manager service.
//!
//! The [`TaskManager`] owns every task state transition:
//!
//! - admission control over a priority queue with a bounded number of
//!   running tasks
//! - one supervisor per running task that forwards driver events into the
//!   progress aggregator, persists throttled progress and applies the final
//!   transition
//! - pause/cancel as cooperative stops with a bounded grace period
//! - crash recovery on `init` and a clean-shutdown marker on `shutdown`
//!
//! Mutations of one task are serialized by a per-task async mutex. The
//! admission state (queue, reserved slots, running map) sits behind one
//! synchronous lock that is never held across an await. Lock order is task
//! lock first, then state lock.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedMutexGuard, mpsc, watch};
use tokio::task::{AbortHandle, JoinError};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::events::{TaskEvent, TaskEventBus};
use super::queue::AdmissionQueue;
use crate::config::ManagerConfig;
use crate::database::repositories::{RecoveryReport, TaskRepository};
use crate::domain::{
    DownloadProgress, DownloadSpec, DownloadTask, ErrorCode, TaskError, TaskStatus,
};
use crate::downloader::engine::Transport;
use crate::downloader::{
    DownloadDriver, DownloadError, DownloadHandle, DriverEvent, ProgressAggregator,
    SegmentResolver, SegmentedConfig, SegmentedDriver, SimpleDriver, remove_partials,
};
use crate::security::{UrlValidator, UrlVerdict};
use crate::{Error, Result};

/// Capacity of the per-task driver event channel.
const DRIVER_EVENT_CAPACITY: usize = 256;

const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

/// Why a running task is being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Pause,
    Cancel,
    Shutdown,
}

/// Book-keeping of one running task.
#[derive(Clone)]
struct RunningTask {
    handle: Arc<DownloadHandle>,
    abort: AbortHandle,
    stop: Arc<Mutex<Option<StopReason>>>,
    progress: Arc<Mutex<DownloadProgress>>,
    done: watch::Receiver<bool>,
}

impl RunningTask {
    /// Record a stop request. Cancel overrides an earlier pause.
    fn request_stop(&self, reason: StopReason) {
        let mut stop = self.stop.lock();
        match *stop {
            None => *stop = Some(reason),
            Some(StopReason::Pause) if reason == StopReason::Cancel => *stop = Some(reason),
            Some(_) => {}
        }
        drop(stop);
        self.handle.cancel();
    }
}

#[derive(Default)]
struct SchedulerState {
    queue: AdmissionQueue,
    /// Slots handed out to tasks that are being launched.
    reserved: usize,
    running: HashMap<String, RunningTask>,
    shutting_down: bool,
}

impl SchedulerState {
    fn occupied(&self) -> usize {
        self.reserved + self.running.len()
    }
}

/// The download task manager.
pub struct TaskManager {
    config: ManagerConfig,
    repo: Arc<dyn TaskRepository>,
    validator: Arc<dyn UrlValidator>,
    simple: Arc<dyn DownloadDriver>,
    segmented: Arc<dyn DownloadDriver>,
    task_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    state: Mutex<SchedulerState>,
    events: TaskEventBus,
}

impl TaskManager {
    /// Create a manager with the built-in drivers.
    pub fn new(
        config: ManagerConfig,
        repo: Arc<dyn TaskRepository>,
        validator: Arc<dyn UrlValidator>,
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn SegmentResolver>,
    ) -> Result<Arc<Self>> {
        let simple = Arc::new(SimpleDriver::new(transport.clone(), config.range_fallback));
        let segmented = Arc::new(SegmentedDriver::new(
            transport,
            resolver,
            repo.clone(),
            SegmentedConfig {
                concurrency: config.segment_concurrency,
                failure_tolerance: config.segment_failure_tolerance,
            },
        ));
        Self::with_drivers(config, repo, validator, simple, segmented)
    }

    /// Create a manager with custom drivers.
    pub fn with_drivers(
        config: ManagerConfig,
        repo: Arc<dyn TaskRepository>,
        validator: Arc<dyn UrlValidator>,
        simple: Arc<dyn DownloadDriver>,
        segmented: Arc<dyn DownloadDriver>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let events = TaskEventBus::new(config.event_capacity);
        Ok(Arc::new(Self {
            config,
            repo,
            validator,
            simple,
            segmented,
            task_locks: DashMap::new(),
            state: Mutex::new(SchedulerState::default()),
            events,
        }))
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Number of tasks currently running.
    pub fn running_count(&self) -> usize {
        self.state.lock().running.len()
    }

    /// Number of tasks waiting for admission.
    pub fn queued_count(&self) -> usize {
        self.state.lock().queue.len()
    }

    // ========== Lifecycle ==========

    /// Recover from the previous process and admit persisted queued tasks.
    pub async fn init(self: &Arc<Self>) -> Result<RecoveryReport> {
        let report = self.repo.recover_interrupted().await?;
        if !report.clean_shutdown {
            warn!(
                requeued = report.requeued.len(),
                interrupted = report.interrupted.len(),
                segments_reset = report.segments_reset,
                "Recovered from unclean shutdown"
            );
        }
        for id in &report.interrupted {
            if let Ok(task) = self.repo.get_task(id).await
                && let Some(error) = task.error
            {
                self.events.publish(TaskEvent::Error {
                    task_id: id.clone(),
                    error,
                });
            }
        }

        let queued = self.repo.list_queued_tasks().await?;
        {
            let mut state = self.state.lock();
            state.shutting_down = false;
            for task in &queued {
                state.queue.push(task);
            }
        }
        info!(queued = queued.len(), "Task manager initialized");
        self.pump();
        Ok(report)
    }

    /// Stop running drivers, demote their tasks to `queued` and write the
    /// clean-shutdown marker.
    pub async fn shutdown(&self) -> Result<()> {
        info!(running = self.running_count(), "Shutting down task manager");

        // Launches in flight see the flag and stop themselves.
        loop {
            let running: Vec<RunningTask> = {
                let mut state = self.state.lock();
                state.shutting_down = true;
                if state.occupied() == 0 {
                    break;
                }
                state.running.values().cloned().collect()
            };

            for task in &running {
                task.request_stop(StopReason::Shutdown);
            }
            for task in running {
                self.await_stop(task).await;
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }

        self.repo.set_clean_shutdown(true).await?;
        info!("Task manager stopped");
        Ok(())
    }

    // ========== Commands ==========

    /// Submit a download and return the task id.
    ///
    /// Unsafe URLs, DRM-protected and live media are persisted directly in
    /// `error` with a non-retryable error; their id is still returned.
    pub async fn start(self: &Arc<Self>, spec: DownloadSpec) -> Result<String> {
        let spec = spec.normalized();
        spec.validate()?;

        if let Some(error) = self.admission_error(&spec) {
            let task = DownloadTask::rejected(spec, error.clone());
            self.repo.create_task(&task).await?;
            warn!(task_id = %task.id, code = %error.code, "Task rejected at admission");
            self.events.publish(TaskEvent::Error {
                task_id: task.id.clone(),
                error,
            });
            return Ok(task.id);
        }

        let task = DownloadTask::new(spec);
        self.repo.create_task(&task).await?;
        self.state.lock().queue.push(&task);
        info!(
            task_id = %task.id,
            url = %task.spec.url,
            media_type = %task.spec.media_type,
            priority = task.spec.priority,
            "Task queued"
        );
        self.events.publish(TaskEvent::Queued {
            task_id: task.id.clone(),
        });
        self.pump();
        Ok(task.id)
    }

    /// Pause a running task. Returns once the driver has stopped.
    pub async fn pause(&self, id: &str) -> Result<()> {
        let guard = self.lock_task(id).await;
        let task = self.repo.get_task(id).await?;
        if task.status != TaskStatus::Running {
            return Err(Error::invalid_transition(task.status, TaskStatus::Paused));
        }

        let running = self.running_entry(id)?;
        running.request_stop(StopReason::Pause);
        drop(guard);

        info!(task_id = %id, "Pausing task");
        self.await_stop(running).await;
        Ok(())
    }

    /// Re-queue a paused task at its original priority and creation order.
    pub async fn resume(self: &Arc<Self>, id: &str) -> Result<()> {
        let guard = self.lock_task(id).await;
        let mut task = self.repo.get_task(id).await?;
        if task.status != TaskStatus::Paused {
            return Err(Error::invalid_transition(task.status, TaskStatus::Queued));
        }

        task.mark_queued()?;
        self.repo.update_task(&task, "resumed", None).await?;
        self.state.lock().queue.push(&task);
        drop(guard);

        info!(task_id = %id, "Task resumed");
        self.events.publish(TaskEvent::Resumed {
            task_id: id.to_string(),
        });
        self.pump();
        Ok(())
    }

    /// Cancel a non-terminal task and delete its partial files.
    pub async fn cancel(self: &Arc<Self>, id: &str) -> Result<()> {
        let guard = self.lock_task(id).await;
        let mut task = self.repo.get_task(id).await?;

        match task.status {
            TaskStatus::Running => {
                let running = self.running_entry(id)?;
                running.request_stop(StopReason::Cancel);
                drop(guard);
                info!(task_id = %id, "Canceling running task");
                self.await_stop(running).await;
                Ok(())
            }
            TaskStatus::Queued | TaskStatus::Paused => {
                self.state.lock().queue.remove(id);
                task.mark_canceled()?;
                self.delete_partials(&task).await;
                self.repo.update_task(&task, "canceled", None).await?;
                drop(guard);

                info!(task_id = %id, "Task canceled");
                self.events.publish(TaskEvent::Canceled {
                    task_id: id.to_string(),
                });
                Ok(())
            }
            status => Err(Error::invalid_transition(status, TaskStatus::Canceled)),
        }
    }

    /// Re-queue a task whose last error is retryable.
    ///
    /// Completed segments and the written byte offset are kept; failed
    /// segments get a fresh retry budget.
    pub async fn retry(self: &Arc<Self>, id: &str) -> Result<()> {
        let guard = self.lock_task(id).await;
        let mut task = self.repo.get_task(id).await?;
        task.prepare_retry()?;

        let reset = self.repo.reset_segments_for_retry(id).await?;
        let details = format!("retry #{}", task.retry_count);
        self.repo.update_task(&task, "retry", Some(&details)).await?;
        self.state.lock().queue.push(&task);
        drop(guard);

        info!(
            task_id = %id,
            retry_count = task.retry_count,
            segments_reset = reset,
            "Task queued for retry"
        );
        self.events.publish(TaskEvent::Queued {
            task_id: id.to_string(),
        });
        self.pump();
        Ok(())
    }

    /// Delete a terminal task together with its segments and history.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let guard = self.lock_task(id).await;
        let task = self.repo.get_task(id).await?;
        if !task.is_terminal() {
            return Err(Error::invalid_transition(task.status, "removed"));
        }

        self.delete_partials(&task).await;
        self.repo.delete_task(id).await?;
        drop(guard);
        self.task_locks.remove(id);

        info!(task_id = %id, "Task removed");
        self.events.publish(TaskEvent::Removed {
            task_id: id.to_string(),
        });
        Ok(())
    }

    /// Delete every completed task. Returns how many were removed.
    pub async fn clear_completed(&self) -> Result<usize> {
        let ids = self.repo.delete_tasks_by_status(TaskStatus::Completed).await?;
        for id in &ids {
            self.task_locks.remove(id);
            self.events.publish(TaskEvent::Removed {
                task_id: id.clone(),
            });
        }
        info!(count = ids.len(), "Cleared completed tasks");
        Ok(ids.len())
    }

    /// Fetch a task, with live progress if it is running.
    pub async fn get(&self, id: &str) -> Result<Option<DownloadTask>> {
        match self.repo.get_task(id).await {
            Ok(mut task) => {
                self.overlay_progress(&mut task);
                Ok(Some(task))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// List tasks, optionally filtered by status.
    pub async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<DownloadTask>> {
        let mut tasks = self.repo.list_tasks(status).await?;
        for task in &mut tasks {
            self.overlay_progress(task);
        }
        Ok(tasks)
    }

    // ========== Admission ==========

    fn admission_error(&self, spec: &DownloadSpec) -> Option<TaskError> {
        if let UrlVerdict::Unsafe { reason } = self.validator.validate(&spec.url) {
            return Some(TaskError::fatal(
                ErrorCode::UnsafeUrl,
                format!("URL rejected: {}", reason),
            ));
        }
        if spec.drm_protected {
            return Some(TaskError::fatal(
                ErrorCode::DrmProtected,
                "media is DRM protected",
            ));
        }
        if spec.live {
            return Some(TaskError::fatal(
                ErrorCode::LiveStreamUnsupported,
                "live streams cannot be downloaded to completion",
            ));
        }
        None
    }

    /// Admit queued tasks while slots are free.
    fn pump(self: &Arc<Self>) {
        let admitted: Vec<String> = {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            let mut admitted = Vec::new();
            while state.occupied() < self.config.max_concurrent_downloads {
                let Some(id) = state.queue.pop() else {
                    break;
                };
                state.reserved += 1;
                admitted.push(id);
            }
            admitted
        };

        for id in admitted {
            let this = self.clone();
            tokio::spawn(async move {
                this.launch(id).await;
            });
        }
    }

    /// Move an admitted task to `running` and spawn its driver.
    async fn launch(self: Arc<Self>, id: String) {
        let guard = self.lock_task(&id).await;

        match self.try_launch(&id).await {
            Ok(true) => {
                drop(guard);
                self.events.publish(TaskEvent::Started { task_id: id });
            }
            Ok(false) => {
                self.state.lock().reserved -= 1;
                drop(guard);
                self.pump();
            }
            Err(e) => {
                error!(task_id = %id, error = %e, "Failed to start task");
                self.state.lock().reserved -= 1;
                drop(guard);
                self.pump();
            }
        }
    }

    /// Returns `false` when the task is no longer startable.
    async fn try_launch(self: &Arc<Self>, id: &str) -> Result<bool> {
        let mut task = self.repo.get_task(id).await?;
        let shutting_down = self.state.lock().shutting_down;
        if task.status != TaskStatus::Queued || shutting_down {
            debug!(task_id = %id, status = %task.status, "Skipping admission");
            return Ok(false);
        }

        task.mark_running()?;
        self.repo.update_task(&task, "started", None).await?;

        let output_path = task.target_path(&self.config.download_dir);
        let retry_policy = task
            .spec
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.config.default_retry_policy.clone());
        let driver = if task.spec.media_type.is_segmented() {
            self.segmented.clone()
        } else {
            self.simple.clone()
        };

        let (event_tx, event_rx) = mpsc::channel(DRIVER_EVENT_CAPACITY);
        let initial_progress = task.progress.clone();
        let handle = Arc::new(DownloadHandle::new(
            task,
            output_path.clone(),
            retry_policy,
            event_tx,
        ));

        let driver_handle = handle.clone();
        let join = tokio::spawn(async move { driver.run(driver_handle).await });
        let (done_tx, done_rx) = watch::channel(false);
        let running = RunningTask {
            handle: handle.clone(),
            abort: join.abort_handle(),
            stop: Arc::new(Mutex::new(None)),
            progress: Arc::new(Mutex::new(initial_progress.clone())),
            done: done_rx,
        };

        {
            let mut state = self.state.lock();
            state.reserved -= 1;
            state.running.insert(id.to_string(), running.clone());
            if state.shutting_down {
                running.request_stop(StopReason::Shutdown);
            }
        }

        info!(
            task_id = %id,
            path = %output_path.display(),
            "Task started"
        );

        let this = self.clone();
        tokio::spawn(async move {
            this.supervise(running, join, event_rx, initial_progress, done_tx)
                .await;
        });
        Ok(true)
    }

    // ========== Supervision ==========

    async fn supervise(
        self: Arc<Self>,
        running: RunningTask,
        mut join: tokio::task::JoinHandle<std::result::Result<PathBuf, DownloadError>>,
        mut event_rx: mpsc::Receiver<DriverEvent>,
        initial: DownloadProgress,
        done_tx: watch::Sender<bool>,
    ) {
        let id = running.handle.id().to_string();
        let mut aggregator = ProgressAggregator::new(
            initial,
            self.config.progress_interval(),
            self.config.speed_window(),
        );
        let mut ticker = tokio::time::interval(self.config.progress_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let outcome = loop {
            tokio::select! {
                result = &mut join => break result,
                Some(event) = event_rx.recv() => {
                    self.apply_driver_event(&id, &mut aggregator, event).await;
                    *running.progress.lock() = aggregator.snapshot().clone();
                }
                _ = ticker.tick() => {
                    if let Some(progress) = aggregator.poll_emit(Instant::now().into_std()) {
                        self.publish_progress(&id, progress).await;
                    }
                }
            }
        };

        while let Ok(event) = event_rx.try_recv() {
            self.apply_driver_event(&id, &mut aggregator, event).await;
        }
        let progress = aggregator.flush();
        *running.progress.lock() = progress.clone();
        self.events.publish(TaskEvent::Progress {
            task_id: id.clone(),
            progress: progress.clone(),
        });

        let stop = *running.stop.lock();
        self.finish(&id, &running, outcome, progress, stop).await;
        let _ = done_tx.send(true);
        self.pump();
    }

    async fn apply_driver_event(
        &self,
        id: &str,
        aggregator: &mut ProgressAggregator,
        event: DriverEvent,
    ) {
        let now = Instant::now().into_std();
        match event {
            DriverEvent::Bytes { downloaded, total } => {
                aggregator.record_bytes(downloaded, total, now);
            }
            DriverEvent::Segments {
                segments,
                downloaded_bytes,
            } => {
                aggregator.record_bytes(downloaded_bytes, None, now);
                aggregator.record_segments(segments, now);
            }
            DriverEvent::Restarted { reason } => {
                aggregator.reset(now);
                let _guard = self.lock_task(id).await;
                if let Err(e) = self.repo.append_history(id, "restarted", Some(&reason)).await {
                    warn!(task_id = %id, error = %e, "Failed to record restart");
                }
            }
            DriverEvent::Stage(stage) => {
                debug!(task_id = %id, stage = stage.as_str(), "Task stage changed");
            }
        }
    }

    async fn publish_progress(&self, id: &str, progress: DownloadProgress) {
        {
            let _guard = self.lock_task(id).await;
            if let Err(e) = self.repo.update_progress(id, &progress).await {
                warn!(task_id = %id, error = %e, "Failed to persist progress");
            }
        }
        self.events.publish(TaskEvent::Progress {
            task_id: id.to_string(),
            progress,
        });
    }

    /// Apply the final transition of a run and release its slot.
    async fn finish(
        &self,
        id: &str,
        running: &RunningTask,
        outcome: std::result::Result<std::result::Result<PathBuf, DownloadError>, JoinError>,
        progress: DownloadProgress,
        stop: Option<StopReason>,
    ) {
        let guard = self.lock_task(id).await;

        let event = match self.repo.get_task(id).await {
            Ok(mut task) => {
                task.progress = progress;
                match self.apply_outcome(&mut task, running, outcome, stop).await {
                    Ok(event) => Some(event),
                    Err(e) => {
                        error!(task_id = %id, error = %e, "Failed to persist task outcome");
                        None
                    }
                }
            }
            Err(e) => {
                error!(task_id = %id, error = %e, "Failed to load finished task");
                None
            }
        };

        self.state.lock().running.remove(id);
        drop(guard);

        if let Some(event) = event {
            self.events.publish(event);
        }
    }

    async fn apply_outcome(
        &self,
        task: &mut DownloadTask,
        running: &RunningTask,
        outcome: std::result::Result<std::result::Result<PathBuf, DownloadError>, JoinError>,
        stop: Option<StopReason>,
    ) -> Result<TaskEvent> {
        let id = task.id.clone();
        let aborted = matches!(&outcome, Err(join_error) if join_error.is_cancelled());
        let result = match outcome {
            Ok(result) => result,
            Err(join_error) if join_error.is_cancelled() => Err(DownloadError::Cancelled),
            Err(join_error) => {
                error!(task_id = %id, error = %join_error, "Driver panicked");
                Err(DownloadError::network(format!("driver aborted: {}", join_error)))
            }
        };

        match (stop, result) {
            (Some(StopReason::Cancel), result) => {
                task.mark_canceled()?;
                if let Ok(path) = result
                    && let Err(e) = tokio::fs::remove_file(&path).await
                {
                    warn!(task_id = %id, error = %e, "Failed to delete output file");
                }
                if let Err(e) = remove_partials(running.handle.save_dir(), &id).await {
                    warn!(task_id = %id, error = %e, "Failed to delete partial files");
                }
                self.repo.update_task(task, "canceled", None).await?;
                info!(task_id = %id, "Task canceled");
                Ok(TaskEvent::Canceled { task_id: id })
            }
            (_, Ok(path)) => {
                task.mark_completed(path)?;
                self.repo.update_task(task, "completed", None).await?;
                info!(
                    task_id = %id,
                    bytes = task.progress.downloaded_bytes,
                    "Task completed"
                );
                Ok(TaskEvent::Completed {
                    task_id: id,
                    task: Box::new(task.clone()),
                })
            }
            (Some(StopReason::Pause), Err(_)) => {
                if aborted {
                    clamp_to_partial(task, &running.handle).await;
                }
                task.mark_paused()?;
                self.repo.update_task(task, "paused", None).await?;
                info!(
                    task_id = %id,
                    bytes = task.progress.downloaded_bytes,
                    "Task paused"
                );
                Ok(TaskEvent::Paused { task_id: id })
            }
            (Some(StopReason::Shutdown), Err(_)) => {
                if aborted {
                    clamp_to_partial(task, &running.handle).await;
                }
                task.mark_queued()?;
                self.repo.update_task(task, "shutdown", None).await?;
                info!(task_id = %id, "Task demoted for shutdown");
                Ok(TaskEvent::Queued { task_id: id })
            }
            (None, Err(err)) => {
                let error = if err.is_cancelled() {
                    TaskError::new(ErrorCode::Interrupted, "driver stopped unexpectedly")
                } else {
                    err.to_task_error()
                };
                task.mark_failed(error.clone())?;
                self.repo
                    .update_task(task, "error", Some(error.code.as_str()))
                    .await?;
                warn!(
                    task_id = %id,
                    code = %error.code,
                    retryable = error.retryable,
                    error = %error.message,
                    "Task failed"
                );
                Ok(TaskEvent::Error { task_id: id, error })
            }
        }
    }

    /// Wait for a stopping task, aborting its driver after the grace period.
    async fn await_stop(&self, running: RunningTask) {
        let grace = self.config.cancel_grace();
        let mut done = running.done.clone();

        if tokio::time::timeout(grace, done.wait_for(|d| *d))
            .await
            .is_ok()
        {
            return;
        }

        warn!(
            task_id = %running.handle.id(),
            grace_ms = grace.as_millis() as u64,
            "Driver ignored stop request, aborting"
        );
        running.abort.abort();
        if tokio::time::timeout(grace, done.wait_for(|d| *d))
            .await
            .is_err()
        {
            error!(task_id = %running.handle.id(), "Task did not finish after abort");
        }
    }

    // ========== Helpers ==========

    async fn lock_task(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .task_locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    fn running_entry(&self, id: &str) -> Result<RunningTask> {
        self.state
            .lock()
            .running
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Other(format!("task {} is not attached to a driver", id)))
    }

    fn overlay_progress(&self, task: &mut DownloadTask) {
        if task.status != TaskStatus::Running {
            return;
        }
        if let Some(running) = self.state.lock().running.get(&task.id) {
            task.progress = running.progress.lock().clone();
        }
    }

    async fn delete_partials(&self, task: &DownloadTask) {
        let save_dir = task.save_dir(&self.config.download_dir);
        if let Err(e) = remove_partials(&save_dir, &task.id).await {
            warn!(task_id = %task.id, error = %e, "Failed to delete partial files");
        }
    }
}

/// An aborted driver loses its buffered writes, so persisted progress of a
/// single-stream task must not exceed what its partial file holds.
async fn clamp_to_partial(task: &mut DownloadTask, handle: &DownloadHandle) {
    if task.spec.media_type.is_segmented() {
        return;
    }
    let on_disk = tokio::fs::metadata(handle.part_path())
        .await
        .map(|m| m.len())
        .unwrap_or(0);
    if task.progress.downloaded_bytes > on_disk {
        debug!(
            task_id = %task.id,
            reported = task.progress.downloaded_bytes,
            on_disk,
            "Clamping progress to partial file"
        );
        task.progress.downloaded_bytes = on_disk;
        task.progress.recompute_percent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MediaType, RetryPolicy};

    fn handle(dir: &std::path::Path, media_type: MediaType) -> DownloadHandle {
        let (tx, _rx) = mpsc::channel(1);
        let task = DownloadTask::new(DownloadSpec::new("https://cdn.test/a.bin", media_type));
        DownloadHandle::new(task, dir.join("a.bin"), RetryPolicy::no_retry(), tx)
    }

    #[tokio::test]
    async fn test_clamp_to_partial_file_length() {
        let tmp = tempfile::tempdir().unwrap();
        let handle = handle(tmp.path(), MediaType::File);
        tokio::fs::write(handle.part_path(), vec![0u8; 400]).await.unwrap();

        let mut task = handle.task.clone();
        task.progress = DownloadProgress::with_bytes(1000, Some(2000));
        clamp_to_partial(&mut task, &handle).await;

        assert_eq!(task.progress.downloaded_bytes, 400);
        assert_eq!(task.progress.percent, 20.0);
    }

    #[tokio::test]
    async fn test_clamp_without_partial_resets_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let handle = handle(tmp.path(), MediaType::File);

        let mut task = handle.task.clone();
        task.progress = DownloadProgress::with_bytes(1000, Some(2000));
        clamp_to_partial(&mut task, &handle).await;

        assert_eq!(task.progress.downloaded_bytes, 0);
        assert_eq!(task.progress.percent, 0.0);
    }

    #[tokio::test]
    async fn test_clamp_keeps_smaller_progress_and_segmented_tasks() {
        let tmp = tempfile::tempdir().unwrap();
        let file = handle(tmp.path(), MediaType::File);
        tokio::fs::write(file.part_path(), vec![0u8; 400]).await.unwrap();

        let mut task = file.task.clone();
        task.progress = DownloadProgress::with_bytes(100, Some(2000));
        clamp_to_partial(&mut task, &file).await;
        assert_eq!(task.progress.downloaded_bytes, 100);

        let hls = handle(tmp.path(), MediaType::Hls);
        let mut task = hls.task.clone();
        task.progress = DownloadProgress::with_bytes(5000, None);
        clamp_to_partial(&mut task, &hls).await;
        assert_eq!(task.progress.downloaded_bytes, 5000);
    }
}
