//! Task repository.
//!
//! Owns the `tasks`, `segments`, `history` and `app_state` tables. Every
//! mutation of a task runs in one `BEGIN IMMEDIATE` transaction together with
//! its history row.

use async_trait::async_trait;
use sqlx::{SqliteConnection, SqlitePool};

use crate::database::models::task::to_i64;
use crate::database::models::{HistoryDbModel, SegmentDbModel, SegmentStatus, TaskDbModel};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::database::{begin_immediate, finish_immediate};
use crate::domain::{DownloadProgress, DownloadTask, ErrorCode, TaskError, TaskStage, TaskStatus};
use crate::{Error, Result};

const CLEAN_SHUTDOWN_KEY: &str = "clean_shutdown";

/// Outcome of startup crash recovery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    /// Whether the previous process wrote the clean-shutdown marker.
    pub clean_shutdown: bool,
    /// Tasks demoted from `running` back to `queued`.
    pub requeued: Vec<String>,
    /// Tasks moved to `error` because they stopped mid-finalization.
    pub interrupted: Vec<String>,
    /// Segments reset from `downloading` to `pending`.
    pub segments_reset: u64,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.interrupted.is_empty() && self.segments_reset == 0
    }
}

/// Task repository trait.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Insert a new task and its `created` history entry.
    async fn create_task(&self, task: &DownloadTask) -> Result<()>;
    async fn get_task(&self, id: &str) -> Result<DownloadTask>;
    /// List tasks in creation order, optionally filtered by status.
    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<DownloadTask>>;
    /// Queued tasks in admission order: priority desc, then creation order.
    async fn list_queued_tasks(&self) -> Result<Vec<DownloadTask>>;
    /// Persist the full task state with a history entry.
    async fn update_task(
        &self,
        task: &DownloadTask,
        event: &str,
        details: Option<&str>,
    ) -> Result<()>;
    /// Persist progress counters of a running task.
    async fn update_progress(&self, id: &str, progress: &DownloadProgress) -> Result<()>;
    /// Record the stage of a running task (history `stage`).
    async fn set_stage(&self, id: &str, stage: TaskStage) -> Result<()>;
    async fn append_history(&self, id: &str, event: &str, details: Option<&str>) -> Result<()>;
    async fn list_history(&self, id: &str) -> Result<Vec<HistoryDbModel>>;
    /// Delete a task; segments and history cascade.
    async fn delete_task(&self, id: &str) -> Result<()>;
    /// Delete every task in `status`, returning the deleted ids.
    async fn delete_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<String>>;

    /// Demote tasks orphaned by a previous process and clear the clean-shutdown marker.
    async fn recover_interrupted(&self) -> Result<RecoveryReport>;
    async fn set_clean_shutdown(&self, clean: bool) -> Result<()>;

    // Segments
    /// Insert segment rows that do not exist yet; existing rows are untouched.
    async fn ensure_segments(&self, task_id: &str, segments: &[SegmentDbModel]) -> Result<()>;
    async fn list_segments(&self, task_id: &str) -> Result<Vec<SegmentDbModel>>;
    async fn update_segment(&self, segment: &SegmentDbModel) -> Result<()>;
    /// `failed -> pending` with a fresh retry budget.
    async fn reset_segments_for_retry(&self, task_id: &str) -> Result<u64>;
    /// `downloading -> pending` for a task whose driver stopped.
    async fn reset_downloading_segments(&self, task_id: &str) -> Result<u64>;
}

/// SQLx implementation of TaskRepository.
pub struct SqlxTaskRepository {
    pool: SqlitePool,
}

impl SqlxTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

async fn insert_history(
    conn: &mut SqliteConnection,
    task_id: &str,
    event: &str,
    details: Option<&str>,
) -> Result<()> {
    sqlx::query("INSERT INTO history (task_id, event, details, created_at) VALUES (?, ?, ?, ?)")
        .bind(task_id)
        .bind(event)
        .bind(details)
        .bind(now_ms())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn write_task(conn: &mut SqliteConnection, row: &TaskDbModel) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE tasks SET
            url = ?,
            media_type = ?,
            filename = ?,
            save_dir = ?,
            headers = ?,
            variant = ?,
            retry_policy = ?,
            custom_quality = ?,
            priority = ?,
            metadata = ?,
            drm_protected = ?,
            live = ?,
            status = ?,
            stage = ?,
            percent = ?,
            downloaded_bytes = ?,
            total_bytes = ?,
            segment_progress = ?,
            error_code = ?,
            error_message = ?,
            error_retryable = ?,
            error_details = ?,
            retry_count = ?,
            output_path = ?,
            started_at = ?,
            paused_at = ?,
            completed_at = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&row.url)
    .bind(&row.media_type)
    .bind(&row.filename)
    .bind(&row.save_dir)
    .bind(&row.headers)
    .bind(&row.variant)
    .bind(&row.retry_policy)
    .bind(&row.custom_quality)
    .bind(row.priority)
    .bind(&row.metadata)
    .bind(row.drm_protected)
    .bind(row.live)
    .bind(&row.status)
    .bind(&row.stage)
    .bind(row.percent)
    .bind(row.downloaded_bytes)
    .bind(row.total_bytes)
    .bind(&row.segment_progress)
    .bind(&row.error_code)
    .bind(&row.error_message)
    .bind(row.error_retryable)
    .bind(&row.error_details)
    .bind(row.retry_count)
    .bind(&row.output_path)
    .bind(row.started_at)
    .bind(row.paused_at)
    .bind(row.completed_at)
    .bind(row.updated_at)
    .bind(&row.id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

#[async_trait]
impl TaskRepository for SqlxTaskRepository {
    async fn create_task(&self, task: &DownloadTask) -> Result<()> {
        let row = TaskDbModel::from_domain(task)?;
        retry_on_sqlite_busy("create_task", || async {
            let mut tx = begin_immediate(&self.pool).await?;
            let result: Result<()> = async {
                sqlx::query(
                    r#"
                    INSERT INTO tasks (
                        id, url, media_type, filename, save_dir, headers, variant,
                        retry_policy, custom_quality, priority, metadata, drm_protected,
                        live, status, stage, percent, downloaded_bytes, total_bytes,
                        segment_progress, error_code, error_message, error_retryable,
                        error_details, retry_count, output_path, created_at, started_at,
                        paused_at, completed_at, updated_at
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&row.id)
                .bind(&row.url)
                .bind(&row.media_type)
                .bind(&row.filename)
                .bind(&row.save_dir)
                .bind(&row.headers)
                .bind(&row.variant)
                .bind(&row.retry_policy)
                .bind(&row.custom_quality)
                .bind(row.priority)
                .bind(&row.metadata)
                .bind(row.drm_protected)
                .bind(row.live)
                .bind(&row.status)
                .bind(&row.stage)
                .bind(row.percent)
                .bind(row.downloaded_bytes)
                .bind(row.total_bytes)
                .bind(&row.segment_progress)
                .bind(&row.error_code)
                .bind(&row.error_message)
                .bind(row.error_retryable)
                .bind(&row.error_details)
                .bind(row.retry_count)
                .bind(&row.output_path)
                .bind(row.created_at)
                .bind(row.started_at)
                .bind(row.paused_at)
                .bind(row.completed_at)
                .bind(row.updated_at)
                .execute(&mut *tx)
                .await?;

                let details = match task.error.as_ref() {
                    Some(err) => format!("rejected: {}", err),
                    None => format!("{} {}", task.spec.media_type, task.spec.url),
                };
                insert_history(&mut tx, &row.id, "created", Some(&details)).await
            }
            .await;
            finish_immediate(tx, result).await
        })
        .await
    }

    async fn get_task(&self, id: &str) -> Result<DownloadTask> {
        sqlx::query_as::<_, TaskDbModel>("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::task_not_found(id))?
            .into_domain()
    }

    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<DownloadTask>> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, TaskDbModel>(
                    "SELECT * FROM tasks WHERE status = ? ORDER BY created_at, rowid",
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, TaskDbModel>("SELECT * FROM tasks ORDER BY created_at, rowid")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(TaskDbModel::into_domain).collect()
    }

    async fn list_queued_tasks(&self) -> Result<Vec<DownloadTask>> {
        let rows = sqlx::query_as::<_, TaskDbModel>(
            "SELECT * FROM tasks WHERE status = 'queued' ORDER BY priority DESC, created_at, rowid",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskDbModel::into_domain).collect()
    }

    async fn update_task(
        &self,
        task: &DownloadTask,
        event: &str,
        details: Option<&str>,
    ) -> Result<()> {
        let row = TaskDbModel::from_domain(task)?;
        retry_on_sqlite_busy("update_task", || async {
            let mut tx = begin_immediate(&self.pool).await?;
            let result: Result<()> = async {
                if write_task(&mut tx, &row).await? == 0 {
                    return Err(Error::task_not_found(&row.id));
                }
                insert_history(&mut tx, &row.id, event, details).await
            }
            .await;
            finish_immediate(tx, result).await
        })
        .await
    }

    async fn update_progress(&self, id: &str, progress: &DownloadProgress) -> Result<()> {
        let segments = progress
            .segments
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        retry_on_sqlite_busy("update_progress", || async {
            sqlx::query(
                r#"
                UPDATE tasks SET
                    percent = ?, downloaded_bytes = ?, total_bytes = ?,
                    segment_progress = ?, updated_at = ?
                WHERE id = ? AND status = 'running'
                "#,
            )
            .bind(progress.percent)
            .bind(to_i64(progress.downloaded_bytes))
            .bind(progress.total_bytes.map(to_i64))
            .bind(&segments)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn set_stage(&self, id: &str, stage: TaskStage) -> Result<()> {
        retry_on_sqlite_busy("set_stage", || async {
            let mut tx = begin_immediate(&self.pool).await?;
            let result: Result<()> = async {
                let updated = sqlx::query("UPDATE tasks SET stage = ?, updated_at = ? WHERE id = ?")
                    .bind(stage.as_str())
                    .bind(now_ms())
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                if updated.rows_affected() == 0 {
                    return Err(Error::task_not_found(id));
                }
                insert_history(&mut tx, id, "stage", Some(stage.as_str())).await
            }
            .await;
            finish_immediate(tx, result).await
        })
        .await
    }

    async fn append_history(&self, id: &str, event: &str, details: Option<&str>) -> Result<()> {
        retry_on_sqlite_busy("append_history", || async {
            let mut tx = begin_immediate(&self.pool).await?;
            let result = insert_history(&mut tx, id, event, details).await;
            finish_immediate(tx, result).await
        })
        .await
    }

    async fn list_history(&self, id: &str) -> Result<Vec<HistoryDbModel>> {
        let rows = sqlx::query_as::<_, HistoryDbModel>(
            "SELECT * FROM history WHERE task_id = ? ORDER BY id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_task(&self, id: &str) -> Result<()> {
        retry_on_sqlite_busy("delete_task", || async {
            // Segments and history are deleted via CASCADE
            let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(Error::task_not_found(id));
            }
            Ok(())
        })
        .await
    }

    async fn delete_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<String>> {
        retry_on_sqlite_busy("delete_tasks_by_status", || async {
            let mut tx = begin_immediate(&self.pool).await?;
            let result: Result<Vec<String>> = async {
                let ids: Vec<(String,)> = sqlx::query_as("SELECT id FROM tasks WHERE status = ?")
                    .bind(status.as_str())
                    .fetch_all(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM tasks WHERE status = ?")
                    .bind(status.as_str())
                    .execute(&mut *tx)
                    .await?;
                Ok(ids.into_iter().map(|(id,)| id).collect())
            }
            .await;
            finish_immediate(tx, result).await
        })
        .await
    }

    async fn recover_interrupted(&self) -> Result<RecoveryReport> {
        retry_on_sqlite_busy("recover_interrupted", || async {
            let mut tx = begin_immediate(&self.pool).await?;
            let result: Result<RecoveryReport> = async {
                let marker: Option<(String,)> =
                    sqlx::query_as("SELECT value FROM app_state WHERE key = ?")
                        .bind(CLEAN_SHUTDOWN_KEY)
                        .fetch_optional(&mut *tx)
                        .await?;
                let mut report = RecoveryReport {
                    clean_shutdown: marker.is_some_and(|(value,)| value == "1"),
                    ..Default::default()
                };

                let rows = sqlx::query_as::<_, TaskDbModel>(
                    "SELECT * FROM tasks WHERE status = 'running' ORDER BY created_at, rowid",
                )
                .fetch_all(&mut *tx)
                .await?;

                for row in rows {
                    let mut task = row.into_domain()?;
                    let (event, details) = if task.stage == TaskStage::Finalizing {
                        task.mark_failed(TaskError::new(
                            ErrorCode::Interrupted,
                            "process stopped while concatenating segments",
                        ))?;
                        report.interrupted.push(task.id.clone());
                        ("recovered", "interrupted during finalization")
                    } else {
                        task.mark_queued()?;
                        report.requeued.push(task.id.clone());
                        ("recovered", "requeued after unclean shutdown")
                    };
                    write_task(&mut tx, &TaskDbModel::from_domain(&task)?).await?;
                    insert_history(&mut tx, &task.id, event, Some(details)).await?;
                }

                report.segments_reset = sqlx::query(
                    "UPDATE segments SET status = 'pending', updated_at = ? WHERE status = 'downloading'",
                )
                .bind(now_ms())
                .execute(&mut *tx)
                .await?
                .rows_affected();

                sqlx::query("INSERT OR REPLACE INTO app_state (key, value) VALUES (?, '0')")
                    .bind(CLEAN_SHUTDOWN_KEY)
                    .execute(&mut *tx)
                    .await?;

                Ok(report)
            }
            .await;
            finish_immediate(tx, result).await
        })
        .await
    }

    async fn set_clean_shutdown(&self, clean: bool) -> Result<()> {
        retry_on_sqlite_busy("set_clean_shutdown", || async {
            sqlx::query("INSERT OR REPLACE INTO app_state (key, value) VALUES (?, ?)")
                .bind(CLEAN_SHUTDOWN_KEY)
                .bind(if clean { "1" } else { "0" })
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn ensure_segments(&self, task_id: &str, segments: &[SegmentDbModel]) -> Result<()> {
        retry_on_sqlite_busy("ensure_segments", || async {
            let mut tx = begin_immediate(&self.pool).await?;
            let result: Result<()> = async {
                for segment in segments {
                    sqlx::query(
                        r#"
                        INSERT OR IGNORE INTO segments (
                            task_id, segment_index, url, range_offset, range_length,
                            duration_secs, size_bytes, status, retry_count, temp_path,
                            error_message, created_at, updated_at
                        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                        "#,
                    )
                    .bind(task_id)
                    .bind(segment.segment_index)
                    .bind(&segment.url)
                    .bind(segment.range_offset)
                    .bind(segment.range_length)
                    .bind(segment.duration_secs)
                    .bind(segment.size_bytes)
                    .bind(&segment.status)
                    .bind(segment.retry_count)
                    .bind(&segment.temp_path)
                    .bind(&segment.error_message)
                    .bind(segment.created_at)
                    .bind(segment.updated_at)
                    .execute(&mut *tx)
                    .await?;
                }
                insert_history(
                    &mut tx,
                    task_id,
                    "segments_resolved",
                    Some(&format!("{} segments", segments.len())),
                )
                .await
            }
            .await;
            finish_immediate(tx, result).await
        })
        .await
    }

    async fn list_segments(&self, task_id: &str) -> Result<Vec<SegmentDbModel>> {
        let rows = sqlx::query_as::<_, SegmentDbModel>(
            "SELECT * FROM segments WHERE task_id = ? ORDER BY segment_index",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn update_segment(&self, segment: &SegmentDbModel) -> Result<()> {
        retry_on_sqlite_busy("update_segment", || async {
            let result = sqlx::query(
                r#"
                UPDATE segments SET
                    status = ?, retry_count = ?, size_bytes = ?, temp_path = ?,
                    error_message = ?, updated_at = ?
                WHERE task_id = ? AND segment_index = ?
                "#,
            )
            .bind(&segment.status)
            .bind(segment.retry_count)
            .bind(segment.size_bytes)
            .bind(&segment.temp_path)
            .bind(&segment.error_message)
            .bind(now_ms())
            .bind(&segment.task_id)
            .bind(segment.segment_index)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(Error::not_found(
                    "Segment",
                    format!("{}#{}", segment.task_id, segment.segment_index),
                ));
            }
            Ok(())
        })
        .await
    }

    async fn reset_segments_for_retry(&self, task_id: &str) -> Result<u64> {
        retry_on_sqlite_busy("reset_segments_for_retry", || async {
            let result = sqlx::query(
                r#"
                UPDATE segments
                SET status = ?, retry_count = 0, error_message = NULL, updated_at = ?
                WHERE task_id = ? AND status IN ('failed', 'downloading')
                "#,
            )
            .bind(SegmentStatus::Pending.as_str())
            .bind(now_ms())
            .bind(task_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn reset_downloading_segments(&self, task_id: &str) -> Result<u64> {
        retry_on_sqlite_busy("reset_downloading_segments", || async {
            let result = sqlx::query(
                "UPDATE segments SET status = 'pending', updated_at = ? WHERE task_id = ? AND status = 'downloading'",
            )
            .bind(now_ms())
            .bind(task_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }
}
