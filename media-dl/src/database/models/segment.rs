//! Segment database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// Row of the `segments` table, keyed by `(task_id, segment_index)`.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct SegmentDbModel {
    pub task_id: String,
    pub segment_index: i64,
    pub url: String,
    /// Byte offset for `EXT-X-BYTERANGE` style sub-ranges.
    pub range_offset: Option<i64>,
    pub range_length: Option<i64>,
    pub duration_secs: Option<f64>,
    pub size_bytes: Option<i64>,
    /// pending, downloading, completed, failed
    pub status: String,
    pub retry_count: i64,
    pub temp_path: Option<String>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SegmentDbModel {
    pub fn new(task_id: impl Into<String>, index: u32, url: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            task_id: task_id.into(),
            segment_index: i64::from(index),
            url: url.into(),
            range_offset: None,
            range_length: None,
            duration_secs: None,
            size_bytes: None,
            status: SegmentStatus::Pending.as_str().to_string(),
            retry_count: 0,
            temp_path: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn index(&self) -> u32 {
        u32::try_from(self.segment_index).unwrap_or_default()
    }

    pub fn status(&self) -> SegmentStatus {
        SegmentStatus::parse(&self.status).unwrap_or(SegmentStatus::Pending)
    }

    pub fn set_status(&mut self, status: SegmentStatus) {
        self.status = status.as_str().to_string();
        self.updated_at = now_ms();
    }
}

/// Segment status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentStatus {
    Pending,
    Downloading,
    Completed,
    /// Retries exhausted.
    Failed,
}

impl SegmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "downloading" => Some(Self::Downloading),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_new() {
        let segment = SegmentDbModel::new("task-1", 3, "https://x/3.ts");
        assert_eq!(segment.index(), 3);
        assert_eq!(segment.status(), SegmentStatus::Pending);
        assert_eq!(segment.retry_count, 0);
    }
}
