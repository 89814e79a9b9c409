//! Download progress value objects.

use serde::{Deserialize, Serialize};

/// Segment counters of an HLS/DASH task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentProgress {
    /// Total number of segments, unknown for live-growing playlists.
    pub total: Option<u32>,
    pub downloaded: u32,
    pub failed: u32,
    pub current_index: Option<u32>,
    pub target_duration_secs: Option<f64>,
    pub media_sequence: Option<u64>,
}

impl SegmentProgress {
    /// Segments that are neither downloaded nor permanently failed.
    pub fn remaining(&self) -> Option<u32> {
        self.total
            .map(|total| total.saturating_sub(self.downloaded + self.failed))
    }
}

/// Progress snapshot of a task.
///
/// `percent`, `speed_bps` and `eta_ms` are derived values; byte and segment
/// counters are the source of truth.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub percent: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub speed_bps: Option<u64>,
    pub eta_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segments: Option<SegmentProgress>,
}

impl DownloadProgress {
    /// Progress of a task that has already written `downloaded_bytes`.
    pub fn with_bytes(downloaded_bytes: u64, total_bytes: Option<u64>) -> Self {
        let mut progress = Self {
            downloaded_bytes,
            total_bytes,
            ..Default::default()
        };
        progress.recompute_percent();
        progress
    }

    /// Recompute `percent` from the counters.
    ///
    /// Segment counts win over bytes for segmented tasks because the byte
    /// total of a playlist is rarely known up front.
    pub fn recompute_percent(&mut self) {
        if let Some(total) = self.total_bytes
            && self.downloaded_bytes > total
        {
            self.total_bytes = Some(self.downloaded_bytes);
        }

        let ratio = match (&self.segments, self.total_bytes) {
            (Some(seg), _) if seg.total.is_some_and(|t| t > 0) => {
                let total = seg.total.unwrap_or(1) as f64;
                Some((seg.downloaded + seg.failed) as f64 / total)
            }
            (_, Some(total)) if total > 0 => Some(self.downloaded_bytes as f64 / total as f64),
            _ => None,
        };

        self.percent = ratio.map_or(0.0, |r| (r * 100.0).clamp(0.0, 100.0));
    }

    /// Bytes left to download when the total is known.
    pub fn remaining_bytes(&self) -> Option<u64> {
        self.total_bytes
            .map(|total| total.saturating_sub(self.downloaded_bytes))
    }

    /// Clear the rate-derived fields (used once a transfer stops).
    pub fn clear_rates(&mut self) {
        self.speed_bps = None;
        self.eta_ms = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_from_bytes() {
        let progress = DownloadProgress::with_bytes(250, Some(1000));
        assert_eq!(progress.percent, 25.0);
        assert_eq!(progress.remaining_bytes(), Some(750));
    }

    #[test]
    fn test_percent_unknown_total() {
        let progress = DownloadProgress::with_bytes(250, None);
        assert_eq!(progress.percent, 0.0);
        assert_eq!(progress.remaining_bytes(), None);
    }

    #[test]
    fn test_downloaded_never_exceeds_total() {
        let progress = DownloadProgress::with_bytes(1200, Some(1000));
        assert_eq!(progress.total_bytes, Some(1200));
        assert_eq!(progress.percent, 100.0);
    }

    #[test]
    fn test_percent_from_segments() {
        let mut progress = DownloadProgress {
            downloaded_bytes: 10,
            segments: Some(SegmentProgress {
                total: Some(10),
                downloaded: 4,
                failed: 1,
                ..Default::default()
            }),
            ..Default::default()
        };
        progress.recompute_percent();
        assert_eq!(progress.percent, 50.0);
        assert_eq!(progress.segments.as_ref().unwrap().remaining(), Some(5));
    }
}
