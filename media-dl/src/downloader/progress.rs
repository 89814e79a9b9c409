//! Progress aggregation.
//!
//! Drivers report absolute counters at whatever rate they read data. The
//! aggregator keeps the latest sample, derives speed and ETA, and decides
//! when a snapshot may be published: at most once per interval, always the
//! most recent sample, plus a final flush on terminal state.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::domain::{DownloadProgress, SegmentProgress};

#[derive(Debug)]
pub struct ProgressAggregator {
    progress: DownloadProgress,
    interval: Duration,
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    last_emit: Option<Instant>,
    dirty: bool,
}

impl ProgressAggregator {
    /// Start from `initial`, e.g. the persisted progress of a resumed task.
    pub fn new(initial: DownloadProgress, interval: Duration, window: Duration) -> Self {
        Self {
            progress: initial,
            interval,
            window: window.max(Duration::from_millis(1)),
            samples: VecDeque::new(),
            last_emit: None,
            dirty: false,
        }
    }

    pub fn snapshot(&self) -> &DownloadProgress {
        &self.progress
    }

    /// Record the absolute byte counters.
    ///
    /// Counters never move backwards; use [`reset`](Self::reset) for a restart.
    pub fn record_bytes(&mut self, downloaded: u64, total: Option<u64>, now: Instant) {
        let downloaded = downloaded.max(self.progress.downloaded_bytes);
        self.progress.downloaded_bytes = downloaded;
        if total.is_some() {
            self.progress.total_bytes = total;
        }
        self.push_sample(now, downloaded);
        self.recompute();
    }

    /// Record segment counters.
    pub fn record_segments(&mut self, segments: SegmentProgress, now: Instant) {
        self.progress.segments = Some(segments);
        let downloaded = self.progress.downloaded_bytes;
        self.push_sample(now, downloaded);
        self.recompute();
    }

    /// Forget all byte progress (restart from zero).
    pub fn reset(&mut self, now: Instant) {
        self.progress.downloaded_bytes = 0;
        self.progress.total_bytes = None;
        self.samples.clear();
        self.push_sample(now, 0);
        self.recompute();
    }

    /// Snapshot to publish now, if the interval has elapsed since the last one.
    pub fn poll_emit(&mut self, now: Instant) -> Option<DownloadProgress> {
        if !self.dirty {
            return None;
        }
        if let Some(last) = self.last_emit
            && now.saturating_duration_since(last) < self.interval
        {
            return None;
        }
        self.last_emit = Some(now);
        self.dirty = false;
        Some(self.progress.clone())
    }

    /// Whether a sample is waiting for the next tick.
    pub fn has_pending(&self) -> bool {
        self.dirty
    }

    /// Final snapshot regardless of the timer, with rates cleared.
    pub fn flush(&mut self) -> DownloadProgress {
        self.dirty = false;
        self.progress.clear_rates();
        self.progress.clone()
    }

    fn push_sample(&mut self, now: Instant, bytes: u64) {
        self.samples.push_back((now, bytes));
        while let Some(&(at, _)) = self.samples.front() {
            if now.saturating_duration_since(at) > self.window && self.samples.len() > 2 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        self.dirty = true;
    }

    fn speed_bps(&self) -> Option<u64> {
        let (first_at, first_bytes) = *self.samples.front()?;
        let (last_at, last_bytes) = *self.samples.back()?;
        let elapsed = last_at.saturating_duration_since(first_at);
        if elapsed.is_zero() {
            return None;
        }
        let bytes = last_bytes.saturating_sub(first_bytes) as f64;
        Some((bytes / elapsed.as_secs_f64()).round() as u64)
    }

    fn recompute(&mut self) {
        self.progress.recompute_percent();
        self.progress.speed_bps = self.speed_bps();
        self.progress.eta_ms = match (self.progress.remaining_bytes(), self.progress.speed_bps) {
            (Some(remaining), Some(speed)) if speed > 0 => {
                Some((remaining as f64 / speed as f64 * 1000.0).round() as u64)
            }
            _ => None,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator() -> ProgressAggregator {
        ProgressAggregator::new(
            DownloadProgress::default(),
            Duration::from_millis(150),
            Duration::from_secs(3),
        )
    }

    #[test]
    fn test_throttles_but_keeps_latest() {
        let mut agg = aggregator();
        let t0 = Instant::now();

        agg.record_bytes(100, Some(1000), t0);
        assert_eq!(agg.poll_emit(t0).unwrap().downloaded_bytes, 100);

        agg.record_bytes(200, Some(1000), t0 + Duration::from_millis(50));
        agg.record_bytes(300, Some(1000), t0 + Duration::from_millis(100));
        assert!(agg.poll_emit(t0 + Duration::from_millis(100)).is_none());
        assert!(agg.has_pending());

        let next = agg.poll_emit(t0 + Duration::from_millis(150)).unwrap();
        assert_eq!(next.downloaded_bytes, 300);
        assert!(agg.poll_emit(t0 + Duration::from_millis(400)).is_none());
    }

    #[test]
    fn test_speed_and_eta() {
        let mut agg = aggregator();
        let t0 = Instant::now();
        agg.record_bytes(0, Some(10_000), t0);
        agg.record_bytes(2_000, Some(10_000), t0 + Duration::from_secs(1));

        let progress = agg.snapshot();
        assert_eq!(progress.speed_bps, Some(2_000));
        assert_eq!(progress.eta_ms, Some(4_000));
        assert_eq!(progress.percent, 20.0);
    }

    #[test]
    fn test_eta_omitted_without_total() {
        let mut agg = aggregator();
        let t0 = Instant::now();
        agg.record_bytes(0, None, t0);
        agg.record_bytes(500, None, t0 + Duration::from_secs(1));
        assert_eq!(agg.snapshot().speed_bps, Some(500));
        assert_eq!(agg.snapshot().eta_ms, None);
    }

    #[test]
    fn test_counters_are_monotonic() {
        let mut agg = ProgressAggregator::new(
            DownloadProgress::with_bytes(5_000_000, Some(10_000_000)),
            Duration::from_millis(150),
            Duration::from_secs(3),
        );
        agg.record_bytes(10, None, Instant::now());
        assert_eq!(agg.snapshot().downloaded_bytes, 5_000_000);
    }

    #[test]
    fn test_reset_and_flush() {
        let mut agg = aggregator();
        let t0 = Instant::now();
        agg.record_bytes(700, Some(1000), t0);
        agg.reset(t0 + Duration::from_millis(10));
        assert_eq!(agg.snapshot().downloaded_bytes, 0);

        agg.record_bytes(1000, Some(1000), t0 + Duration::from_millis(20));
        let last = agg.flush();
        assert_eq!(last.percent, 100.0);
        assert!(last.speed_bps.is_none());
        assert!(!agg.has_pending());
    }
}
