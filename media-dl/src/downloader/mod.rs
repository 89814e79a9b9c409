//! Download drivers.
//!
//! - [`engine`]: the fetch transport (`reqwest` by default)
//! - [`SimpleDriver`]: single-stream files with range resume
//! - [`SegmentedDriver`]: HLS/DASH segment fan-out, per-segment retry and
//!   ordered concatenation
//! - [`ProgressAggregator`]: throttled progress snapshots with speed and ETA

pub mod engine;

mod driver;
mod error;
mod progress;
mod resolver;
mod retry;
mod segmented;
mod simple;

pub use driver::{
    DownloadDriver, DownloadHandle, DriverEvent, finalize_output, part_path, remove_partials,
    segment_file, segments_dir,
};
pub use error::DownloadError;
pub use progress::ProgressAggregator;
pub use resolver::{HlsPlaylistResolver, ResolvedPlaylist, ResolvedSegment, SegmentResolver};
pub use retry::retry_with_backoff;
pub use segmented::{SegmentedConfig, SegmentedDriver};
pub use simple::{RangeFallback, SimpleDriver};
