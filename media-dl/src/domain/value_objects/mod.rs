//! Domain value objects.
//!
//! Value objects are immutable objects that represent concepts in the domain
//! and are defined by their attributes rather than identity.

mod media_type;
mod progress;
mod retry_policy;
mod task_error;

pub use media_type::MediaType;
pub use progress::{DownloadProgress, SegmentProgress};
pub use retry_policy::{BackoffStrategy, MAX_ATTEMPTS_LIMIT, RetryPolicy};
pub use task_error::{ErrorCode, ErrorKind, TaskError};
