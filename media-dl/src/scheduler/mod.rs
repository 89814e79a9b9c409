//! Scheduler module for orchestrating download tasks.
//!
//! The scheduler is responsible for:
//! - Admitting queued tasks by priority under a concurrency limit
//! - Supervising running drivers and persisting their progress
//! - Pausing, resuming, canceling and retrying tasks
//! - Recovering interrupted work after a crash
//! - Broadcasting task events to subscribers

mod events;
mod queue;
mod service;

pub use events::{TaskEvent, TaskEventBus};
pub use queue::AdmissionQueue;
pub use service::TaskManager;
