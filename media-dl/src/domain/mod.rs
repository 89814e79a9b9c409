//! Domain layer for media-dl.
//!
//! This module contains the core business logic, entities, and value objects.

pub mod spec;
pub mod task;
pub mod value_objects;

pub use spec::{DownloadSpec, VariantInfo};
pub use task::{DownloadTask, TaskStage, TaskStatus};
pub use value_objects::*;
