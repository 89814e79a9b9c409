//! Download task domain module.

mod entity;
mod state;

pub use entity::DownloadTask;
pub use state::{TaskStage, TaskStatus};
