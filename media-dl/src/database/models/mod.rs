//! Database models for media-dl.
//!
//! These models map directly to the database schema and handle
//! serialization/deserialization of JSON fields.

pub mod history;
pub mod segment;
pub mod task;

pub use history::*;
pub use segment::*;
pub use task::*;
