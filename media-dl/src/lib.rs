//! media-dl library crate.
//!
//! A durable, resumable download task manager for plain files and
//! segmented (HLS/DASH) media.

pub mod config;
pub mod database;
pub mod domain;
pub mod downloader;
pub mod error;
pub mod logging;
pub mod scheduler;
pub mod security;

pub use error::{Error, Result};
