//! Runtime configuration.
//!
//! [`ManagerConfig`] holds the task manager knobs; [`AppConfig`] bundles it
//! with the process-level settings loaded from the environment.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::RetryPolicy;
use crate::downloader::RangeFallback;
use crate::downloader::engine::HttpTransportConfig;
use crate::security::UrlSafetyConfig;
use crate::{Error, Result};

/// Upper bound for both concurrency knobs.
pub const MAX_CONCURRENCY: usize = 32;

/// Task manager configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Tasks allowed in `running` at once.
    pub max_concurrent_downloads: usize,
    /// Segments fetched in parallel within one segmented task.
    pub segment_concurrency: usize,
    /// Used for tasks whose spec carries no retry policy.
    pub default_retry_policy: RetryPolicy,
    /// Minimum spacing of progress events per task.
    pub progress_interval_ms: u64,
    /// Sliding window used for speed and ETA.
    pub speed_window_ms: u64,
    /// Share of permanently failed segments a task tolerates (0.0..=1.0).
    pub segment_failure_tolerance: f64,
    pub range_fallback: RangeFallback,
    /// How long pause/cancel wait for a driver before aborting it.
    pub cancel_grace_ms: u64,
    /// Default save directory.
    pub download_dir: PathBuf,
    /// Capacity of the task event broadcast channel.
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            segment_concurrency: 4,
            default_retry_policy: RetryPolicy::default(),
            progress_interval_ms: 150,
            speed_window_ms: 3000,
            segment_failure_tolerance: 0.0,
            range_fallback: RangeFallback::Fail,
            cancel_grace_ms: 5000,
            download_dir: PathBuf::from("downloads"),
            event_capacity: 256,
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_CONCURRENCY).contains(&self.max_concurrent_downloads) {
            return Err(Error::config(format!(
                "max_concurrent_downloads must be between 1 and {}, got {}",
                MAX_CONCURRENCY, self.max_concurrent_downloads
            )));
        }
        if !(1..=MAX_CONCURRENCY).contains(&self.segment_concurrency) {
            return Err(Error::config(format!(
                "segment_concurrency must be between 1 and {}, got {}",
                MAX_CONCURRENCY, self.segment_concurrency
            )));
        }
        if !(0.0..=1.0).contains(&self.segment_failure_tolerance) {
            return Err(Error::config(format!(
                "segment_failure_tolerance must be within 0.0..=1.0, got {}",
                self.segment_failure_tolerance
            )));
        }
        if self.progress_interval_ms == 0 || self.speed_window_ms == 0 {
            return Err(Error::config(
                "progress_interval_ms and speed_window_ms must be positive",
            ));
        }
        if self.event_capacity == 0 {
            return Err(Error::config("event_capacity must be positive"));
        }
        self.default_retry_policy
            .validate()
            .map_err(|e| Error::config(format!("default_retry_policy: {}", e)))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn speed_window(&self) -> Duration {
        Duration::from_millis(self.speed_window_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

/// Process configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub database_url: String,
    pub log_dir: PathBuf,
    pub manager: ManagerConfig,
    pub http: HttpTransportConfig,
    pub url_safety: UrlSafetyConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:media-dl.db?mode=rwc".to_string(),
            log_dir: PathBuf::from("logs"),
            manager: ManagerConfig::default(),
            http: HttpTransportConfig::default(),
            url_safety: UrlSafetyConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from environment variables after reading `.env`.
    ///
    /// Supported env vars:
    /// - `DATABASE_URL`
    /// - `MEDIA_DL_LOG_DIR`
    /// - `MEDIA_DL_DOWNLOAD_DIR`
    /// - `MEDIA_DL_MAX_CONCURRENT`
    /// - `MEDIA_DL_SEGMENT_CONCURRENCY`
    /// - `MEDIA_DL_RANGE_FALLBACK` (`fail` or `restart`)
    /// - `MEDIA_DL_SEGMENT_TOLERANCE`
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` as the variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(dir) = var("MEDIA_DL_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("MEDIA_DL_DOWNLOAD_DIR") {
            config.manager.download_dir = PathBuf::from(dir);
        }
        if let Some(value) = var("MEDIA_DL_MAX_CONCURRENT") {
            config.manager.max_concurrent_downloads =
                parse_var("MEDIA_DL_MAX_CONCURRENT", &value)?;
        }
        if let Some(value) = var("MEDIA_DL_SEGMENT_CONCURRENCY") {
            config.manager.segment_concurrency =
                parse_var("MEDIA_DL_SEGMENT_CONCURRENCY", &value)?;
        }
        if let Some(value) = var("MEDIA_DL_RANGE_FALLBACK") {
            config.manager.range_fallback = RangeFallback::parse(&value).ok_or_else(|| {
                Error::config(format!(
                    "MEDIA_DL_RANGE_FALLBACK must be `fail` or `restart`, got `{}`",
                    value
                ))
            })?;
        }
        if let Some(value) = var("MEDIA_DL_SEGMENT_TOLERANCE") {
            config.manager.segment_failure_tolerance =
                parse_var("MEDIA_DL_SEGMENT_TOLERANCE", &value)?;
        }

        config.manager.validate()?;
        Ok(config)
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::config(format!("invalid {} `{}`: {}", key, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = load(&[]).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.manager.max_concurrent_downloads, 3);
        assert_eq!(config.manager.range_fallback, RangeFallback::Fail);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("MEDIA_DL_MAX_CONCURRENT", "5"),
            ("MEDIA_DL_SEGMENT_CONCURRENCY", " 8 "),
            ("MEDIA_DL_RANGE_FALLBACK", "Restart"),
            ("MEDIA_DL_SEGMENT_TOLERANCE", "0.1"),
            ("MEDIA_DL_DOWNLOAD_DIR", "/data"),
        ])
        .unwrap();
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.manager.max_concurrent_downloads, 5);
        assert_eq!(config.manager.segment_concurrency, 8);
        assert_eq!(config.manager.range_fallback, RangeFallback::Restart);
        assert_eq!(config.manager.segment_failure_tolerance, 0.1);
        assert_eq!(config.manager.download_dir, PathBuf::from("/data"));
    }

    #[test]
    fn test_invalid_values() {
        for vars in [
            [("MEDIA_DL_MAX_CONCURRENT", "0")],
            [("MEDIA_DL_MAX_CONCURRENT", "many")],
            [("MEDIA_DL_SEGMENT_CONCURRENCY", "64")],
            [("MEDIA_DL_RANGE_FALLBACK", "retry")],
            [("MEDIA_DL_SEGMENT_TOLERANCE", "1.5")],
        ] {
            let err = load(&vars).unwrap_err();
            assert!(matches!(err, Error::Configuration(_)), "{vars:?}: {err}");
        }
    }

    #[test]
    fn test_manager_config_from_partial_json() {
        let config: ManagerConfig =
            serde_json::from_str(r#"{"max_concurrent_downloads": 2, "range_fallback": "restart"}"#)
                .unwrap();
        assert_eq!(config.max_concurrent_downloads, 2);
        assert_eq!(config.range_fallback, RangeFallback::Restart);
        assert_eq!(config.cancel_grace_ms, 5000);
        config.validate().unwrap();
    }
}
