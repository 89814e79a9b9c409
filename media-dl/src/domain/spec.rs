//! Download request submitted by the caller.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::value_objects::{MediaType, RetryPolicy};
use crate::{Error, Result};

/// Variant chosen by the manifest resolver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariantInfo {
    pub bandwidth: Option<u64>,
    pub resolution: Option<String>,
    pub codecs: Option<String>,
    /// Media playlist of the variant (HLS) or representation manifest (DASH).
    pub manifest_url: Option<String>,
}

/// Immutable description of what to download.
///
/// Header keys are lowercase. The metadata bag is opaque to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadSpec {
    pub url: String,
    pub media_type: MediaType,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub save_dir: Option<PathBuf>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub variant: Option<VariantInfo>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    /// Higher values are scheduled sooner.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub custom_quality: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Set by the manifest resolver when the media is DRM-protected.
    #[serde(default)]
    pub drm_protected: bool,
    /// Set by the manifest resolver when the playlist is live (still growing).
    #[serde(default)]
    pub live: bool,
}

impl DownloadSpec {
    /// Create a new spec with required fields.
    pub fn new(url: impl Into<String>, media_type: MediaType) -> Self {
        Self {
            url: url.into(),
            media_type,
            filename: None,
            save_dir: None,
            headers: BTreeMap::new(),
            variant: None,
            retry_policy: None,
            priority: 0,
            custom_quality: None,
            metadata: BTreeMap::new(),
            drm_protected: false,
            live: false,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_save_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.save_dir = Some(dir.into());
        self
    }

    /// Add a header; the key is stored lowercase.
    pub fn with_header(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(key.as_ref().trim().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_variant(mut self, variant: VariantInfo) -> Self {
        self.variant = Some(variant);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_drm_protected(mut self, drm_protected: bool) -> Self {
        self.drm_protected = drm_protected;
        self
    }

    pub fn with_live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    /// Lowercase all header keys (specs deserialized from the boundary may not be).
    pub fn normalized(mut self) -> Self {
        self.url = self.url.trim().to_string();
        self.headers = std::mem::take(&mut self.headers)
            .into_iter()
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v))
            .collect();
        self
    }

    /// Check required fields. This is the only validation a spec goes through.
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(Error::invalid_argument("url must not be empty"));
        }
        url::Url::parse(&self.url)
            .map_err(|e| Error::invalid_argument(format!("invalid url '{}': {}", self.url, e)))?;

        if let Some(filename) = &self.filename
            && (filename.is_empty()
                || filename.contains(['/', '\\'])
                || filename == "."
                || filename == "..")
        {
            return Err(Error::invalid_argument(format!(
                "invalid filename '{}'",
                filename
            )));
        }

        if let Some(policy) = &self.retry_policy {
            policy.validate()?;
        }
        Ok(())
    }

    /// Output filename: the explicit one, or one derived from the URL path.
    pub fn resolved_filename(&self, task_id: &str) -> String {
        if let Some(name) = &self.filename {
            return name.clone();
        }

        let from_url = url::Url::parse(&self.url).ok().and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
                .filter(|s| !s.is_empty())
        });

        let ext = self.media_type.default_extension();
        match from_url {
            Some(name) if self.media_type.is_segmented() => {
                let stem = name.rsplit_once('.').map_or(name.as_str(), |(stem, _)| stem);
                format!("{}.{}", stem, ext)
            }
            Some(name) => name,
            None => format!("{}.{}", task_id, ext),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_are_lowercase() {
        let spec = DownloadSpec::new("https://x/a.mp4", MediaType::File)
            .with_header("User-Agent", "ua")
            .with_header(" Referer ", "https://x/");
        assert_eq!(spec.headers.get("user-agent").map(String::as_str), Some("ua"));
        assert!(spec.headers.contains_key("referer"));
    }

    #[test]
    fn test_normalized_lowercases_deserialized_headers() {
        let json = r#"{"url":" https://x/a.mp4 ","media_type":"file","headers":{"X-Token":"1"}}"#;
        let spec: DownloadSpec = serde_json::from_str(json).unwrap();
        let spec = spec.normalized();
        assert_eq!(spec.url, "https://x/a.mp4");
        assert!(spec.headers.contains_key("x-token"));
    }

    #[test]
    fn test_validate() {
        assert!(DownloadSpec::new("https://x/a.mp4", MediaType::File).validate().is_ok());
        assert!(DownloadSpec::new("  ", MediaType::File).validate().is_err());
        assert!(DownloadSpec::new("not a url", MediaType::File).validate().is_err());
        assert!(
            DownloadSpec::new("https://x/a.mp4", MediaType::File)
                .with_filename("../evil")
                .validate()
                .is_err()
        );
        assert!(
            DownloadSpec::new("https://x/a.mp4", MediaType::File)
                .with_retry_policy(RetryPolicy::exponential(42, 10, None))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_resolved_filename() {
        let file = DownloadSpec::new("https://x/media/a.mp4?sig=1", MediaType::File);
        assert_eq!(file.resolved_filename("t1"), "a.mp4");

        let hls = DownloadSpec::new("https://x/live/index.m3u8", MediaType::Hls);
        assert_eq!(hls.resolved_filename("t1"), "index.ts");

        let bare = DownloadSpec::new("https://x/", MediaType::Dash);
        assert_eq!(bare.resolved_filename("t1"), "t1.mp4");

        let named = DownloadSpec::new("https://x/a.mp4", MediaType::File).with_filename("b.mp4");
        assert_eq!(named.resolved_filename("t1"), "b.mp4");
    }
}
