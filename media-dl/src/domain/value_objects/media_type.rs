//! Media type value object.

use serde::{Deserialize, Serialize};

/// Kind of media a task downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    /// A single file fetched as one byte stream.
    #[default]
    File,
    /// HTTP Live Streaming playlist.
    Hls,
    /// MPEG-DASH manifest.
    Dash,
}

impl MediaType {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Hls => "hls",
            Self::Dash => "dash",
        }
    }

    /// Parse from database string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "file" => Some(Self::File),
            "hls" => Some(Self::Hls),
            "dash" => Some(Self::Dash),
            _ => None,
        }
    }

    /// Whether tasks of this type are downloaded segment by segment.
    pub fn is_segmented(&self) -> bool {
        matches!(self, Self::Hls | Self::Dash)
    }

    /// Extension used when no filename was supplied.
    pub fn default_extension(&self) -> &'static str {
        match self {
            Self::File => "bin",
            Self::Hls => "ts",
            Self::Dash => "mp4",
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
