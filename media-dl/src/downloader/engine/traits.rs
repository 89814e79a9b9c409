//! Byte transport trait and related types.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::collections::BTreeMap;
use std::pin::Pin;

use crate::downloader::DownloadError;

/// A byte range of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    /// `None` reads to the end of the resource.
    pub length: Option<u64>,
}

impl ByteRange {
    pub fn from_offset(offset: u64) -> Self {
        Self {
            offset,
            length: None,
        }
    }

    pub fn new(offset: u64, length: u64) -> Self {
        Self {
            offset,
            length: Some(length),
        }
    }

    /// Value of the HTTP `Range` header.
    pub fn header_value(&self) -> String {
        match self.length {
            Some(0) | None => format!("bytes={}-", self.offset),
            Some(len) => format!("bytes={}-{}", self.offset, self.offset + len - 1),
        }
    }
}

/// A single fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub url: String,
    /// Lowercase header names.
    pub headers: BTreeMap<String, String>,
    pub range: Option<ByteRange>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            range: None,
        }
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_range(mut self, range: Option<ByteRange>) -> Self {
        self.range = range;
        self
    }
}

/// Stream of body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, DownloadError>> + Send>>;

/// Response of a fetch.
pub struct FetchResponse {
    pub status: u16,
    /// Size of the full resource when known (from `Content-Range` or `Content-Length`).
    pub total_size: Option<u64>,
    /// Whether the body starts at the requested range offset.
    ///
    /// Always `true` for requests without a range.
    pub range_honoured: bool,
    pub body: ByteStream,
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .field("total_size", &self.total_size)
            .field("range_honoured", &self.range_honoured)
            .finish_non_exhaustive()
    }
}

/// Fetches bytes from a URL.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue the request and return once the response headers are available.
    ///
    /// Non-success statuses are returned as errors.
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, DownloadError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_header() {
        assert_eq!(ByteRange::from_offset(500).header_value(), "bytes=500-");
        assert_eq!(ByteRange::new(100, 50).header_value(), "bytes=100-149");
        assert_eq!(ByteRange::new(100, 0).header_value(), "bytes=100-");
    }
}
