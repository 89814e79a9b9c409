//! reqwest-backed [`Transport`].

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, HeaderMap, HeaderName, HeaderValue, RANGE};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::error::Error as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::traits::{FetchRequest, FetchResponse, Transport};
use crate::downloader::DownloadError;
use crate::security::UrlValidator;

/// Configuration of [`HttpTransport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpTransportConfig {
    pub user_agent: String,
    pub connect_timeout_ms: u64,
    /// Maximum idle time between body chunks.
    pub read_timeout_ms: u64,
    pub max_redirects: usize,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("media-dl/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout_ms: 15_000,
            read_timeout_ms: 30_000,
            max_redirects: 10,
        }
    }
}

/// Raised from the redirect policy when a hop fails validation.
#[derive(Debug, thiserror::Error)]
#[error("redirect to {url} rejected: {reason}")]
struct RedirectRejected {
    url: String,
    reason: String,
}

/// Plain HTTP(S) GET with `Range` support.
///
/// Every redirect hop is re-validated through the [`UrlValidator`].
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(
        config: &HttpTransportConfig,
        validator: Arc<dyn UrlValidator>,
    ) -> Result<Self, DownloadError> {
        let max_redirects = config.max_redirects;
        let policy = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= max_redirects {
                return attempt.error(format!("too many redirects (max {})", max_redirects));
            }
            let verdict = validator.validate(attempt.url().as_str());
            match verdict.reason() {
                None => attempt.follow(),
                Some(reason) => {
                    let err = RedirectRejected {
                        url: attempt.url().to_string(),
                        reason: reason.to_string(),
                    };
                    attempt.error(err)
                }
            }
        });

        let client = Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .read_timeout(Duration::from_millis(config.read_timeout_ms))
            .pool_max_idle_per_host(8)
            .redirect(policy)
            .build()?;

        Ok(Self { client })
    }

    fn build_headers(request: &FetchRequest) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "Skipping invalid request header"),
            }
        }
        if let Some(range) = request.range
            && let Ok(value) = HeaderValue::from_str(&range.header_value())
        {
            headers.insert(RANGE, value);
        }
        headers
    }
}

/// Total size from a `Content-Range: bytes a-b/total` header.
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_RANGE)?
        .to_str()
        .ok()?
        .rsplit_once('/')
        .and_then(|(_, total)| total.trim().parse().ok())
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn map_send_error(url: &str, err: reqwest::Error) -> DownloadError {
    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(rejected) = inner.downcast_ref::<RedirectRejected>() {
            return DownloadError::UnsafeUrl {
                url: rejected.url.clone(),
                reason: rejected.reason.clone(),
            };
        }
        source = inner.source();
    }
    debug!(url, error = %err, "HTTP request failed");
    DownloadError::from(err)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, DownloadError> {
        let headers = Self::build_headers(&request);
        trace!(url = %request.url, range = ?request.range, "Fetching");

        let response = self
            .client
            .get(&request.url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| map_send_error(&request.url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(status, &request.url, "fetch"));
        }

        let requested_offset = request.range.map(|r| r.offset).unwrap_or(0);
        let (range_honoured, total_size) = if status == StatusCode::PARTIAL_CONTENT {
            (true, content_range_total(response.headers()))
        } else {
            // A 200 carries the whole resource from byte 0.
            (requested_offset == 0, content_length(response.headers()))
        };

        let body = response.bytes_stream().map_err(DownloadError::from);

        Ok(FetchResponse {
            status: status.as_u16(),
            total_size,
            range_honoured,
            body: Box::pin(body),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_range_total() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_RANGE, HeaderValue::from_static("bytes 100-999/1000"));
        assert_eq!(content_range_total(&headers), Some(1000));

        headers.insert(CONTENT_RANGE, HeaderValue::from_static("bytes 100-999/*"));
        assert_eq!(content_range_total(&headers), None);
    }

    #[test]
    fn test_request_headers() {
        let request = FetchRequest::new("https://example.com/a")
            .with_headers([("referer".to_string(), "https://example.com/".to_string())].into())
            .with_range(Some(super::super::ByteRange::from_offset(42)));
        let headers = HttpTransport::build_headers(&request);
        assert_eq!(headers.get(RANGE).unwrap(), "bytes=42-");
        assert_eq!(headers.get("referer").unwrap(), "https://example.com/");
    }
}
