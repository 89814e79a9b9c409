//! Segment list resolution for HLS/DASH tasks.

use async_trait::async_trait;
use futures::StreamExt;
use m3u8_rs::{KeyMethod, MasterPlaylist, MediaPlaylist, MediaPlaylistType, Playlist, VariantStream};
use tracing::debug;
use url::Url;

use super::DownloadError;
use super::engine::{ByteRange, FetchRequest, Transport};
use crate::domain::{DownloadSpec, MediaType, VariantInfo};

/// Upper bound on a playlist body.
const MAX_PLAYLIST_BYTES: usize = 16 * 1024 * 1024;

/// One fetchable segment.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSegment {
    pub url: String,
    pub range: Option<ByteRange>,
    pub duration_secs: Option<f64>,
}

/// Concrete segment list of a segmented task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedPlaylist {
    pub segments: Vec<ResolvedSegment>,
    /// The playlist is still growing (no end marker).
    pub live: bool,
    pub drm_protected: bool,
    pub target_duration_secs: Option<f64>,
    pub media_sequence: Option<u64>,
    /// Variant picked from a master playlist.
    pub variant: Option<VariantInfo>,
}

/// Produces the segment list for a segmented [`DownloadSpec`].
#[async_trait]
pub trait SegmentResolver: Send + Sync {
    async fn resolve(
        &self,
        spec: &DownloadSpec,
        transport: &dyn Transport,
    ) -> Result<ResolvedPlaylist, DownloadError>;
}

/// HLS resolver built on `m3u8-rs`.
///
/// DASH manifests are rejected with `UNSUPPORTED_PROTOCOL`; embedders that
/// need DASH supply their own [`SegmentResolver`].
#[derive(Debug, Default, Clone)]
pub struct HlsPlaylistResolver;

impl HlsPlaylistResolver {
    pub fn new() -> Self {
        Self
    }

    async fn fetch_playlist(
        transport: &dyn Transport,
        url: &str,
        spec: &DownloadSpec,
    ) -> Result<Playlist, DownloadError> {
        let request = FetchRequest::new(url).with_headers(spec.headers.clone());
        let mut body = transport.fetch(request).await?.body;

        let mut buf = Vec::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
            if buf.len() > MAX_PLAYLIST_BYTES {
                return Err(DownloadError::playlist(format!(
                    "playlist {} exceeds {} bytes",
                    url, MAX_PLAYLIST_BYTES
                )));
            }
        }

        m3u8_rs::parse_playlist_res(&buf)
            .map_err(|e| DownloadError::playlist(format!("failed to parse {}: {}", url, e)))
    }

    fn select_variant<'a>(
        master: &'a MasterPlaylist,
        wanted: Option<&VariantInfo>,
    ) -> Option<&'a VariantStream> {
        let candidates = || master.variants.iter().filter(|v| !v.is_i_frame);

        if let Some(wanted) = wanted {
            if let Some(resolution) = &wanted.resolution
                && let Some(found) = candidates().find(|v| {
                    v.resolution
                        .is_some_and(|r| &format!("{}x{}", r.width, r.height) == resolution)
                })
            {
                return Some(found);
            }
            if let Some(bandwidth) = wanted.bandwidth {
                return candidates().min_by_key(|v| v.bandwidth.abs_diff(bandwidth));
            }
        }
        candidates().max_by_key(|v| v.bandwidth)
    }

    fn variant_info(variant: &VariantStream, url: &Url) -> VariantInfo {
        VariantInfo {
            bandwidth: Some(variant.bandwidth),
            resolution: variant
                .resolution
                .map(|r| format!("{}x{}", r.width, r.height)),
            codecs: variant.codecs.clone(),
            manifest_url: Some(url.to_string()),
        }
    }

    /// Flatten a media playlist into fetchable segments.
    fn segments(media: &MediaPlaylist, base: &Url) -> Result<ResolvedPlaylist, DownloadError> {
        let mut segments = Vec::with_capacity(media.segments.len());
        let mut drm_protected = false;
        let mut encrypted = false;
        let mut last_range_end: Option<(String, u64)> = None;

        for segment in &media.segments {
            if let Some(key) = &segment.key {
                let identity = key
                    .keyformat
                    .as_deref()
                    .is_none_or(|format| format == "identity");
                match &key.method {
                    KeyMethod::None => {}
                    KeyMethod::AES128 if identity => encrypted = true,
                    _ => drm_protected = true,
                }
            }

            let url = base
                .join(segment.uri.trim())
                .map_err(|e| DownloadError::invalid_url(&segment.uri, e.to_string()))?
                .to_string();

            let range = match &segment.byte_range {
                None => {
                    last_range_end = None;
                    None
                }
                Some(byte_range) => {
                    let offset = match byte_range.offset {
                        Some(offset) => offset,
                        None => match &last_range_end {
                            Some((prev_url, end)) if *prev_url == url => *end,
                            _ => {
                                return Err(DownloadError::playlist(format!(
                                    "BYTERANGE without offset for {}",
                                    url
                                )));
                            }
                        },
                    };
                    last_range_end = Some((url.clone(), offset + byte_range.length));
                    Some(ByteRange::new(offset, byte_range.length))
                }
            };

            segments.push(ResolvedSegment {
                url,
                range,
                duration_secs: Some(f64::from(segment.duration)),
            });
        }

        if encrypted && !drm_protected {
            return Err(DownloadError::UnsupportedProtocol {
                protocol: "HLS with AES-128 encryption".to_string(),
            });
        }

        let live = !media.end_list && media.playlist_type != Some(MediaPlaylistType::Vod);

        Ok(ResolvedPlaylist {
            segments,
            live,
            drm_protected,
            target_duration_secs: Some(media.target_duration as f64),
            media_sequence: Some(media.media_sequence),
            variant: None,
        })
    }
}

#[async_trait]
impl SegmentResolver for HlsPlaylistResolver {
    async fn resolve(
        &self,
        spec: &DownloadSpec,
        transport: &dyn Transport,
    ) -> Result<ResolvedPlaylist, DownloadError> {
        if spec.media_type != MediaType::Hls {
            return Err(DownloadError::UnsupportedProtocol {
                protocol: spec.media_type.to_string(),
            });
        }

        // A pre-selected variant playlist wins over the submitted URL.
        let start_url = spec
            .variant
            .as_ref()
            .and_then(|v| v.manifest_url.clone())
            .unwrap_or_else(|| spec.url.clone());
        let base = Url::parse(&start_url)
            .map_err(|e| DownloadError::invalid_url(&start_url, e.to_string()))?;

        match Self::fetch_playlist(transport, base.as_str(), spec).await? {
            Playlist::MediaPlaylist(media) => Self::segments(&media, &base),
            Playlist::MasterPlaylist(master) => {
                let variant = Self::select_variant(&master, spec.variant.as_ref())
                    .ok_or_else(|| DownloadError::playlist("master playlist has no variants"))?;
                let media_url = base
                    .join(variant.uri.trim())
                    .map_err(|e| DownloadError::invalid_url(&variant.uri, e.to_string()))?;
                debug!(
                    bandwidth = variant.bandwidth,
                    url = %media_url,
                    "Selected HLS variant"
                );

                match Self::fetch_playlist(transport, media_url.as_str(), spec).await? {
                    Playlist::MediaPlaylist(media) => {
                        let mut resolved = Self::segments(&media, &media_url)?;
                        resolved.variant = Some(Self::variant_info(variant, &media_url));
                        Ok(resolved)
                    }
                    Playlist::MasterPlaylist(_) => Err(DownloadError::playlist(format!(
                        "variant {} is a master playlist",
                        media_url
                    ))),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::engine::FetchResponse;
    use bytes::Bytes;
    use std::collections::HashMap;

    struct StaticTransport(HashMap<String, &'static str>);

    #[async_trait]
    impl Transport for StaticTransport {
        async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, DownloadError> {
            let body: &'static str = *self.0.get(&request.url).ok_or_else(|| {
                DownloadError::http_status(reqwest::StatusCode::NOT_FOUND, &request.url, "fetch")
            })?;
            Ok(FetchResponse {
                status: 200,
                total_size: Some(body.len() as u64),
                range_honoured: true,
                body: Box::pin(futures::stream::once(async move {
                    Ok(Bytes::from_static(body.as_bytes()))
                })),
            })
        }
    }

    const MASTER: &str = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360
low/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2400000,RESOLUTION=1280x720
high/index.m3u8
";

    const MEDIA: &str = "#EXTM3U
#EXT-X-VERSION:4
#EXT-X-TARGETDURATION:6
#EXT-X-MEDIA-SEQUENCE:42
#EXTINF:6.0,
seg0.ts
#EXTINF:6.0,
#EXT-X-BYTERANGE:1000@0
all.ts
#EXTINF:5.5,
#EXT-X-BYTERANGE:500
all.ts
#EXT-X-ENDLIST
";

    const LIVE: &str = "#EXTM3U
#EXT-X-TARGETDURATION:2
#EXTINF:2.0,
a.ts
";

    const DRM: &str = "#EXTM3U
#EXT-X-TARGETDURATION:2
#EXT-X-KEY:METHOD=SAMPLE-AES,URI=\"skd://key\",KEYFORMAT=\"com.apple.streamingkeydelivery\"
#EXTINF:2.0,
a.ts
#EXT-X-ENDLIST
";

    fn transport(entries: &[(&str, &'static str)]) -> StaticTransport {
        StaticTransport(
            entries
                .iter()
                .map(|(url, body)| (url.to_string(), *body))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_master_selects_highest_bandwidth() {
        let transport = transport(&[
            ("https://cdn.test/master.m3u8", MASTER),
            ("https://cdn.test/high/index.m3u8", MEDIA),
        ]);
        let spec = DownloadSpec::new("https://cdn.test/master.m3u8", MediaType::Hls);

        let resolved = HlsPlaylistResolver::new()
            .resolve(&spec, &transport)
            .await
            .unwrap();

        assert!(!resolved.live);
        assert!(!resolved.drm_protected);
        assert_eq!(resolved.media_sequence, Some(42));
        assert_eq!(resolved.segments.len(), 3);
        assert_eq!(resolved.segments[0].url, "https://cdn.test/high/seg0.ts");
        assert_eq!(resolved.segments[1].range, Some(ByteRange::new(0, 1000)));
        assert_eq!(resolved.segments[2].range, Some(ByteRange::new(1000, 500)));
        let variant = resolved.variant.unwrap();
        assert_eq!(variant.resolution.as_deref(), Some("1280x720"));
    }

    #[tokio::test]
    async fn test_requested_variant_by_bandwidth() {
        let transport = transport(&[
            ("https://cdn.test/master.m3u8", MASTER),
            ("https://cdn.test/low/index.m3u8", MEDIA),
        ]);
        let spec = DownloadSpec::new("https://cdn.test/master.m3u8", MediaType::Hls).with_variant(
            VariantInfo {
                bandwidth: Some(700_000),
                ..Default::default()
            },
        );

        let resolved = HlsPlaylistResolver::new()
            .resolve(&spec, &transport)
            .await
            .unwrap();
        assert_eq!(resolved.segments[0].url, "https://cdn.test/low/seg0.ts");
    }

    #[tokio::test]
    async fn test_live_and_drm_flags() {
        let transport = transport(&[
            ("https://cdn.test/live.m3u8", LIVE),
            ("https://cdn.test/drm.m3u8", DRM),
        ]);
        let resolver = HlsPlaylistResolver::new();

        let live = resolver
            .resolve(
                &DownloadSpec::new("https://cdn.test/live.m3u8", MediaType::Hls),
                &transport,
            )
            .await
            .unwrap();
        assert!(live.live);

        let drm = resolver
            .resolve(
                &DownloadSpec::new("https://cdn.test/drm.m3u8", MediaType::Hls),
                &transport,
            )
            .await
            .unwrap();
        assert!(drm.drm_protected);
    }

    #[tokio::test]
    async fn test_dash_is_unsupported() {
        let transport = transport(&[]);
        let err = HlsPlaylistResolver::new()
            .resolve(
                &DownloadSpec::new("https://cdn.test/a.mpd", MediaType::Dash),
                &transport,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::UnsupportedProtocol { .. }));
    }
}
