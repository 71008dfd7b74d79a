//! Response content negotiation
//!
//! Picks the representation sent to the client: capable clients get a WebP
//! re-encode when that is possible, everything else gets the bytes produced
//! by the transform stage. Also derives the content type from magic bytes
//! and builds the cache headers.

use crate::transform::{OutputFormat, Transformer};
use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, CACHE_CONTROL, ETAG, EXPIRES, VARY};
use image::ImageFormat;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

/// Content type used when the payload is not a recognised image
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// Rendering capability of the requesting client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientClass {
    /// Understands WebP
    Modern,
    Default,
}

impl ClientClass {
    /// Classify a client from its `User-Agent` and `Accept` headers
    ///
    /// An explicit `image/webp` in `Accept` wins; otherwise Chrome, Opera and
    /// Android user agents are treated as WebP capable.
    pub fn from_headers(user_agent: Option<&str>, accept: Option<&str>) -> Self {
        if accept.is_some_and(|accept| {
            accept
                .split(',')
                .any(|item| item.trim().to_ascii_lowercase().starts_with("image/webp"))
        }) {
            return ClientClass::Modern;
        }

        match user_agent {
            Some(ua) if ["Chrome", "Opera", "OPR/", "Android"]
                .iter()
                .any(|marker| ua.contains(marker)) =>
            {
                ClientClass::Modern
            }
            _ => ClientClass::Default,
        }
    }
}

/// Content type derived from the leading bytes of the payload
pub fn sniff_content_type(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(format) => format.to_mime_type(),
        Err(_) => DEFAULT_CONTENT_TYPE,
    }
}

/// Result of negotiating a payload
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub bytes: Bytes,
    pub content_type: &'static str,
    /// Whether the payload was re-encoded for the client
    pub converted: bool,
}

/// Opportunistic format conversion for capable clients
#[derive(Clone)]
pub struct ContentNegotiator {
    transformer: Arc<dyn Transformer>,
    webp: bool,
}

impl ContentNegotiator {
    pub fn new(transformer: Arc<dyn Transformer>, webp: bool) -> Self {
        ContentNegotiator { transformer, webp }
    }

    pub fn webp_enabled(&self) -> bool {
        self.webp
    }

    /// Choose the representation for `class`
    ///
    /// Conversion failures are logged and the original bytes are kept.
    pub async fn negotiate(&self, bytes: Bytes, class: ClientClass) -> Negotiated {
        if self.webp && class == ClientClass::Modern && is_convertible(&bytes) {
            match self.transformer.convert(bytes.clone(), OutputFormat::WebP).await {
                Ok(converted) => {
                    debug!(
                        "Re-encoded payload as WebP ({} -> {} bytes)",
                        bytes.len(),
                        converted.len()
                    );
                    return Negotiated {
                        content_type: sniff_content_type(&converted),
                        bytes: converted,
                        converted: true,
                    };
                }
                Err(e) => warn!("WebP conversion failed, serving original: {}", e),
            }
        }

        Negotiated {
            content_type: sniff_content_type(&bytes),
            bytes,
            converted: false,
        }
    }
}

/// Raster images other than WebP and GIF (animation would be lost)
fn is_convertible(bytes: &[u8]) -> bool {
    matches!(
        image::guess_format(bytes),
        Ok(format) if format != ImageFormat::WebP && format != ImageFormat::Gif
    )
}

/// Cache header policy for successful responses
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    pub enabled: bool,
    pub max_age: Duration,
    pub vary: bool,
}

impl CachePolicy {
    /// Headers for a successful response to `request_url`
    ///
    /// The ETag fingerprints the request URL, not the content.
    pub fn headers(&self, request_url: &str, now: SystemTime) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if !self.enabled {
            return headers;
        }

        let cache_control = format!("public, max-age={}", self.max_age.as_secs());
        let expires = httpdate::fmt_http_date(expiry(now, self.max_age));
        let etag = format!("W/\"{:016x}\"", xxh3_64(request_url.as_bytes()));

        for (name, value) in [(CACHE_CONTROL, cache_control), (EXPIRES, expires), (ETAG, etag)] {
            match HeaderValue::from_str(&value) {
                Ok(value) => {
                    headers.insert(name, value);
                }
                Err(e) => warn!("Skipping invalid {} header: {}", name, e),
            }
        }

        if self.vary {
            headers.insert(VARY, HeaderValue::from_static("Accept, User-Agent"));
        }

        headers
    }
}

/// Latest instant `httpdate` can render (9999-12-31T23:59:59Z)
const MAX_HTTP_DATE_SECS: u64 = 253_402_300_799;

fn expiry(now: SystemTime, max_age: Duration) -> SystemTime {
    let latest = SystemTime::UNIX_EPOCH + Duration::from_secs(MAX_HTTP_DATE_SECS);
    now.checked_add(max_age)
        .map_or(latest, |deadline| deadline.min(latest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EdgeError, Result};
    use crate::models::TransformOptions;
    use async_trait::async_trait;

    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";
    const GIF_MAGIC: &[u8] = b"GIF89a\x01\0\x01\0";

    struct FailingConvert;

    #[async_trait]
    impl Transformer for FailingConvert {
        async fn transform(&self, bytes: Bytes, _options: &TransformOptions) -> Result<Bytes> {
            Ok(bytes)
        }

        async fn convert(&self, _bytes: Bytes, _format: OutputFormat) -> Result<Bytes> {
            Err(EdgeError::Transform("encoder unavailable".to_string()))
        }
    }

    #[test]
    fn test_client_class_from_accept() {
        assert_eq!(
            ClientClass::from_headers(None, Some("image/avif,image/webp,*/*")),
            ClientClass::Modern
        );
        assert_eq!(
            ClientClass::from_headers(None, Some("image/png")),
            ClientClass::Default
        );
    }

    #[test]
    fn test_client_class_from_user_agent() {
        let chrome = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 Chrome/120.0 Safari/537.36";
        let firefox = "Mozilla/5.0 (X11; Linux x86_64; rv:120.0) Gecko/20100101 Firefox/120.0";
        assert_eq!(ClientClass::from_headers(Some(chrome), None), ClientClass::Modern);
        assert_eq!(ClientClass::from_headers(Some(firefox), None), ClientClass::Default);
        assert_eq!(ClientClass::from_headers(None, None), ClientClass::Default);
    }

    #[test]
    fn test_sniff_content_type() {
        assert_eq!(sniff_content_type(PNG_MAGIC), "image/png");
        assert_eq!(sniff_content_type(GIF_MAGIC), "image/gif");
        assert_eq!(sniff_content_type(b"Remote file missing."), DEFAULT_CONTENT_TYPE);
        assert_eq!(sniff_content_type(b""), DEFAULT_CONTENT_TYPE);
    }

    #[tokio::test]
    async fn test_conversion_failure_keeps_original() {
        let negotiator = ContentNegotiator::new(Arc::new(FailingConvert), true);
        let bytes = Bytes::from_static(PNG_MAGIC);

        let out = negotiator.negotiate(bytes.clone(), ClientClass::Modern).await;
        assert_eq!(out.bytes, bytes);
        assert!(!out.converted);
        assert_eq!(out.content_type, "image/png");
    }

    #[tokio::test]
    async fn test_gif_and_default_clients_untouched() {
        let negotiator = ContentNegotiator::new(Arc::new(FailingConvert), true);

        let gif = negotiator
            .negotiate(Bytes::from_static(GIF_MAGIC), ClientClass::Modern)
            .await;
        assert!(!gif.converted);

        let png = negotiator
            .negotiate(Bytes::from_static(PNG_MAGIC), ClientClass::Default)
            .await;
        assert!(!png.converted);
    }

    #[test]
    fn test_cache_headers() {
        let policy = CachePolicy {
            enabled: true,
            max_age: Duration::from_secs(3600),
            vary: true,
        };
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let headers = policy.headers("localhost/demo/image/upload/a.jpg", now);

        assert_eq!(headers[CACHE_CONTROL], "public, max-age=3600");
        assert_eq!(
            headers[EXPIRES],
            httpdate::fmt_http_date(now + Duration::from_secs(3600)).as_str()
        );
        let etag = headers[ETAG].to_str().unwrap();
        assert!(etag.starts_with("W/\"") && etag.ends_with('"'));
        assert_eq!(headers[VARY], "Accept, User-Agent");

        let same = policy.headers("localhost/demo/image/upload/a.jpg", now);
        assert_eq!(same[ETAG], headers[ETAG]);
    }

    #[test]
    fn test_cache_headers_disabled() {
        let policy = CachePolicy {
            enabled: false,
            max_age: Duration::from_secs(3600),
            vary: true,
        };
        assert!(policy.headers("x", SystemTime::now()).is_empty());
    }

    #[test]
    fn test_far_future_expires_is_clamped() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        for max_age in [400_000_000_000, u64::MAX] {
            let policy = CachePolicy {
                enabled: true,
                max_age: Duration::from_secs(max_age),
                vary: false,
            };
            let headers = policy.headers("localhost/demo/image/upload/a.jpg", now);
            assert_eq!(headers[EXPIRES], "Fri, 31 Dec 9999 23:59:59 GMT");
        }
    }
}
