//! Request path decoding
//!
//! Request paths have the shape
//!
//! ```text
//! /<app>/<kind>/<storage-sub-path>/[<transform-options>/]<target-identifier>
//! ```
//!
//! Decoding never fails. Anything that cannot be understood degrades to a
//! local target with transforms disabled, and a path that cannot be mapped
//! to a cache file simply carries no [`CacheKey`].

use crate::models::{CacheKey, RemoteDescriptor, TransformOptions};
use percent_encoding::percent_decode_str;
use std::path::{Path, PathBuf};
use tracing::debug;
use url::Url;

/// Prepended to identifiers that do not start with a scheme, so that
/// `%2F%2Fhost%2Fa.jpg` decodes to `http://host/a.jpg`
pub const SCHEME_MARKER: &str = "http%3A";

const DECODED_SCHEME_MARKER: &str = "http:";

/// Paths with more segments than this carry a transform-options segment
const OPTIONS_SEGMENT_THRESHOLD: usize = 4;

/// Filename used for remote URLs whose path ends in `/`
const DEFAULT_REMOTE_FILENAME: &str = "index";

/// Outcome of percent-decoding the target identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    /// Percent-decoding produced valid UTF-8
    Decoded(String),
    /// Decoding failed; the raw (scheme-prefixed) value is kept as-is
    Raw(String),
}

impl Identifier {
    pub fn as_str(&self) -> &str {
        match self {
            Identifier::Decoded(s) | Identifier::Raw(s) => s,
        }
    }

    pub fn is_decoded(&self) -> bool {
        matches!(self, Identifier::Decoded(_))
    }
}

/// What the request asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Fetch-through from an origin server
    Remote(RemoteDescriptor),
    /// Served from the cache only
    Local { filename: String },
}

/// A fully decoded request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRequest {
    pub app: String,
    pub kind: String,
    pub storage: Option<String>,
    pub options: Option<TransformOptions>,
    pub identifier: Identifier,
    pub target: Target,
    pub cache_key: Option<CacheKey>,
    pub segment_count: usize,
}

impl DecodedRequest {
    pub fn remote(&self) -> Option<&RemoteDescriptor> {
        match &self.target {
            Target::Remote(remote) => Some(remote),
            Target::Local { .. } => None,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.remote().is_some()
    }

    pub fn transform_enabled(&self) -> bool {
        self.options.is_some()
    }
}

/// Turns raw request paths into [`DecodedRequest`]s rooted at a base directory
#[derive(Debug, Clone)]
pub struct RequestDecoder {
    base: PathBuf,
}

impl RequestDecoder {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        RequestDecoder { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Decode a request path (without query string)
    pub fn decode(&self, path: &str) -> DecodedRequest {
        let trimmed = path.trim_matches('/');
        let segments: Vec<&str> = if trimmed.is_empty() {
            Vec::new()
        } else {
            trimmed.split('/').collect()
        };
        let segment_count = segments.len();

        let raw = segments.last().copied().unwrap_or("");
        let marked = !raw.to_ascii_lowercase().starts_with("http");
        let identifier = decode_identifier(raw, marked);

        let target = match parse_remote(identifier.as_str()) {
            Some(remote) => Target::Remote(remote),
            None => Target::Local {
                filename: local_filename(&identifier, marked),
            },
        };

        let options = if segment_count > OPTIONS_SEGMENT_THRESHOLD {
            Some(TransformOptions::new(segments[segment_count - 2]))
        } else {
            None
        };

        let storage = segments.get(2).map(|s| s.to_string());
        let filename = match &target {
            Target::Remote(remote) => remote_filename(remote),
            Target::Local { filename } => filename.clone(),
        };
        let cache_key = storage
            .as_deref()
            .and_then(|storage| CacheKey::new(&self.base, storage, &filename));

        let decoded = DecodedRequest {
            app: segments.first().map(|s| s.to_string()).unwrap_or_default(),
            kind: segments.get(1).map(|s| s.to_string()).unwrap_or_default(),
            storage,
            options,
            identifier,
            target,
            cache_key,
            segment_count,
        };

        debug!(
            "Decoded path={} segments={} remote={} transform={} key={:?}",
            path,
            segment_count,
            decoded.is_remote(),
            decoded.transform_enabled(),
            decoded.cache_key.as_ref().map(|k| k.path().to_path_buf())
        );

        decoded
    }
}

fn decode_identifier(raw: &str, marked: bool) -> Identifier {
    let prefixed = if marked {
        format!("{}{}", SCHEME_MARKER, raw)
    } else {
        raw.to_string()
    };

    match percent_decode_str(&prefixed).decode_utf8() {
        Ok(decoded) => Identifier::Decoded(decoded.into_owned()),
        Err(_) => Identifier::Raw(prefixed),
    }
}

fn parse_remote(identifier: &str) -> Option<RemoteDescriptor> {
    let lower = identifier.to_ascii_lowercase();
    if !lower.starts_with("http://") && !lower.starts_with("https://") {
        return None;
    }

    Url::parse(identifier).ok().and_then(RemoteDescriptor::from_url)
}

fn remote_filename(remote: &RemoteDescriptor) -> String {
    let basename = percent_decode_str(remote.basename())
        .decode_utf8_lossy()
        .into_owned();
    if basename.is_empty() {
        DEFAULT_REMOTE_FILENAME.to_string()
    } else {
        basename
    }
}

fn local_filename(identifier: &Identifier, marked: bool) -> String {
    let value = match (identifier, marked) {
        (Identifier::Decoded(s), true) => s.strip_prefix(DECODED_SCHEME_MARKER).unwrap_or(s),
        (Identifier::Raw(s), true) => s.strip_prefix(SCHEME_MARKER).unwrap_or(s),
        (id, false) => id.as_str(),
    };

    match value.rfind('/') {
        Some(idx) => value[idx + 1..].to_string(),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> RequestDecoder {
        RequestDecoder::new("/srv/files")
    }

    #[test]
    fn test_local_target_without_options() {
        let req = decoder().decode("/demo/image/upload/Desert.jpg");

        assert_eq!(req.app, "demo");
        assert_eq!(req.kind, "image");
        assert_eq!(req.storage.as_deref(), Some("upload"));
        assert_eq!(req.segment_count, 4);
        assert!(!req.transform_enabled());
        assert_eq!(
            req.target,
            Target::Local {
                filename: "Desert.jpg".to_string()
            }
        );
        assert_eq!(
            req.cache_key.unwrap().path(),
            Path::new("/srv/files/upload/Desert.jpg")
        );
    }

    #[test]
    fn test_remote_target_with_options() {
        let req = decoder().decode("/demo/image/upload/resize200/http%3A%2F%2Fex.com%2Fa.jpg");

        assert_eq!(req.segment_count, 5);
        assert_eq!(req.options, Some(TransformOptions::new("resize200")));
        let remote = req.remote().unwrap();
        assert_eq!(remote.url(), "http://ex.com/a.jpg");
        assert_eq!(remote.hostname, "ex.com");
        assert_eq!(
            req.cache_key.unwrap().path(),
            Path::new("/srv/files/upload/a.jpg")
        );
    }

    #[test]
    fn test_scheme_marker_added_for_bare_slashes() {
        let req = decoder().decode("/demo/image/upload/%2F%2Fex.com%2Fimg%2Fb.png");

        assert_eq!(req.remote().unwrap().url(), "http://ex.com/img/b.png");
        assert_eq!(req.cache_key.unwrap().filename(), "b.png");
    }

    #[test]
    fn test_https_identifier_kept() {
        let req = decoder().decode("/demo/image/upload/https%3A%2F%2Fex.com%2Fc.gif");
        assert_eq!(req.remote().unwrap().scheme, "https");
    }

    #[test]
    fn test_invalid_utf8_falls_back_to_raw() {
        let req = decoder().decode("/demo/image/upload/%FFbad.jpg");

        assert_eq!(req.identifier, Identifier::Raw("http%3A%FFbad.jpg".to_string()));
        assert_eq!(
            req.target,
            Target::Local {
                filename: "%FFbad.jpg".to_string()
            }
        );
    }

    #[test]
    fn test_short_path_has_no_cache_key() {
        let req = decoder().decode("/demo/image");
        assert!(req.cache_key.is_none());
        assert!(!req.is_remote());
        assert!(!req.transform_enabled());

        let req = decoder().decode("/");
        assert_eq!(req.segment_count, 0);
        assert!(req.cache_key.is_none());
    }

    #[test]
    fn test_traversal_has_no_cache_key() {
        let req = decoder().decode("/demo/image/../passwd");
        assert!(req.cache_key.is_none());

        let req = decoder().decode("/demo/image/upload/..");
        assert!(req.cache_key.is_none());
    }

    #[test]
    fn test_remote_without_basename_uses_index() {
        let req = decoder().decode("/demo/image/upload/http%3A%2F%2Fex.com%2F");
        assert_eq!(req.cache_key.unwrap().filename(), DEFAULT_REMOTE_FILENAME);
    }

    #[test]
    fn test_remote_query_not_part_of_filename() {
        let req = decoder().decode("/demo/image/upload/http%3A%2F%2Fex.com%2Fa.jpg%3Fv%3D2");
        assert_eq!(req.remote().unwrap().path, "/a.jpg?v=2");
        assert_eq!(req.cache_key.unwrap().filename(), "a.jpg");
    }
}
