//! Core data models for the image edge cache

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use url::Url;

/// Location of a cached file: `<base>/<storage>/<filename>`
///
/// Both components are single path segments, so distinct (storage, filename)
/// pairs always map to distinct files under the base directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    storage: String,
    filename: String,
    path: PathBuf,
}

impl CacheKey {
    /// Build a key under `base`
    ///
    /// Returns `None` when either component is not a plain file name
    /// (empty, `.`, `..`, or containing a path separator or NUL).
    pub fn new(base: &Path, storage: &str, filename: &str) -> Option<Self> {
        if !is_plain_segment(storage) || !is_plain_segment(filename) {
            return None;
        }

        Some(CacheKey {
            storage: storage.to_string(),
            filename: filename.to_string(),
            path: base.join(storage).join(filename),
        })
    }

    /// Storage sub-path namespace (one directory under the base)
    pub fn storage(&self) -> &str {
        &self.storage
    }

    /// File name inside the storage directory
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Full path of the cache file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the cache file
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or(&self.path)
    }
}

fn is_plain_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains(['/', '\\', '\0'])
}

/// Remote origin location parsed from a fully qualified target identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDescriptor {
    pub scheme: String,
    pub hostname: String,
    pub port: u16,
    /// Path including the query string, if any
    pub path: String,
    url: Url,
}

impl RemoteDescriptor {
    /// Build a descriptor from a parsed URL
    ///
    /// Returns `None` for non-HTTP schemes and for URLs without a host.
    pub fn from_url(url: Url) -> Option<Self> {
        if url.scheme() != "http" && url.scheme() != "https" {
            return None;
        }

        let hostname = url.host_str().filter(|h| !h.is_empty())?.to_string();
        let port = url.port_or_known_default()?;
        let path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        Some(RemoteDescriptor {
            scheme: url.scheme().to_string(),
            hostname,
            port,
            path,
            url,
        })
    }

    /// Full URL used for the HEAD probe and the fetch
    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    /// Last path segment of the remote resource
    pub fn basename(&self) -> &str {
        self.url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or("")
    }
}

/// Opaque transform parameters taken verbatim from the request path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformOptions {
    pub option: String,
}

impl TransformOptions {
    pub fn new(option: impl Into<String>) -> Self {
        TransformOptions {
            option: option.into(),
        }
    }
}

/// Filesystem metadata of a cached file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalEntry {
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// Result of a HEAD probe against the origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMetadata {
    pub status: u16,
    /// Content-Length, only reported for successful responses
    pub content_length: Option<u64>,
}

impl RemoteMetadata {
    /// Whether the origin's reported size matches a local entry
    pub fn matches(&self, local: &LocalEntry) -> bool {
        self.content_length == Some(local.size)
    }
}
