//! Cache validity decision
//!
//! For remote targets the validator probes the origin (HEAD) and the local
//! cache file (stat) concurrently and waits for both before deciding. The
//! only validity signal is size equality: a remote change that keeps the
//! same Content-Length is not detected.

use crate::error::EdgeError;
use crate::metadata_fetcher::MetadataFetcher;
use crate::models::{CacheKey, LocalEntry, RemoteDescriptor, RemoteMetadata};
use crate::request::DecodedRequest;
use std::io::ErrorKind;
use tokio::fs;
use tracing::{debug, warn};

/// Outcome of validating a decoded request against the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// The cached file can be served as-is
    Hit { key: CacheKey, local: LocalEntry },
    /// No cached file; fetch from origin
    Miss {
        key: CacheKey,
        remote: RemoteDescriptor,
        metadata: RemoteMetadata,
    },
    /// A cached file exists but the origin reports a different size
    Stale {
        key: CacheKey,
        remote: RemoteDescriptor,
        metadata: RemoteMetadata,
        local: LocalEntry,
    },
    /// The origin could not be probed; nothing is fetched or touched
    RemoteMissing(EdgeError),
    /// Local target (or unusable path) with no cache file
    LocalMissing,
}

impl Validation {
    pub fn label(&self) -> &'static str {
        match self {
            Validation::Hit { .. } => "HIT",
            Validation::Miss { .. } => "MISS",
            Validation::Stale { .. } => "STALE",
            Validation::RemoteMissing(_) => "REMOTE_MISSING",
            Validation::LocalMissing => "LOCAL_MISSING",
        }
    }

    pub fn needs_fetch(&self) -> bool {
        matches!(self, Validation::Miss { .. } | Validation::Stale { .. })
    }
}

/// Decides HIT / MISS / STALE for decoded requests
#[derive(Clone)]
pub struct CacheValidator {
    probe: MetadataFetcher,
}

impl CacheValidator {
    pub fn new(probe: MetadataFetcher) -> Self {
        CacheValidator { probe }
    }

    pub async fn validate(&self, request: &DecodedRequest) -> Validation {
        let Some(key) = request.cache_key.clone() else {
            debug!("No cache key for request, treating as local miss");
            return Validation::LocalMissing;
        };

        match request.remote() {
            Some(remote) => self.validate_remote(key, remote.clone()).await,
            None => match stat_local(&key).await {
                Some(local) => Validation::Hit { key, local },
                None => Validation::LocalMissing,
            },
        }
    }

    async fn validate_remote(&self, key: CacheKey, remote: RemoteDescriptor) -> Validation {
        let (probe, local) = tokio::join!(
            self.probe.fetch_metadata(remote.url()),
            stat_local(&key)
        );

        let metadata = match probe {
            Ok(metadata) => metadata,
            Err(e) => return Validation::RemoteMissing(e),
        };

        match local {
            Some(local) if metadata.matches(&local) => Validation::Hit { key, local },
            Some(local) => Validation::Stale {
                key,
                remote,
                metadata,
                local,
            },
            None => Validation::Miss {
                key,
                remote,
                metadata,
            },
        }
    }
}

/// Stat a cache file; absence and unreadable metadata both read as "absent"
pub async fn stat_local(key: &CacheKey) -> Option<LocalEntry> {
    match fs::metadata(key.path()).await {
        Ok(meta) if meta.is_file() => Some(LocalEntry {
            size: meta.len(),
            modified: meta.modified().ok(),
        }),
        Ok(_) => None,
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => {
            warn!("Failed to stat cache file {:?}: {}", key.path(), e);
            None
        }
    }
}
