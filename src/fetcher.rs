//! Fetch-through download and store
//!
//! The origin body is streamed once: every chunk goes both to a temporary
//! file next to the cache entry and to an in-memory buffer that is handed to
//! the rest of the pipeline. The temporary file is renamed onto the cache
//! path only after the body completed, so readers never observe a partial
//! entry and a failed download leaves the previous entry untouched.

use crate::error::{EdgeError, Result};
use crate::models::{CacheKey, RemoteDescriptor};
use bytes::{Bytes, BytesMut};
use reqwest::{Client, Response, StatusCode};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

/// Upper bound on the buffer preallocated from Content-Length
const MAX_PREALLOC_BYTES: usize = 16 * 1024 * 1024;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Downloads remote images into the cache
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    pub fn new(client: Client) -> Self {
        Fetcher { client }
    }

    /// Download `remote` into the file for `key` and return the bytes
    ///
    /// # Errors
    /// * `RemoteUnavailable` - the request or the body stream failed
    /// * `RemoteStatus` - the origin answered with anything but 200; no file
    ///   is created
    /// * `LocalIo` - the cache file could not be written; the partial file is
    ///   removed
    pub async fn fetch(&self, remote: &RemoteDescriptor, key: &CacheKey) -> Result<Bytes> {
        let url = remote.url();
        debug!("Fetching url={} into {:?}", url, key.path());

        let mut response = self.client.get(url).send().await.map_err(|e| {
            warn!("GET request failed for url={}: {}", url, e);
            EdgeError::RemoteUnavailable(format!("GET request failed: {}", e))
        })?;

        let status = response.status();
        if status != StatusCode::OK {
            warn!("Origin returned status={} for url={}", status, url);
            return Err(EdgeError::RemoteStatus {
                status: status.as_u16(),
            });
        }

        fs::create_dir_all(key.dir()).await.map_err(|e| {
            EdgeError::LocalIo(format!("Failed to create {:?}: {}", key.dir(), e))
        })?;

        let partial = PartialFile::new(temp_path_for(key));
        let mut file = File::create(partial.path()).await.map_err(|e| {
            EdgeError::LocalIo(format!("Failed to create {:?}: {}", partial.path(), e))
        })?;

        let capacity = response
            .content_length()
            .map(|len| (len as usize).min(MAX_PREALLOC_BYTES))
            .unwrap_or(0);
        let mut buffer = BytesMut::with_capacity(capacity);

        stream_body(&mut response, &mut file, &mut buffer).await?;
        drop(file);

        partial.persist(key.path()).await?;

        info!(
            "Stored url={} at {:?} ({} bytes)",
            url,
            key.path(),
            buffer.len()
        );

        Ok(buffer.freeze())
    }
}

async fn stream_body(response: &mut Response, file: &mut File, buffer: &mut BytesMut) -> Result<()> {
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                file.write_all(&chunk)
                    .await
                    .map_err(|e| EdgeError::LocalIo(format!("Failed to write cache file: {}", e)))?;
                buffer.extend_from_slice(&chunk);
            }
            Ok(None) => break,
            Err(e) => {
                return Err(EdgeError::RemoteUnavailable(format!(
                    "Body stream failed: {}",
                    e
                )))
            }
        }
    }

    file.flush()
        .await
        .map_err(|e| EdgeError::LocalIo(format!("Failed to flush cache file: {}", e)))
}

/// Temporary download file, removed on drop unless persisted
///
/// Dropping the fetch future mid-stream (client gone, connection timeout)
/// still cleans up.
struct PartialFile {
    path: PathBuf,
    persisted: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        PartialFile {
            path,
            persisted: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically move the completed download onto `target`
    async fn persist(mut self, target: &Path) -> Result<()> {
        fs::rename(&self.path, target)
            .await
            .map_err(|e| EdgeError::LocalIo(format!("Failed to store {:?}: {}", target, e)))?;
        self.persisted = true;
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed partial download {:?}", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove partial download {:?}: {}", self.path, e),
        }
    }
}

fn temp_path_for(key: &CacheKey) -> PathBuf {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    key.dir()
        .join(format!(".{}.{}.{}.part", key.filename(), std::process::id(), n))
}

/// Per-key locks for downloads in progress
///
/// A request that needs to fetch takes the lock for its cache key first, so
/// concurrent misses for the same key run one at a time. Entries are removed
/// once nobody holds or waits for them.
#[derive(Clone, Default)]
pub struct InflightRegistry {
    locks: Arc<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>,
}

/// Held while a request owns the download slot for a key
pub struct InflightGuard {
    registry: InflightRegistry,
    key: PathBuf,
    guard: Option<OwnedMutexGuard<()>>,
    waited: bool,
}

impl InflightGuard {
    /// Whether another request held the key when this one arrived
    pub fn waited(&self) -> bool {
        self.waited
    }
}

impl InflightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn acquire(&self, key: &CacheKey) -> InflightGuard {
        let path = key.path().to_path_buf();
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(path.clone()).or_default())
        };

        let (guard, waited) = match Arc::clone(&lock).try_lock_owned() {
            Ok(guard) => (guard, false),
            Err(_) => {
                debug!("Waiting for in-flight fetch of {:?}", path);
                (lock.lock_owned().await, true)
            }
        };

        InflightGuard {
            registry: self.clone(),
            key: path,
            guard: Some(guard),
            waited,
        }
    }

    /// Number of keys currently held or awaited
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.guard.take();

        let mut locks = self
            .registry
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(lock) = locks.get(&self.key) {
            // Only the map itself still references the lock
            if Arc::strong_count(lock) == 1 {
                locks.remove(&self.key);
            }
        }
    }
}
