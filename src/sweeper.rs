//! Time-based eviction of cached files
//!
//! The sweeper walks every storage directory directly under the base path
//! and deletes files whose modification time is older than the configured
//! max age. It shares nothing with request handling except the filesystem.

use crate::config::EvictionConfig;
use crate::metrics::EdgeMetrics;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::fs;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Totals for one sweep cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Storage directories visited
    pub directories: usize,
    /// Regular files examined
    pub scanned: usize,
    pub evicted: usize,
    /// Files that could not be examined or deleted
    pub failed: usize,
    /// The cycle did not run because another one was in progress
    pub skipped: bool,
}

impl SweepReport {
    fn merge(&mut self, other: SweepReport) {
        self.directories += other.directories;
        self.scanned += other.scanned;
        self.evicted += other.evicted;
        self.failed += other.failed;
    }
}

enum FileOutcome {
    Kept,
    Evicted,
    Failed,
}

/// Background TTL eviction over the cache directory tree
pub struct EvictionSweeper {
    base: PathBuf,
    interval: Duration,
    max_age: Duration,
    concurrency: usize,
    scanning: AtomicBool,
    metrics: Option<Arc<EdgeMetrics>>,
}

/// Clears the scanning flag when a cycle ends, including on panic
struct ScanGuard<'a>(&'a AtomicBool);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl EvictionSweeper {
    pub fn new(base: impl Into<PathBuf>, config: &EvictionConfig) -> Self {
        EvictionSweeper {
            base: base.into(),
            interval: Duration::from_secs(config.interval_secs),
            max_age: Duration::from_secs(config.max_age_secs),
            concurrency: config.concurrency.max(1),
            scanning: AtomicBool::new(false),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<EdgeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Whether a cycle is currently running
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::Acquire)
    }

    /// Spawn the periodic sweep loop
    pub fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Sweep every interval until `shutdown` flips to true
    ///
    /// The first sweep happens one interval after start. A cycle that runs
    /// past the next tick delays it instead of queueing extra cycles.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval.tick().await;

        info!(
            "Eviction sweeper started: base={:?} interval={:?} max_age={:?}",
            self.base, self.interval, self.max_age
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Eviction sweeper stopped");
                        return;
                    }
                }
            }
        }
    }

    /// Run one sweep cycle
    ///
    /// Returns a report with `skipped` set when another cycle is running.
    pub async fn sweep_once(&self) -> SweepReport {
        if self.scanning.swap(true, Ordering::AcqRel) {
            debug!("Sweep already in progress, skipping");
            return SweepReport {
                skipped: true,
                ..SweepReport::default()
            };
        }
        let _guard = ScanGuard(&self.scanning);

        let start = Instant::now();
        let now = SystemTime::now();
        let mut report = SweepReport::default();

        let mut entries = match fs::read_dir(&self.base).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Cache base {:?} does not exist yet", self.base);
                return report;
            }
            Err(e) => {
                error!("Failed to list cache base {:?}: {}", self.base, e);
                return report;
            }
        };

        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => match entry.file_type().await {
                    Ok(file_type) if file_type.is_dir() => {
                        let dir_report = self.sweep_directory(&entry.path(), now).await;
                        report.merge(dir_report);
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Failed to inspect {:?}: {}", entry.path(), e),
                },
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read cache base {:?}: {}", self.base, e);
                    break;
                }
            }
        }

        info!(
            "Sweep completed: directories={} scanned={} evicted={} failed={} elapsed={:?}",
            report.directories,
            report.scanned,
            report.evicted,
            report.failed,
            start.elapsed()
        );

        if let Some(metrics) = &self.metrics {
            metrics.record_sweep(report.evicted as u64, report.failed as u64);
        }

        report
    }

    async fn sweep_directory(&self, dir: &Path, now: SystemTime) -> SweepReport {
        let mut report = SweepReport {
            directories: 1,
            ..SweepReport::default()
        };

        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to list {:?}: {}", dir, e);
                return report;
            }
        };

        // At most `concurrency` files are in flight; the listing is consumed
        // as slots free up
        let mut tasks = JoinSet::new();
        loop {
            let path = match entries.next_entry().await {
                Ok(Some(entry)) => match entry.file_type().await {
                    Ok(file_type) if file_type.is_file() => entry.path(),
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Failed to inspect {:?}: {}", entry.path(), e);
                        report.failed += 1;
                        continue;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read {:?}: {}", dir, e);
                    break;
                }
            };

            if tasks.len() >= self.concurrency {
                if let Some(result) = tasks.join_next().await {
                    report.tally(result);
                }
            }

            let max_age = self.max_age;
            tasks.spawn(async move { evict_if_expired(&path, max_age, now).await });
        }

        while let Some(result) = tasks.join_next().await {
            report.tally(result);
        }

        report
    }
}

impl SweepReport {
    fn tally(&mut self, result: std::result::Result<FileOutcome, JoinError>) {
        self.scanned += 1;
        match result {
            Ok(FileOutcome::Kept) => {}
            Ok(FileOutcome::Evicted) => self.evicted += 1,
            Ok(FileOutcome::Failed) => self.failed += 1,
            Err(e) => {
                warn!("Eviction task failed: {}", e);
                self.failed += 1;
            }
        }
    }
}

async fn evict_if_expired(path: &Path, max_age: Duration, now: SystemTime) -> FileOutcome {
    let modified = match fs::metadata(path).await.and_then(|meta| meta.modified()) {
        Ok(modified) => modified,
        Err(e) if e.kind() == ErrorKind::NotFound => return FileOutcome::Kept,
        Err(e) => {
            warn!("Failed to stat {:?}: {}", path, e);
            return FileOutcome::Failed;
        }
    };

    if !is_expired(modified, max_age, now) {
        return FileOutcome::Kept;
    }

    match fs::remove_file(path).await {
        Ok(()) => {
            debug!("Evicted {:?}", path);
            FileOutcome::Evicted
        }
        // Already gone (refetch rename or a concurrent sweep elsewhere)
        Err(e) if e.kind() == ErrorKind::NotFound => FileOutcome::Kept,
        Err(e) => {
            warn!("Failed to evict {:?}: {}", path, e);
            FileOutcome::Failed
        }
    }
}

/// `modified + max_age <= now`
fn is_expired(modified: SystemTime, max_age: Duration, now: SystemTime) -> bool {
    modified
        .checked_add(max_age)
        .is_some_and(|deadline| deadline <= now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_expired_boundary() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(10_000);
        let max_age = Duration::from_secs(3600);

        assert!(is_expired(now - max_age, max_age, now));
        assert!(is_expired(now - Duration::from_secs(7200), max_age, now));
        assert!(!is_expired(now - Duration::from_secs(10), max_age, now));
    }

    #[tokio::test]
    async fn test_missing_base_is_empty_report() {
        let dir = tempfile::tempdir().unwrap();
        let sweeper = EvictionSweeper::new(dir.path().join("absent"), &EvictionConfig::default());
        let report = sweeper.sweep_once().await;
        assert_eq!(report, SweepReport::default());
        assert!(!sweeper.is_scanning());
    }

    #[tokio::test]
    async fn test_overlapping_sweep_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let sweeper = EvictionSweeper::new(dir.path(), &EvictionConfig::default());

        sweeper.scanning.store(true, Ordering::Release);
        let report = sweeper.sweep_once().await;
        assert!(report.skipped);

        sweeper.scanning.store(false, Ordering::Release);
        assert!(!sweeper.sweep_once().await.skipped);
    }

    #[tokio::test]
    async fn test_directory_larger_than_concurrency_is_drained() {
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path().join("upload");
        std::fs::create_dir_all(&storage).unwrap();
        let old = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        for i in 0..12 {
            let path = storage.join(format!("{}.jpg", i));
            std::fs::write(&path, b"x").unwrap();
            std::fs::File::options()
                .write(true)
                .open(&path)
                .unwrap()
                .set_modified(old)
                .unwrap();
        }

        let config = EvictionConfig {
            concurrency: 2,
            ..EvictionConfig::default()
        };
        let sweeper = EvictionSweeper::new(dir.path(), &config);
        let report = sweeper.sweep_directory(&storage, SystemTime::now()).await;

        assert_eq!(report.scanned, 12);
        assert_eq!(report.evicted, 12);
        assert_eq!(report.failed, 0);
        assert_eq!(std::fs::read_dir(&storage).unwrap().count(), 0);
    }
}
