//! Integration tests for the eviction sweeper

use image_edge_cache::config::EvictionConfig;
use image_edge_cache::{EdgeMetrics, EvictionSweeper};
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

fn write_aged(path: &Path, age: Duration) {
    fs::write(path, b"cached").unwrap();
    let file = File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - age).unwrap();
}

fn eviction_config(max_age_secs: u64) -> EvictionConfig {
    EvictionConfig {
        enabled: true,
        interval_secs: 1,
        max_age_secs,
        concurrency: 2,
    }
}

#[tokio::test]
async fn test_sweep_evicts_only_old_files() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path();
    fs::create_dir_all(base.join("upload/nested")).unwrap();
    fs::create_dir_all(base.join("avatars")).unwrap();

    let two_hours = Duration::from_secs(7200);
    write_aged(&base.join("upload/old.jpg"), two_hours);
    write_aged(&base.join("upload/fresh.jpg"), Duration::from_secs(10));
    write_aged(&base.join("avatars/old.png"), two_hours);
    // Outside the storage-directory layout: never touched
    write_aged(&base.join("top-level.jpg"), two_hours);
    write_aged(&base.join("upload/nested/deep.jpg"), two_hours);

    let metrics = Arc::new(EdgeMetrics::new());
    let sweeper = EvictionSweeper::new(base, &eviction_config(3600)).with_metrics(Arc::clone(&metrics));
    let report = sweeper.sweep_once().await;

    assert_eq!(report.directories, 2);
    assert_eq!(report.scanned, 3);
    assert_eq!(report.evicted, 2);
    assert_eq!(report.failed, 0);
    assert!(!report.skipped);

    assert!(!base.join("upload/old.jpg").exists());
    assert!(!base.join("avatars/old.png").exists());
    assert!(base.join("upload/fresh.jpg").exists());
    assert!(base.join("top-level.jpg").exists());
    assert!(base.join("upload/nested/deep.jpg").exists());

    let stats = metrics.get_stats();
    assert_eq!(stats.sweeps, 1);
    assert_eq!(stats.evicted_files, 2);
}

#[tokio::test]
async fn test_second_sweep_finds_nothing() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("upload")).unwrap();
    write_aged(&dir.path().join("upload/a.jpg"), Duration::from_secs(7200));

    let sweeper = EvictionSweeper::new(dir.path(), &eviction_config(3600));
    assert_eq!(sweeper.sweep_once().await.evicted, 1);

    let again = sweeper.sweep_once().await;
    assert_eq!(again.scanned, 0);
    assert_eq!(again.evicted, 0);
}

#[tokio::test]
async fn test_many_files_with_bounded_concurrency() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("upload")).unwrap();
    for i in 0..20 {
        let age = if i % 2 == 0 { 7200 } else { 60 };
        write_aged(
            &dir.path().join(format!("upload/{}.jpg", i)),
            Duration::from_secs(age),
        );
    }

    let sweeper = EvictionSweeper::new(dir.path(), &eviction_config(3600));
    let report = sweeper.sweep_once().await;
    assert_eq!(report.scanned, 20);
    assert_eq!(report.evicted, 10);
}

#[tokio::test]
async fn test_periodic_run_and_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("upload")).unwrap();
    let old = dir.path().join("upload/old.jpg");
    write_aged(&old, Duration::from_secs(7200));

    let metrics = Arc::new(EdgeMetrics::new());
    let sweeper = Arc::new(
        EvictionSweeper::new(dir.path(), &eviction_config(3600)).with_metrics(Arc::clone(&metrics)),
    );
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = sweeper.start(shutdown_rx);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!old.exists());
    assert!(metrics.get_stats().sweeps >= 1);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("sweeper should stop after shutdown")
        .unwrap();
}
