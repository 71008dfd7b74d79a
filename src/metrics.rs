//! Metrics collection for the edge cache
//!
//! Thread-safe counters built on atomics. They track request outcomes, cache
//! validity decisions, transfer volume and eviction activity.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Metrics collector shared by the request pipeline and the sweeper
///
/// All operations are thread-safe using atomic operations.
#[derive(Debug, Default)]
pub struct EdgeMetrics {
    // Request statistics
    total_requests: AtomicU64,
    rejected_methods: AtomicU64,

    // Cache validity outcomes
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_stale: AtomicU64,
    coalesced_hits: AtomicU64,
    remote_missing: AtomicU64,
    local_missing: AtomicU64,

    // Pipeline failures and conversions
    fetch_errors: AtomicU64,
    transform_errors: AtomicU64,
    negotiated_conversions: AtomicU64,

    // Byte statistics
    bytes_from_origin: AtomicU64,
    bytes_from_cache: AtomicU64,
    bytes_to_client: AtomicU64,

    // Latency (microseconds)
    total_request_duration_us: AtomicU64,

    // Eviction
    sweeps: AtomicU64,
    evicted_files: AtomicU64,
    eviction_failures: AtomicU64,
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub rejected_methods: u64,

    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_stale: u64,
    pub coalesced_hits: u64,
    pub remote_missing: u64,
    pub local_missing: u64,

    pub fetch_errors: u64,
    pub transform_errors: u64,
    pub negotiated_conversions: u64,

    pub bytes_from_origin: u64,
    pub bytes_from_cache: u64,
    pub bytes_to_client: u64,

    pub total_request_duration_us: u64,

    pub sweeps: u64,
    pub evicted_files: u64,
    pub eviction_failures: u64,
}

impl EdgeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a GET request entering the pipeline
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request refused by the method gate
    pub fn record_rejected_method(&self) {
        self.rejected_methods.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_stale(&self) {
        self.cache_stale.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a miss served from a file stored by a concurrent request
    pub fn record_coalesced_hit(&self) {
        self.coalesced_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remote_missing(&self) {
        self.remote_missing.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_local_missing(&self) {
        self.local_missing.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_error(&self) {
        self.fetch_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transform_error(&self) {
        self.transform_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a payload re-encoded for a capable client
    pub fn record_conversion(&self) {
        self.negotiated_conversions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_from_origin(&self, bytes: u64) {
        self.bytes_from_origin.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_bytes_from_cache(&self, bytes: u64) {
        self.bytes_from_cache.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_bytes_to_client(&self, bytes: u64) {
        self.bytes_to_client.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_request_duration(&self, duration: Duration) {
        self.total_request_duration_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record the totals of one completed sweep cycle
    pub fn record_sweep(&self, evicted: u64, failed: u64) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        self.evicted_files.fetch_add(evicted, Ordering::Relaxed);
        self.eviction_failures.fetch_add(failed, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    ///
    /// Fields are loaded one at a time, so a snapshot taken under load may
    /// not be perfectly consistent across fields.
    pub fn get_stats(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            rejected_methods: self.rejected_methods.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_stale: self.cache_stale.load(Ordering::Relaxed),
            coalesced_hits: self.coalesced_hits.load(Ordering::Relaxed),
            remote_missing: self.remote_missing.load(Ordering::Relaxed),
            local_missing: self.local_missing.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            transform_errors: self.transform_errors.load(Ordering::Relaxed),
            negotiated_conversions: self.negotiated_conversions.load(Ordering::Relaxed),
            bytes_from_origin: self.bytes_from_origin.load(Ordering::Relaxed),
            bytes_from_cache: self.bytes_from_cache.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
            total_request_duration_us: self.total_request_duration_us.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
            evicted_files: self.evicted_files.load(Ordering::Relaxed),
            eviction_failures: self.eviction_failures.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics to zero
    pub fn reset(&self) {
        for counter in [
            &self.total_requests,
            &self.rejected_methods,
            &self.cache_hits,
            &self.cache_misses,
            &self.cache_stale,
            &self.coalesced_hits,
            &self.remote_missing,
            &self.local_missing,
            &self.fetch_errors,
            &self.transform_errors,
            &self.negotiated_conversions,
            &self.bytes_from_origin,
            &self.bytes_from_cache,
            &self.bytes_to_client,
            &self.total_request_duration_us,
            &self.sweeps,
            &self.evicted_files,
            &self.eviction_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl MetricsSnapshot {
    /// Share of validated requests served from cache, as a percentage
    ///
    /// Stale entries count as misses; coalesced hits count as hits.
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits + self.coalesced_hits;
        let total = hits + self.cache_misses + self.cache_stale;
        if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64) * 100.0
        }
    }

    /// Calculate average request duration in milliseconds
    pub fn avg_request_duration_ms(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.total_request_duration_us as f64 / self.total_requests as f64) / 1000.0
        }
    }
}
