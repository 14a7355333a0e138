//! Store metrics for monitoring read and write performance.
//!
//! Atomic counters and a bucketed latency histogram, shared by every clone of
//! a [`StoreMetrics`] handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use ts_rs::TS;

use crate::retry::is_retryable_error;

#[derive(Clone, Default)]
pub struct StoreMetrics {
    inner: Arc<StoreMetricsInner>,
}

#[derive(Default)]
struct StoreMetricsInner {
    // Query timing
    queries_total: AtomicU64,
    queries_slow: AtomicU64, // > slow_query_threshold
    query_duration_sum_us: AtomicU64,

    // Row traffic
    rows_read: AtomicU64,
    rows_written: AtomicU64,
    rows_deleted: AtomicU64,
    batches_written: AtomicU64,

    // Error tracking
    busy_errors: AtomicU64,
    other_errors: AtomicU64,

    // Buckets: <1ms, <5ms, <10ms, <50ms, <100ms, <500ms, <1s, >=1s
    latency_bucket_1ms: AtomicU64,
    latency_bucket_5ms: AtomicU64,
    latency_bucket_10ms: AtomicU64,
    latency_bucket_50ms: AtomicU64,
    latency_bucket_100ms: AtomicU64,
    latency_bucket_500ms: AtomicU64,
    latency_bucket_1s: AtomicU64,
    latency_bucket_inf: AtomicU64,
}

/// Threshold in milliseconds for considering a query "slow".
///
/// Batch writes are large, so the default is higher than for OLTP queries.
fn slow_query_threshold_ms() -> u64 {
    std::env::var("MIGRATE_SLOW_QUERY_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(500)
}

impl StoreMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a query execution with its duration.
    pub fn record_query(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        let ms = duration.as_millis() as u64;

        self.inner.queries_total.fetch_add(1, Ordering::Relaxed);
        self.inner
            .query_duration_sum_us
            .fetch_add(us, Ordering::Relaxed);

        if ms > slow_query_threshold_ms() {
            self.inner.queries_slow.fetch_add(1, Ordering::Relaxed);
        }

        self.record_latency_bucket(ms);
    }

    fn record_latency_bucket(&self, ms: u64) {
        let bucket = if ms < 1 {
            &self.inner.latency_bucket_1ms
        } else if ms < 5 {
            &self.inner.latency_bucket_5ms
        } else if ms < 10 {
            &self.inner.latency_bucket_10ms
        } else if ms < 50 {
            &self.inner.latency_bucket_50ms
        } else if ms < 100 {
            &self.inner.latency_bucket_100ms
        } else if ms < 500 {
            &self.inner.latency_bucket_500ms
        } else if ms < 1000 {
            &self.inner.latency_bucket_1s
        } else {
            &self.inner.latency_bucket_inf
        };
        bucket.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rows_read(&self, rows: u64) {
        self.inner.rows_read.fetch_add(rows, Ordering::Relaxed);
    }

    /// Record a committed batch write.
    pub fn record_batch_written(&self, rows: u64) {
        self.inner.rows_written.fetch_add(rows, Ordering::Relaxed);
        self.inner.batches_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rows_deleted(&self, rows: u64) {
        self.inner.rows_deleted.fetch_add(rows, Ordering::Relaxed);
    }

    /// Classify and count a failed statement.
    pub fn record_error(&self, error: &sqlx::Error) {
        if is_retryable_error(error) {
            self.inner.busy_errors.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.other_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get current pool statistics from SQLx.
    pub fn get_pool_stats(&self, pool: &SqlitePool) -> PoolStats {
        PoolStats {
            size: pool.size(),
            idle: pool.num_idle() as u32,
            acquired: pool.size().saturating_sub(pool.num_idle() as u32),
            max: pool.options().get_max_connections(),
        }
    }

    pub fn snapshot(&self) -> StoreMetricsSnapshot {
        let total_queries = self.inner.queries_total.load(Ordering::Relaxed);
        let total_duration_us = self.inner.query_duration_sum_us.load(Ordering::Relaxed);

        StoreMetricsSnapshot {
            queries_total: total_queries,
            queries_slow: self.inner.queries_slow.load(Ordering::Relaxed),
            query_avg_duration_ms: if total_queries > 0 {
                (total_duration_us as f64 / total_queries as f64) / 1000.0
            } else {
                0.0
            },
            rows_read: self.inner.rows_read.load(Ordering::Relaxed),
            rows_written: self.inner.rows_written.load(Ordering::Relaxed),
            rows_deleted: self.inner.rows_deleted.load(Ordering::Relaxed),
            batches_written: self.inner.batches_written.load(Ordering::Relaxed),
            busy_errors: self.inner.busy_errors.load(Ordering::Relaxed),
            other_errors: self.inner.other_errors.load(Ordering::Relaxed),
            latency_p50_ms: self.estimate_percentile(50),
            latency_p95_ms: self.estimate_percentile(95),
            latency_p99_ms: self.estimate_percentile(99),
        }
    }

    /// Estimate a percentile from the histogram buckets.
    fn estimate_percentile(&self, percentile: u64) -> u64 {
        let buckets = [
            (1, self.inner.latency_bucket_1ms.load(Ordering::Relaxed)),
            (5, self.inner.latency_bucket_5ms.load(Ordering::Relaxed)),
            (10, self.inner.latency_bucket_10ms.load(Ordering::Relaxed)),
            (50, self.inner.latency_bucket_50ms.load(Ordering::Relaxed)),
            (100, self.inner.latency_bucket_100ms.load(Ordering::Relaxed)),
            (500, self.inner.latency_bucket_500ms.load(Ordering::Relaxed)),
            (1000, self.inner.latency_bucket_1s.load(Ordering::Relaxed)),
            (5000, self.inner.latency_bucket_inf.load(Ordering::Relaxed)), // Assume 5s for overflow
        ];

        let total: u64 = buckets.iter().map(|(_, count)| count).sum();
        if total == 0 {
            return 0;
        }

        let target = (total * percentile) / 100;
        let mut cumulative = 0u64;

        for (upper_bound, count) in buckets {
            cumulative += count;
            if cumulative >= target {
                return upper_bound;
            }
        }

        buckets.last().map(|(b, _)| *b).unwrap_or(0)
    }
}

/// Connection pool statistics.
#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
pub struct PoolStats {
    /// Open connections.
    pub size: u32,
    /// Idle connections available.
    pub idle: u32,
    /// Currently acquired connections.
    pub acquired: u32,
    /// Configured pool ceiling.
    pub max: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct StoreMetricsSnapshot {
    pub queries_total: u64,
    pub queries_slow: u64,
    pub query_avg_duration_ms: f64,
    pub rows_read: u64,
    pub rows_written: u64,
    pub rows_deleted: u64,
    pub batches_written: u64,
    /// SQLITE_BUSY / LOCKED / IOERR errors.
    pub busy_errors: u64,
    pub other_errors: u64,
    pub latency_p50_ms: u64,
    pub latency_p95_ms: u64,
    pub latency_p99_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let snapshot = StoreMetrics::new().snapshot();
        assert_eq!(snapshot.queries_total, 0);
        assert_eq!(snapshot.rows_written, 0);
        assert_eq!(snapshot.latency_p50_ms, 0);
    }

    #[test]
    fn test_record_slow_query() {
        let metrics = StoreMetrics::new();

        metrics.record_query(Duration::from_millis(50));
        metrics.record_query(Duration::from_millis(600)); // Slow
        metrics.record_query(Duration::from_millis(2000)); // Slow

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.queries_total, 3);
        assert_eq!(snapshot.queries_slow, 2);
    }

    #[test]
    fn test_row_counters_are_shared_between_clones() {
        let metrics = StoreMetrics::new();
        let clone = metrics.clone();

        metrics.record_rows_read(1000);
        clone.record_batch_written(400);
        clone.record_batch_written(600);
        metrics.record_rows_deleted(25);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.rows_read, 1000);
        assert_eq!(snapshot.rows_written, 1000);
        assert_eq!(snapshot.batches_written, 2);
        assert_eq!(snapshot.rows_deleted, 25);
    }

    #[test]
    fn test_record_error_classification() {
        let metrics = StoreMetrics::new();
        metrics.record_error(&sqlx::Error::RowNotFound);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.busy_errors, 0);
        assert_eq!(snapshot.other_errors, 1);
    }

    #[test]
    fn test_latency_percentile_estimate() {
        let metrics = StoreMetrics::new();

        for _ in 0..100 {
            metrics.record_query(Duration::from_millis(8));
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.latency_p50_ms, 10);
        assert_eq!(snapshot.latency_p99_ms, 10);
    }
}
