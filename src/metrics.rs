//! Engine metrics.
//!
//! Atomic counters maintained by the runtime, shared with the handle so
//! callers can observe progress while the loop runs.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters tracked by the stream runtime.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Total records pulled and handed to the processing stage.
    pub records_total: AtomicU64,
    /// Total non-empty batches processed.
    pub batches_total: AtomicU64,
    /// Total values emitted downstream.
    pub emitted_total: AtomicU64,
    /// Total records dropped by the transform.
    pub dropped_total: AtomicU64,
    /// Total records routed to the dead-letter sink.
    pub dead_letters_total: AtomicU64,
    /// Total successful offset commits.
    pub commits_total: AtomicU64,
    /// Total commit attempts that exhausted their retries.
    pub commit_failures_total: AtomicU64,
    /// Total rebalance events handled.
    pub rebalances_total: AtomicU64,
}

impl EngineMetrics {
    /// Creates zeroed metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a processed batch.
    pub fn record_batch(&self, records: u64) {
        self.records_total.fetch_add(records, Ordering::Relaxed);
        self.batches_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an emitted value.
    pub fn record_emit(&self) {
        self.emitted_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a dropped record.
    pub fn record_drop(&self) {
        self.dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a dead-lettered record.
    pub fn record_dead_letter(&self) {
        self.dead_letters_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a successful commit.
    pub fn record_commit(&self) {
        self.commits_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a commit that exhausted its retries.
    pub fn record_commit_failure(&self) {
        self.commit_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a handled rebalance.
    pub fn record_rebalance(&self) {
        self.rebalances_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time snapshot.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_total: self.records_total.load(Ordering::Relaxed),
            batches_total: self.batches_total.load(Ordering::Relaxed),
            emitted_total: self.emitted_total.load(Ordering::Relaxed),
            dropped_total: self.dropped_total.load(Ordering::Relaxed),
            dead_letters_total: self.dead_letters_total.load(Ordering::Relaxed),
            commits_total: self.commits_total.load(Ordering::Relaxed),
            commit_failures_total: self.commit_failures_total.load(Ordering::Relaxed),
            rebalances_total: self.rebalances_total.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of [`EngineMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Total records processed.
    pub records_total: u64,
    /// Total non-empty batches.
    pub batches_total: u64,
    /// Total emitted values.
    pub emitted_total: u64,
    /// Total dropped records.
    pub dropped_total: u64,
    /// Total dead-lettered records.
    pub dead_letters_total: u64,
    /// Total successful commits.
    pub commits_total: u64,
    /// Total exhausted commit attempts.
    pub commit_failures_total: u64,
    /// Total rebalances handled.
    pub rebalances_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let m = EngineMetrics::new();
        m.record_batch(100);
        m.record_batch(50);
        m.record_emit();
        m.record_drop();
        m.record_dead_letter();
        m.record_commit();
        m.record_commit_failure();
        m.record_rebalance();

        let snap = m.snapshot();
        assert_eq!(snap.records_total, 150);
        assert_eq!(snap.batches_total, 2);
        assert_eq!(snap.emitted_total, 1);
        assert_eq!(snap.dropped_total, 1);
        assert_eq!(snap.dead_letters_total, 1);
        assert_eq!(snap.commits_total, 1);
        assert_eq!(snap.commit_failures_total, 1);
        assert_eq!(snap.rebalances_total, 1);
    }
}
