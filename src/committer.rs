//! Offset committer.
//!
//! Coalesces processed-up-to offsets per partition and persists them
//! through an [`OffsetStore`] at a configured interval, or on demand for
//! rebalances and shutdown. Failed commits retry with exponential
//! backoff; exhausted retries surface [`EngineError::CommitFailed`] with
//! the pending offsets retained, so the next successful commit covers the
//! gap.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::retry::RetryPolicy;

/// Durable storage for committed offsets, typically the external log's
/// own offset facility.
///
/// `commit` must be atomic per partition: each partition's offset is
/// either durably updated or untouched. It need not be atomic across
/// partitions; a crash mid-commit is acceptable under at-least-once
/// semantics.
#[async_trait]
pub trait OffsetStore: Send {
    /// Durably records the given `partition -> next-to-read offset` map.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ConnectionLost`] for retryable transport
    /// failures.
    async fn commit(&mut self, offsets: &HashMap<i32, i64>) -> Result<(), EngineError>;

    /// Returns the durably committed offset for `partition`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ConnectionLost`] if the store is
    /// unreachable.
    async fn committed(&mut self, partition: i32) -> Result<Option<i64>, EngineError>;
}

/// Batches, coalesces, and retries offset commits.
pub struct OffsetCommitter<S: OffsetStore> {
    store: S,
    retry: RetryPolicy,
    interval: std::time::Duration,
    last_commit: Instant,
    /// Latest staged next-to-read offset per partition. Re-staging a
    /// partition before the previous flush completes coalesces to the
    /// highest offset.
    pending: HashMap<i32, i64>,
}

impl<S: OffsetStore> OffsetCommitter<S> {
    /// Creates a committer around the given store.
    #[must_use]
    pub fn new(store: S, interval: std::time::Duration, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            interval,
            last_commit: Instant::now(),
            pending: HashMap::new(),
        }
    }

    /// Stages `next_offset` as the processed-up-to position for
    /// `partition`. Offsets only coalesce upward.
    pub fn stage(&mut self, partition: i32, next_offset: i64) {
        let entry = self.pending.entry(partition).or_insert(next_offset);
        if next_offset > *entry {
            *entry = next_offset;
        }
    }

    /// Returns `true` if there are staged offsets awaiting commit.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Returns `true` if the commit interval has elapsed and offsets are
    /// staged.
    #[must_use]
    pub fn due(&self) -> bool {
        self.has_pending() && self.last_commit.elapsed() >= self.interval
    }

    /// Commits staged offsets if the interval has elapsed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::CommitFailed`] when retries are exhausted;
    /// the staged offsets are retained for the next attempt.
    pub async fn commit_due(&mut self) -> Result<Option<HashMap<i32, i64>>, EngineError> {
        if !self.due() {
            return Ok(None);
        }
        self.flush().await.map(Some)
    }

    /// Commits all staged offsets now, with retry.
    ///
    /// Returns the map that was durably committed so callers can update
    /// their cursors.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::CommitFailed`] when retries are exhausted.
    pub async fn flush(&mut self) -> Result<HashMap<i32, i64>, EngineError> {
        let batch = self.pending.clone();
        self.flush_batch(batch).await
    }

    /// Commits staged offsets for the given partitions only, used as the
    /// rebalance barrier for revoked partitions.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::CommitFailed`] when retries are exhausted.
    pub async fn flush_partitions(
        &mut self,
        partitions: &[i32],
    ) -> Result<HashMap<i32, i64>, EngineError> {
        let batch: HashMap<i32, i64> = self
            .pending
            .iter()
            .filter(|(p, _)| partitions.contains(p))
            .map(|(p, o)| (*p, *o))
            .collect();
        self.flush_batch(batch).await
    }

    /// Drops staged offsets for partitions that are no longer assigned.
    pub fn discard_partitions(&mut self, partitions: &[i32]) {
        for p in partitions {
            self.pending.remove(p);
        }
    }

    /// Looks up the durably committed offset for a partition, used to
    /// seed cursors on assignment.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn committed(&mut self, partition: i32) -> Result<Option<i64>, EngineError> {
        self.store.committed(partition).await
    }

    async fn flush_batch(
        &mut self,
        batch: HashMap<i32, i64>,
    ) -> Result<HashMap<i32, i64>, EngineError> {
        if batch.is_empty() {
            return Ok(batch);
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.store.commit(&batch).await {
                Ok(()) => {
                    // Only clear entries that were not re-staged higher
                    // while the commit was in flight.
                    for (p, committed) in &batch {
                        if self.pending.get(p) == Some(committed) {
                            self.pending.remove(p);
                        }
                    }
                    self.last_commit = Instant::now();
                    debug!(partitions = batch.len(), "committed offsets");
                    return Ok(batch);
                }
                Err(e) if self.retry.should_retry(attempts) => {
                    let delay = self.retry.delay_for_attempt(attempts);
                    warn!(
                        attempts,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "offset commit failed, retrying"
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    return Err(EngineError::CommitFailed {
                        attempts,
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}

impl<S: OffsetStore> std::fmt::Debug for OffsetCommitter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffsetCommitter")
            .field("pending", &self.pending.len())
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::MemoryOffsetStore;

    fn committer(store: MemoryOffsetStore) -> OffsetCommitter<MemoryOffsetStore> {
        OffsetCommitter::new(
            store,
            Duration::from_millis(0),
            RetryPolicy::fixed(3, Duration::from_millis(1)),
        )
    }

    #[tokio::test]
    async fn test_stage_coalesces_to_highest() {
        let store = MemoryOffsetStore::new();
        let mut c = committer(store.clone());

        c.stage(0, 5);
        c.stage(0, 12);
        c.stage(0, 9); // lower, ignored
        c.stage(1, 3);

        let committed = c.flush().await.unwrap();
        assert_eq!(committed.get(&0), Some(&12));
        assert_eq!(committed.get(&1), Some(&3));
        assert_eq!(store.committed_offset(0), Some(12));
        assert_eq!(store.commit_count(), 1);
        assert!(!c.has_pending());
    }

    #[tokio::test]
    async fn test_flush_empty_is_noop() {
        let store = MemoryOffsetStore::new();
        let mut c = committer(store.clone());
        let committed = c.flush().await.unwrap();
        assert!(committed.is_empty());
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_commit_retries_then_succeeds() {
        let store = MemoryOffsetStore::new();
        store.fail_next_commits(2);
        let mut c = committer(store.clone());

        c.stage(0, 10);
        let committed = c.flush().await.unwrap();
        assert_eq!(committed.get(&0), Some(&10));
        assert_eq!(store.committed_offset(0), Some(10));
        // Two failures plus the success.
        assert_eq!(store.commit_attempts(), 3);
    }

    #[tokio::test]
    async fn test_commit_exhaustion_retains_pending() {
        let store = MemoryOffsetStore::new();
        store.fail_next_commits(10);
        let mut c = committer(store.clone());

        c.stage(0, 10);
        let err = c.flush().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::CommitFailed { attempts: 3, .. }
        ));
        // Pending retained: a later flush covers the gap.
        assert!(c.has_pending());

        store.fail_next_commits(0);
        let committed = c.flush().await.unwrap();
        assert_eq!(committed.get(&0), Some(&10));
    }

    #[tokio::test]
    async fn test_flush_partitions_subset() {
        let store = MemoryOffsetStore::new();
        let mut c = committer(store.clone());

        c.stage(0, 5);
        c.stage(1, 7);
        c.stage(2, 9);

        let committed = c.flush_partitions(&[1]).await.unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed.get(&1), Some(&7));
        assert_eq!(store.committed_offset(1), Some(7));
        assert_eq!(store.committed_offset(0), None);

        // 0 and 2 still pending.
        c.discard_partitions(&[2]);
        let rest = c.flush().await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest.get(&0), Some(&5));
    }

    #[tokio::test]
    async fn test_interval_gating() {
        let store = MemoryOffsetStore::new();
        let mut c = OffsetCommitter::new(
            store.clone(),
            Duration::from_secs(3600),
            RetryPolicy::fixed(1, Duration::from_millis(1)),
        );

        c.stage(0, 4);
        assert!(!c.due());
        assert!(c.commit_due().await.unwrap().is_none());
        assert_eq!(store.commit_count(), 0);

        // Forced flush ignores the interval.
        let committed = c.flush().await.unwrap();
        assert_eq!(committed.get(&0), Some(&4));
    }

    #[tokio::test]
    async fn test_committed_lookup() {
        let store = MemoryOffsetStore::new();
        store.seed_committed(2, 42);
        let mut c = committer(store);
        assert_eq!(c.committed(2).await.unwrap(), Some(42));
        assert_eq!(c.committed(9).await.unwrap(), None);
    }
}
