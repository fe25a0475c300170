//! Processing stage.
//!
//! Applies a user-supplied [`Transform`] to each record, in offset order
//! per partition. Failures are routed through the retry/poison policy:
//! a record is attempted up to the policy's `max_attempts`, then sent to
//! the dead-letter sink exactly once so the partition keeps moving.

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::record::{ProcessingResult, Record};
use crate::retry::RetryPolicy;
use crate::sink::DeadLetterSink;
use crate::state::StateStore;

/// A user-supplied transformation over records.
///
/// Transforms run per-partition sequentially, so state writes are visible
/// to subsequent calls without synchronization. Implementations should be
/// duplicate-tolerant: under at-least-once delivery the same record may be
/// seen again after a restart.
pub trait Transform: Send {
    /// Applies the transform to one record.
    fn apply(
        &mut self,
        record: &Record,
        state: Option<&mut dyn StateStore>,
    ) -> ProcessingResult;
}

impl<F> Transform for F
where
    F: FnMut(&Record, Option<&mut dyn StateStore>) -> ProcessingResult + Send,
{
    fn apply(
        &mut self,
        record: &Record,
        state: Option<&mut dyn StateStore>,
    ) -> ProcessingResult {
        self(record, state)
    }
}

/// Terminal outcome of processing one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The transform produced a value to emit downstream.
    Emit(Vec<u8>),
    /// The record was consumed without output.
    Dropped,
    /// The record exhausted its attempts and went to the dead-letter sink.
    DeadLettered,
}

/// Applies a transform with retry and dead-letter routing.
pub struct ProcessingStage {
    transform: Box<dyn Transform>,
    retry: RetryPolicy,
}

impl ProcessingStage {
    /// Creates a stage around the given transform and retry policy.
    ///
    /// `retry.max_attempts` is the total number of times the transform is
    /// invoked per record before dead-lettering.
    #[must_use]
    pub fn new(transform: Box<dyn Transform>, retry: RetryPolicy) -> Self {
        Self { transform, retry }
    }

    /// Processes one record to a terminal outcome.
    ///
    /// Never returns an error: the poison policy guarantees forward
    /// progress, so every record ends in `Emit`, `Dropped`, or
    /// `DeadLettered`. Dead-letter delivery failures are logged and
    /// swallowed.
    pub async fn process(
        &mut self,
        record: &Record,
        mut state: Option<&mut Box<dyn StateStore>>,
        dead_letter: &mut dyn DeadLetterSink,
    ) -> StageOutcome {
        let mut attempts = 0;
        loop {
            attempts += 1;
            // Reborrow through the box so each attempt gets a fresh
            // short-lived `&mut dyn StateStore`.
            let store: Option<&mut dyn StateStore> = match state.as_mut() {
                Some(boxed) => Some(boxed.as_mut()),
                None => None,
            };
            match self.transform.apply(record, store) {
                ProcessingResult::Emit(value) => return StageOutcome::Emit(value),
                ProcessingResult::Drop => return StageOutcome::Dropped,
                ProcessingResult::Fail(reason) => {
                    if self.retry.should_retry(attempts) {
                        debug!(
                            partition = record.partition,
                            offset = record.offset,
                            attempts,
                            reason,
                            "processing failed, retrying after backoff"
                        );
                        sleep(self.retry.delay_for_attempt(attempts)).await;
                        continue;
                    }

                    warn!(
                        partition = record.partition,
                        offset = record.offset,
                        attempts,
                        reason,
                        "processing attempts exhausted, routing to dead letter"
                    );
                    if let Err(e) = dead_letter.publish(record, &reason).await {
                        warn!(
                            partition = record.partition,
                            offset = record.offset,
                            error = %e,
                            "dead-letter delivery failed"
                        );
                    }
                    return StageOutcome::DeadLettered;
                }
            }
        }
    }
}

impl std::fmt::Debug for ProcessingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingStage")
            .field("max_attempts", &self.retry.max_attempts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::state::InMemoryStateStore;
    use crate::testing::MemoryDeadLetterSink;

    fn fast_retry(max_attempts: usize) -> RetryPolicy {
        RetryPolicy::fixed(max_attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_emit_passthrough() {
        let mut stage = ProcessingStage::new(
            Box::new(|r: &Record, _: Option<&mut dyn StateStore>| {
                ProcessingResult::Emit(r.value.to_ascii_uppercase())
            }),
            fast_retry(3),
        );
        let mut dlq = MemoryDeadLetterSink::new();

        let outcome = stage
            .process(&Record::new(0, 1, b"abc".to_vec()), None, &mut dlq)
            .await;
        assert_eq!(outcome, StageOutcome::Emit(b"ABC".to_vec()));
        assert_eq!(dlq.published().len(), 0);
    }

    #[tokio::test]
    async fn test_drop_consumes_record() {
        let mut stage = ProcessingStage::new(
            Box::new(|_: &Record, _: Option<&mut dyn StateStore>| ProcessingResult::Drop),
            fast_retry(3),
        );
        let mut dlq = MemoryDeadLetterSink::new();

        let outcome = stage
            .process(&Record::new(0, 1, b"x".to_vec()), None, &mut dlq)
            .await;
        assert_eq!(outcome, StageOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_poison_record_attempted_exactly_max_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut stage = ProcessingStage::new(
            Box::new(move |_: &Record, _: Option<&mut dyn StateStore>| {
                counter.fetch_add(1, Ordering::Relaxed);
                ProcessingResult::Fail("always broken".into())
            }),
            fast_retry(3),
        );
        let mut dlq = MemoryDeadLetterSink::new();

        let record = Record::new(2, 9, b"poison".to_vec());
        let outcome = stage.process(&record, None, &mut dlq).await;

        assert_eq!(outcome, StageOutcome::DeadLettered);
        assert_eq!(calls.load(Ordering::Relaxed), 3);

        let published = dlq.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0.offset, 9);
        assert_eq!(published[0].1, "always broken");
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut stage = ProcessingStage::new(
            Box::new(move |_: &Record, _: Option<&mut dyn StateStore>| {
                if counter.fetch_add(1, Ordering::Relaxed) == 0 {
                    ProcessingResult::Fail("flaky".into())
                } else {
                    ProcessingResult::Emit(b"ok".to_vec())
                }
            }),
            fast_retry(3),
        );
        let mut dlq = MemoryDeadLetterSink::new();

        let outcome = stage
            .process(&Record::new(0, 0, b"x".to_vec()), None, &mut dlq)
            .await;
        assert_eq!(outcome, StageOutcome::Emit(b"ok".to_vec()));
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert!(dlq.published().is_empty());
    }

    #[tokio::test]
    async fn test_stateful_counting_transform() {
        let mut stage = ProcessingStage::new(
            Box::new(|r: &Record, state: Option<&mut dyn StateStore>| {
                let store = state.expect("store required");
                let key = r.key.as_deref().unwrap_or(b"");
                let count = store
                    .get(key)
                    .map_or(0_u64, |v| u64::from_le_bytes(v.try_into().unwrap()));
                store.put(key, (count + 1).to_le_bytes().to_vec());
                ProcessingResult::Emit((count + 1).to_le_bytes().to_vec())
            }),
            fast_retry(1),
        );
        let mut store: Box<dyn StateStore> = Box::new(InMemoryStateStore::new());
        let mut dlq = MemoryDeadLetterSink::new();

        for offset in 0..3 {
            let record = Record::new(0, offset, b"v".to_vec()).with_key(b"user-1".to_vec());
            let outcome = stage.process(&record, Some(&mut store), &mut dlq).await;
            assert_eq!(
                outcome,
                StageOutcome::Emit((offset as u64 + 1).to_le_bytes().to_vec())
            );
        }
        assert_eq!(store.get(b"user-1"), Some(3_u64.to_le_bytes().to_vec()));
    }

    #[tokio::test]
    async fn test_stateful_transform_store_survives_retries() {
        // Each attempt writes to the store; the first attempt fails, so
        // a successful outcome must see the earlier attempt's write.
        let mut stage = ProcessingStage::new(
            Box::new(|_: &Record, state: Option<&mut dyn StateStore>| {
                let store = state.expect("store required");
                let seen = store
                    .get(b"attempts")
                    .map_or(0_u64, |v| u64::from_le_bytes(v.try_into().unwrap()))
                    + 1;
                store.put(b"attempts", seen.to_le_bytes().to_vec());
                if seen < 2 {
                    ProcessingResult::Fail("warming up".into())
                } else {
                    ProcessingResult::Emit(seen.to_le_bytes().to_vec())
                }
            }),
            fast_retry(3),
        );
        let mut store: Box<dyn StateStore> = Box::new(InMemoryStateStore::new());
        let mut dlq = MemoryDeadLetterSink::new();

        let record = Record::new(0, 7, b"v".to_vec());
        let outcome = stage.process(&record, Some(&mut store), &mut dlq).await;

        assert_eq!(outcome, StageOutcome::Emit(2_u64.to_le_bytes().to_vec()));
        assert_eq!(store.get(b"attempts"), Some(2_u64.to_le_bytes().to_vec()));
        assert_eq!(dlq.published().len(), 0);
    }
}
