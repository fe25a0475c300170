//! Record puller boundary over the external log.
//!
//! [`RecordPuller`] abstracts the external log client: it negotiates
//! partition assignment, pulls bounded batches, and surfaces rebalances
//! as explicit [`PullBatch::AssignmentChanged`] events. Because events are
//! returned from `poll` itself, the runtime always handles an assignment
//! change to completion before the next poll is issued — the rebalance
//! barrier falls out of the call structure instead of hidden reentrancy.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::record::Record;

/// One outcome of a poll call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullBatch {
    /// Records pulled from assigned partitions. May be empty if `max_wait`
    /// elapsed with nothing available.
    Records(Vec<Record>),
    /// The partition assignment changed; carries the complete new
    /// assignment. No records are delivered in the same poll.
    AssignmentChanged(Vec<i32>),
}

/// Boundary trait over the external log client.
#[async_trait]
pub trait RecordPuller: Send {
    /// Pulls up to `max_records` records, blocking at most `max_wait`.
    ///
    /// Never blocks indefinitely. Rebalances are delivered as
    /// [`PullBatch::AssignmentChanged`] before any records from the new
    /// assignment.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ConnectionLost`] for retryable transport
    /// failures and [`EngineError::FatalConfig`] for authentication or
    /// configuration rejections that must halt the runtime.
    async fn poll(
        &mut self,
        max_wait: Duration,
        max_records: usize,
    ) -> Result<PullBatch, EngineError>;

    /// Repositions reading for `partition` to start at `offset`.
    ///
    /// Called during the rebalance barrier to resume newly assigned
    /// partitions from their durably committed offsets.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ConnectionLost`] if the client cannot seek.
    async fn seek(&mut self, partition: i32, offset: i64) -> Result<(), EngineError>;

    /// Returns the partitions currently assigned to this instance.
    fn assignment(&self) -> Vec<i32>;
}
