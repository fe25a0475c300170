//! Engine error types.
//!
//! A single [`EngineError`] hierarchy covers every failure the engine can
//! surface. Transport errors are retryable, configuration errors halt the
//! runtime, and cursor invariant violations are treated as fatal assertions.

use thiserror::Error;

/// Errors that can occur during stream-engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Transport-level connection loss. Retryable with backoff.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Authentication or broker-side configuration rejection.
    /// Non-retryable; halts the runtime.
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),

    /// Required configuration key is missing.
    #[error("missing required config: {0}")]
    MissingConfig(String),

    /// A configuration value failed to parse or validate.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A cursor was asked to advance by a negative delta.
    /// Should never occur in correct operation.
    #[error("invalid advance of {delta} on partition {partition}")]
    InvalidAdvance {
        /// The partition whose cursor was advanced.
        partition: i32,
        /// The offending delta.
        delta: i64,
    },

    /// A commit acknowledgement would move a cursor outside its valid range.
    /// Should never occur in correct operation.
    #[error(
        "offset {offset} out of range on partition {partition} \
         (committed {committed}, next {next})"
    )]
    OffsetOutOfRange {
        /// The partition whose cursor rejected the offset.
        partition: i32,
        /// The offending offset.
        offset: i64,
        /// The cursor's durably committed offset.
        committed: i64,
        /// The cursor's next-to-read offset.
        next: i64,
    },

    /// A per-record transformation failure.
    #[error("processing failed: {0}")]
    Processing(String),

    /// An offset commit exhausted its retries. The next successful
    /// commit supersedes it under at-least-once semantics.
    #[error("offset commit failed after {attempts} attempts: {message}")]
    CommitFailed {
        /// Number of commit attempts made.
        attempts: usize,
        /// The last underlying failure.
        message: String,
    },

    /// A downstream sink rejected an emit or dead-letter delivery.
    #[error("sink error: {0}")]
    Sink(String),
}

impl EngineError {
    /// Returns `true` if the runtime should retry the failed operation
    /// with backoff instead of halting.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::ConnectionLost(_) | EngineError::Sink(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = EngineError::ConnectionLost("broker unreachable".into());
        assert_eq!(err.to_string(), "connection lost: broker unreachable");
    }

    #[test]
    fn test_offset_out_of_range_display() {
        let err = EngineError::OffsetOutOfRange {
            partition: 3,
            offset: 99,
            committed: 10,
            next: 50,
        };
        let msg = err.to_string();
        assert!(msg.contains("partition 3"));
        assert!(msg.contains("99"));
        assert!(msg.contains("committed 10"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(EngineError::ConnectionLost("x".into()).is_retryable());
        assert!(EngineError::Sink("x".into()).is_retryable());
        assert!(!EngineError::FatalConfig("x".into()).is_retryable());
        assert!(!EngineError::InvalidAdvance {
            partition: 0,
            delta: -1
        }
        .is_retryable());
        assert!(!EngineError::CommitFailed {
            attempts: 3,
            message: "x".into()
        }
        .is_retryable());
    }
}
