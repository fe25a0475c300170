//! Downstream sinks.
//!
//! [`EmitSink`] receives transform output for produce topologies; its
//! latency feeds the runtime's backpressure controller. [`DeadLetterSink`]
//! receives records that permanently fail processing; delivery failure
//! there is logged by the caller, never propagated.

use async_trait::async_trait;
use tracing::warn;

use crate::error::EngineError;
use crate::record::Record;

/// Sink for transform output in transform-then-produce topologies.
#[async_trait]
pub trait EmitSink: Send {
    /// Delivers one `(key, value)` pair downstream.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Sink`] when delivery fails; the runtime
    /// retries per its processing retry policy.
    async fn emit(&mut self, key: Option<&[u8]>, value: &[u8]) -> Result<(), EngineError>;
}

/// Sink for records that exceeded the processing retry policy.
#[async_trait]
pub trait DeadLetterSink: Send {
    /// Delivers the failed record together with its final error.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Sink`] when delivery fails. Callers log the
    /// failure and continue; dead-letter delivery is fire-and-forget.
    async fn publish(&mut self, record: &Record, reason: &str) -> Result<(), EngineError>;
}

/// Dead-letter sink that only logs, for deployments without a configured
/// dead-letter topic.
#[derive(Debug, Default)]
pub struct LoggingDeadLetterSink;

impl LoggingDeadLetterSink {
    /// Creates a logging dead-letter sink.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DeadLetterSink for LoggingDeadLetterSink {
    async fn publish(&mut self, record: &Record, reason: &str) -> Result<(), EngineError> {
        warn!(
            partition = record.partition,
            offset = record.offset,
            reason,
            "dead-lettered record (no dead-letter topic configured)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_logging_sink_accepts_everything() {
        let mut sink = LoggingDeadLetterSink::new();
        let record = Record::new(0, 7, b"bad".to_vec());
        assert!(sink.publish(&record, "parse error").await.is_ok());
    }
}
