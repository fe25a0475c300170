//! Record and processing-result types.
//!
//! A [`Record`] is immutable once pulled from the log; the engine never
//! mutates payloads, only routes them.

/// A single event pulled from one partition of the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// The partition this record was read from.
    pub partition: i32,
    /// Partition-local sequence number, unique and increasing.
    pub offset: i64,
    /// Optional record key, used for stateful transforms.
    pub key: Option<Vec<u8>>,
    /// Record payload.
    pub value: Vec<u8>,
    /// Broker-assigned timestamp in milliseconds since the epoch.
    pub timestamp_ms: i64,
}

impl Record {
    /// Creates a key-less record.
    #[must_use]
    pub fn new(partition: i32, offset: i64, value: impl Into<Vec<u8>>) -> Self {
        Self {
            partition,
            offset,
            key: None,
            value: value.into(),
            timestamp_ms: 0,
        }
    }

    /// Attaches a key to the record.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Attaches a timestamp to the record.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }
}

/// Outcome of applying a transform to one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingResult {
    /// Produce the given value downstream.
    Emit(Vec<u8>),
    /// Consume the record without producing output.
    Drop,
    /// The transform failed; routed through the retry/poison policy.
    Fail(String),
}
