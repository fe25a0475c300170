//! # Millipede Ingest
//!
//! A stream-processing engine over a partitioned, offset-addressed log.
//! The runtime pulls record batches from a [`puller::RecordPuller`],
//! drives each record through a user [`stage::Transform`], and commits
//! consumed offsets through an [`committer::OffsetStore`] with
//! at-least-once semantics.
//!
//! ## Architecture
//!
//! ```text
//! RecordPuller::poll() ──> ProcessingStage ──> EmitSink
//!        │                      │
//!        │ AssignmentChanged    │ exhausted retries
//!        ▼                      ▼
//!  PartitionCursor set     DeadLetterSink
//!        │
//!        ▼
//!  OffsetCommitter ──> OffsetStore (durable, restart-safe)
//! ```
//!
//! Backpressure is applied by adapting the requested poll batch size to
//! observed processing latency, so a slow transform never unbounds
//! memory. The `kafka` feature provides implementations of the boundary
//! traits on top of `rdkafka`.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Common test patterns that are acceptable
#![cfg_attr(
    test,
    allow(
        clippy::field_reassign_with_default,
        clippy::float_cmp,
        clippy::manual_let_else,
        clippy::unreadable_literal,
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )
)]

/// Engine error types.
pub mod error;

/// Engine configuration types.
pub mod config;

/// Record and transform-result types.
pub mod record;

/// Per-partition read/commit position tracking.
pub mod cursor;

/// Record source trait and poll batch types.
pub mod puller;

/// Per-record transform application with retry and poison routing.
pub mod stage;

/// Offset staging, coalescing, and durable commit.
pub mod committer;

/// The poll-process-commit loop and its lifecycle.
pub mod runtime;

/// Emit and dead-letter sink traits.
pub mod sink;

/// Per-partition state store support.
pub mod state;

/// Adaptive poll batch sizing.
pub mod backpressure;

/// Retry policies with exponential backoff.
pub mod retry;

/// Runtime counters.
pub mod metrics;

/// Testing utilities (mock puller, in-memory stores and sinks).
pub mod testing;

/// Kafka-backed implementations of the boundary traits.
#[cfg(feature = "kafka")]
pub mod kafka;

pub use config::{EngineConfig, OffsetReset, Properties};
pub use error::EngineError;
pub use record::{ProcessingResult, Record};
pub use runtime::{RuntimeHandle, RuntimeState, StreamRuntime};
pub use stage::Transform;
