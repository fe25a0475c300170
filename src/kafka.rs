//! Kafka-backed implementations of the engine's boundary traits.
//!
//! [`KafkaPuller`] wraps rdkafka's `StreamConsumer` with manual offset
//! management (`enable.auto.commit=false`); group rebalances surface as
//! [`PullBatch::AssignmentChanged`] events so the runtime can run its
//! barrier before the next batch. [`KafkaOffsetStore`] commits through
//! the consumer group's offset facility, and the producer-backed sinks
//! deliver emit and dead-letter output.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::committer::OffsetStore;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::puller::{PullBatch, RecordPuller};
use crate::record::Record;
use crate::sink::{DeadLetterSink, EmitSink};

const SYNC_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Consumer context that captures rebalance outcomes.
///
/// librdkafka invokes the callbacks from inside `poll`, so the context
/// only queues the resulting assignment; the puller hands it to the
/// runtime as a normal poll event.
#[derive(Clone, Default)]
pub struct EngineContext {
    pending: Arc<Mutex<VecDeque<Vec<i32>>>>,
}

impl EngineContext {
    fn pending_handle(&self) -> Arc<Mutex<VecDeque<Vec<i32>>>> {
        Arc::clone(&self.pending)
    }
}

impl ClientContext for EngineContext {}

impl ConsumerContext for EngineContext {
    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) | Rebalance::Revoke(partitions) => {
                debug!(count = partitions.count(), "rebalance callback");
                // The full assignment after this event, not the delta.
                match base_consumer.assignment() {
                    Ok(tpl) => {
                        let assignment: Vec<i32> =
                            tpl.elements().iter().map(|e| e.partition()).collect();
                        info!(?assignment, "group assignment changed");
                        self.pending.lock().push_back(assignment);
                    }
                    Err(e) => warn!(error = %e, "failed to read assignment after rebalance"),
                }
            }
            Rebalance::Error(e) => error!(error = %e, "rebalance failed"),
        }
    }
}

/// [`RecordPuller`] over a Kafka consumer group.
pub struct KafkaPuller {
    consumer: Arc<StreamConsumer<EngineContext>>,
    topic: String,
    pending: Arc<Mutex<VecDeque<Vec<i32>>>>,
}

impl KafkaPuller {
    /// Creates the consumer and subscribes to the configured topic.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::FatalConfig`] if the client cannot be
    /// built and [`EngineError::ConnectionLost`] if the subscription
    /// fails.
    pub fn connect(config: &EngineConfig) -> Result<Self, EngineError> {
        let context = EngineContext::default();
        let pending = context.pending_handle();

        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", config.offset_reset.as_client_str());
        for (key, value) in &config.client_properties {
            client.set(key, value);
        }

        let consumer: StreamConsumer<EngineContext> =
            client.create_with_context(context).map_err(|e| {
                EngineError::FatalConfig(format!("failed to create consumer: {e}"))
            })?;
        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(|e| EngineError::ConnectionLost(format!("failed to subscribe: {e}")))?;
        info!(
            topic = %config.topic,
            group_id = %config.group_id,
            "subscribed to topic"
        );

        Ok(Self {
            consumer: Arc::new(consumer),
            topic: config.topic.clone(),
            pending,
        })
    }

    /// Returns an [`OffsetStore`] backed by this puller's consumer
    /// group, so commits and cursor seeds share one group membership.
    #[must_use]
    pub fn offset_store(&self) -> KafkaOffsetStore {
        KafkaOffsetStore {
            consumer: Arc::clone(&self.consumer),
            topic: self.topic.clone(),
        }
    }
}

#[async_trait]
impl RecordPuller for KafkaPuller {
    async fn poll(
        &mut self,
        max_wait: Duration,
        max_records: usize,
    ) -> Result<PullBatch, EngineError> {
        if let Some(assignment) = self.pending.lock().pop_front() {
            return Ok(PullBatch::AssignmentChanged(assignment));
        }

        let mut records = Vec::with_capacity(max_records.min(1024));
        let started = Instant::now();
        while records.len() < max_records {
            let remaining = max_wait.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Ok(Ok(msg)) => {
                    let mut record = Record::new(
                        msg.partition(),
                        msg.offset(),
                        msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                    );
                    if let Some(key) = msg.key() {
                        record = record.with_key(key.to_vec());
                    }
                    if let Some(ts) = msg.timestamp().to_millis() {
                        record = record.with_timestamp(ts);
                    }
                    records.push(record);
                    // A rebalance callback may have fired inside recv;
                    // finish this batch and surface it next poll.
                    if !self.pending.lock().is_empty() {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    if records.is_empty() {
                        return Err(map_kafka_error(&e));
                    }
                    warn!(error = %e, "consumer error mid-batch, returning partial batch");
                    break;
                }
                Err(_) => break, // poll window exhausted
            }
        }
        Ok(PullBatch::Records(records))
    }

    async fn seek(&mut self, partition: i32, offset: i64) -> Result<(), EngineError> {
        self.consumer
            .seek(&self.topic, partition, Offset::Offset(offset), SYNC_OP_TIMEOUT)
            .map_err(|e| {
                EngineError::ConnectionLost(format!(
                    "seek to {partition}@{offset} failed: {e}"
                ))
            })
    }

    fn assignment(&self) -> Vec<i32> {
        self.consumer
            .assignment()
            .map(|tpl| tpl.elements().iter().map(|e| e.partition()).collect())
            .unwrap_or_default()
    }
}

/// [`OffsetStore`] over the consumer group's offset facility.
pub struct KafkaOffsetStore {
    consumer: Arc<StreamConsumer<EngineContext>>,
    topic: String,
}

#[async_trait]
impl OffsetStore for KafkaOffsetStore {
    async fn commit(
        &mut self,
        offsets: &std::collections::HashMap<i32, i64>,
    ) -> Result<(), EngineError> {
        let mut tpl = TopicPartitionList::new();
        for (partition, offset) in offsets {
            tpl.add_partition_offset(&self.topic, *partition, Offset::Offset(*offset))
                .map_err(|e| {
                    EngineError::ConnectionLost(format!("invalid commit offset: {e}"))
                })?;
        }
        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| EngineError::ConnectionLost(format!("offset commit failed: {e}")))
    }

    async fn committed(&mut self, partition: i32) -> Result<Option<i64>, EngineError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(&self.topic, partition);
        let committed = self
            .consumer
            .committed_offsets(tpl, SYNC_OP_TIMEOUT)
            .map_err(|e| {
                EngineError::ConnectionLost(format!("committed-offset lookup failed: {e}"))
            })?;
        Ok(committed
            .elements()
            .first()
            .and_then(|e| e.offset().to_raw())
            .filter(|o| *o >= 0))
    }
}

/// [`EmitSink`] producing transform output to the configured emit topic.
pub struct KafkaEmitSink {
    producer: FutureProducer,
    topic: String,
}

impl KafkaEmitSink {
    /// Builds a producer for the configured `emit.topic`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MissingConfig`] if `emit.topic` is unset.
    pub fn connect(config: &EngineConfig) -> Result<Self, EngineError> {
        let topic = config
            .emit_topic
            .clone()
            .ok_or_else(|| EngineError::MissingConfig("emit.topic".into()))?;
        Ok(Self {
            producer: build_producer(config)?,
            topic,
        })
    }
}

#[async_trait]
impl EmitSink for KafkaEmitSink {
    async fn emit(&mut self, key: Option<&[u8]>, value: &[u8]) -> Result<(), EngineError> {
        let delivery = match key {
            Some(key) => {
                self.producer
                    .send(
                        FutureRecord::to(&self.topic).payload(value).key(key),
                        SYNC_OP_TIMEOUT,
                    )
                    .await
            }
            None => {
                self.producer
                    .send(
                        FutureRecord::<[u8], [u8]>::to(&self.topic).payload(value),
                        SYNC_OP_TIMEOUT,
                    )
                    .await
            }
        };
        delivery
            .map(|_| ())
            .map_err(|(e, _)| EngineError::Sink(format!("emit to {} failed: {e}", self.topic)))
    }
}

/// [`DeadLetterSink`] producing failed records to the configured
/// dead-letter topic, with the failure reason and source position
/// carried in headers.
pub struct KafkaDeadLetterSink {
    producer: FutureProducer,
    topic: String,
}

impl KafkaDeadLetterSink {
    /// Builds a producer for the configured `dead.letter.topic`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MissingConfig`] if `dead.letter.topic` is
    /// unset.
    pub fn connect(config: &EngineConfig) -> Result<Self, EngineError> {
        let topic = config
            .dead_letter_topic
            .clone()
            .ok_or_else(|| EngineError::MissingConfig("dead.letter.topic".into()))?;
        Ok(Self {
            producer: build_producer(config)?,
            topic,
        })
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    async fn publish(&mut self, record: &Record, reason: &str) -> Result<(), EngineError> {
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "reason",
                value: Some(reason),
            })
            .insert(Header {
                key: "source-partition",
                value: Some(&record.partition.to_string()),
            })
            .insert(Header {
                key: "source-offset",
                value: Some(&record.offset.to_string()),
            });

        let mut payload = FutureRecord::<[u8], [u8]>::to(&self.topic)
            .payload(record.value.as_slice())
            .headers(headers);
        if let Some(key) = record.key.as_deref() {
            payload = payload.key(key);
        }
        self.producer
            .send(payload, SYNC_OP_TIMEOUT)
            .await
            .map(|_| ())
            .map_err(|(e, _)| {
                EngineError::Sink(format!("dead-letter to {} failed: {e}", self.topic))
            })
    }
}

fn build_producer(config: &EngineConfig) -> Result<FutureProducer, EngineError> {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &config.bootstrap_servers);
    for (key, value) in &config.client_properties {
        client.set(key, value);
    }
    client
        .create()
        .map_err(|e| EngineError::FatalConfig(format!("failed to create producer: {e}")))
}

fn map_kafka_error(e: &KafkaError) -> EngineError {
    match e {
        KafkaError::ClientConfig(..) | KafkaError::ClientCreation(..) => {
            EngineError::FatalConfig(e.to_string())
        }
        _ => EngineError::ConnectionLost(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_are_fatal() {
        let err = map_kafka_error(&KafkaError::ClientCreation("bad config".into()));
        assert!(matches!(err, EngineError::FatalConfig(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_transport_errors_are_retryable() {
        let err = map_kafka_error(&KafkaError::MessageConsumption(
            rdkafka::types::RDKafkaErrorCode::BrokerTransportFailure,
        ));
        assert!(matches!(err, EngineError::ConnectionLost(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_emit_sink_requires_topic() {
        let config = EngineConfig {
            bootstrap_servers: "localhost:9092".into(),
            ..EngineConfig::default()
        };
        let err = KafkaEmitSink::connect(&config).unwrap_err();
        assert!(matches!(err, EngineError::MissingConfig(_)));
    }
}
