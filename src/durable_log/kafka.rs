//! Kafka-backed durable log (feature `kafka`)

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use tracing::info;

use super::{Delivery, LogConsumer, LogError, LogProducer, LogRecord, LogResult, OutgoingRecord};
use crate::config::DurableLogConfig;

impl From<KafkaError> for LogError {
    fn from(e: KafkaError) -> Self {
        LogError::Broker(e.to_string())
    }
}

pub struct KafkaProducer {
    producer: FutureProducer,
    topic: String,
}

#[async_trait]
impl LogProducer for KafkaProducer {
    async fn produce(&self, record: OutgoingRecord) -> LogResult<Delivery> {
        let outgoing = FutureRecord::to(&self.topic)
            .key(record.key.as_str())
            .payload(record.payload.as_ref());

        // message.timeout.ms bounds the wait for the acknowledgment
        let (partition, offset) = self
            .producer
            .send(outgoing, Timeout::Never)
            .await
            .map_err(|(e, _)| LogError::from(e))?;

        Ok(Delivery { partition, offset })
    }
}

pub struct KafkaConsumer {
    consumer: StreamConsumer,
}

#[async_trait]
impl LogConsumer for KafkaConsumer {
    async fn poll(&mut self) -> LogResult<LogRecord> {
        let message = self.consumer.recv().await?;

        let key = message
            .key()
            .filter(|key| !key.is_empty())
            .map(|key| String::from_utf8_lossy(key).into_owned());
        let timestamp = message
            .timestamp()
            .to_millis()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_else(Utc::now);

        Ok(LogRecord {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key,
            payload: Bytes::copy_from_slice(message.payload().unwrap_or_default()),
            timestamp,
        })
    }

    async fn commit(&mut self, record: &LogRecord) -> LogResult<()> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&record.topic, record.partition, Offset::Offset(record.offset + 1))
            .map_err(|e| LogError::Commit {
                topic: record.topic.clone(),
                partition: record.partition,
                offset: record.offset,
                reason: e.to_string(),
            })?;

        self.consumer
            .commit(&offsets, CommitMode::Sync)
            .map_err(|e| LogError::Commit {
                topic: record.topic.clone(),
                partition: record.partition,
                offset: record.offset,
                reason: e.to_string(),
            })
    }
}

/// Connect a producer and a manually-committing consumer to the configured cluster
pub fn open(config: &DurableLogConfig) -> LogResult<(KafkaProducer, KafkaConsumer)> {
    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", &config.brokers)
        .set("message.timeout.ms", config.delivery_timeout_ms.to_string())
        .create()?;

    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &config.brokers)
        .set("group.id", &config.group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .create()?;
    consumer.subscribe(&[config.topic.as_str()])?;

    info!(
        brokers = %config.brokers,
        topic = %config.topic,
        group_id = %config.group_id,
        "Connected to Kafka"
    );

    Ok((
        KafkaProducer {
            producer,
            topic: config.topic.clone(),
        },
        KafkaConsumer { consumer },
    ))
}
