//! # Durable Log Bridge
//!
//! Ingress appends accepted payloads to an append-only log keyed by stream
//! id; a single consumer loop reads them back, transforms them and hands
//! them to the hub, committing its position only after the hand-off.
//!
//! The log itself sits behind two async traits so the relay can run on the
//! in-process [`MemoryLog`] or, with the `kafka` feature, on a Kafka
//! cluster.

mod consumer;
mod errors;
#[cfg(feature = "kafka")]
mod kafka;
mod memory;
mod producer;

pub use consumer::{Backoff, ConsumerWorker};
pub use errors::{LogError, LogResult};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaConsumer, KafkaProducer};
pub use memory::{MemoryConsumer, MemoryLog, MemoryProducer};
pub use producer::Producer;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::config::{DurableLogConfig, LogBackendKind};

/// A record on its way into the log
#[derive(Debug, Clone)]
pub struct OutgoingRecord {
    /// Stream id; the log preserves order per key
    pub key: String,
    pub payload: Bytes,
}

/// Where the log placed an acknowledged record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

/// A record read back from the log
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Bytes,
    pub timestamp: DateTime<Utc>,
}

/// Write side of the durable log
#[async_trait]
pub trait LogProducer: Send + Sync {
    /// Append a record and wait for the log's acknowledgment
    async fn produce(&self, record: OutgoingRecord) -> LogResult<Delivery>;
}

/// Read side of the durable log, bound to one consumer group
#[async_trait]
pub trait LogConsumer: Send {
    /// Wait for the next record
    async fn poll(&mut self) -> LogResult<LogRecord>;

    /// Mark `record` and everything before it on its partition as processed
    async fn commit(&mut self, record: &LogRecord) -> LogResult<()>;
}

/// An opened producer/consumer pair
pub struct LogBackend {
    pub producer: Arc<dyn LogProducer>,
    pub consumer: Box<dyn LogConsumer>,
}

impl LogBackend {
    /// Open the backend selected in `config`
    pub fn open(config: &DurableLogConfig) -> LogResult<Self> {
        match config.backend {
            LogBackendKind::Memory => {
                let log = MemoryLog::with_retention(&config.topic, config.retention_records);
                Ok(log.backend(&config.group_id))
            }
            #[cfg(feature = "kafka")]
            LogBackendKind::Kafka => {
                let (producer, consumer) = kafka::open(config)?;
                Ok(Self {
                    producer: Arc::new(producer),
                    consumer: Box::new(consumer),
                })
            }
            #[cfg(not(feature = "kafka"))]
            LogBackendKind::Kafka => Err(LogError::Broker(
                "kafka backend requested but this build lacks the `kafka` feature".to_string(),
            )),
        }
    }
}
