//! Ingress-side producer

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Delivery, LogError, LogProducer, LogResult, OutgoingRecord};
use crate::hub::StreamId;
use crate::observability::RelayMetrics;

/// Appends ingress payloads to the log with a bounded wait
///
/// There is no retry here. On timeout the record may or may not have been
/// written; the caller decides whether to resend.
#[derive(Clone)]
pub struct Producer {
    backend: Arc<dyn LogProducer>,
    delivery_timeout: Duration,
    metrics: Arc<RelayMetrics>,
}

impl Producer {
    pub fn new(
        backend: Arc<dyn LogProducer>,
        delivery_timeout: Duration,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            backend,
            delivery_timeout,
            metrics,
        }
    }

    /// Append `payload` keyed by `stream_id` and wait for the acknowledgment
    pub async fn send(&self, stream_id: &StreamId, payload: Bytes) -> LogResult<Delivery> {
        let started = Instant::now();
        let record = OutgoingRecord {
            key: stream_id.to_string(),
            payload,
        };

        let delivery = match tokio::time::timeout(self.delivery_timeout, self.backend.produce(record)).await {
            Ok(result) => result,
            Err(_) => Err(LogError::DeliveryTimeout {
                stream_id: stream_id.to_string(),
                timeout: self.delivery_timeout,
            }),
        };

        match &delivery {
            Ok(placed) => {
                self.metrics.record_sent(stream_id, started.elapsed());
                debug!(
                    stream_id = %stream_id,
                    partition = placed.partition,
                    offset = placed.offset,
                    "Record delivered"
                );
            }
            Err(e) => {
                self.metrics.record_send_failed(stream_id, started.elapsed());
                warn!(
                    stream_id = %stream_id,
                    transient = e.is_transient(),
                    error = %e,
                    "Record delivery failed"
                );
            }
        }

        delivery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable_log::{LogConsumer, MemoryLog};
    use async_trait::async_trait;

    struct SilentBroker;

    #[async_trait]
    impl LogProducer for SilentBroker {
        async fn produce(&self, _record: OutgoingRecord) -> LogResult<Delivery> {
            std::future::pending().await
        }
    }

    struct FailingBroker;

    #[async_trait]
    impl LogProducer for FailingBroker {
        async fn produce(&self, _record: OutgoingRecord) -> LogResult<Delivery> {
            Err(LogError::Broker("leader not available".into()))
        }
    }

    #[tokio::test]
    async fn test_send_appends_keyed_record_and_counts_it() {
        let log = MemoryLog::new("t");
        let metrics = Arc::new(RelayMetrics::new());
        let producer = Producer::new(
            Arc::new(log.producer()),
            Duration::from_secs(30),
            Arc::clone(&metrics),
        );
        let id = StreamId::new("s");

        let delivery = producer.send(&id, Bytes::from_static(b"{}")).await.unwrap();
        assert_eq!(delivery.offset, 0);

        let mut consumer = log.consumer("g");
        assert_eq!(consumer.poll().await.unwrap().key.as_deref(), Some("s"));
        assert_eq!(metrics.snapshot().streams["s"].messages_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_send_times_out() {
        let metrics = Arc::new(RelayMetrics::new());
        let producer = Producer::new(
            Arc::new(SilentBroker),
            Duration::from_secs(30),
            Arc::clone(&metrics),
        );

        let result = producer.send(&StreamId::new("s"), Bytes::new()).await;
        assert!(matches!(result, Err(LogError::DeliveryTimeout { .. })));

        let series = &metrics.snapshot().streams["s"];
        assert_eq!(series.messages_sent, 0);
        assert_eq!(series.processing_time.count, 1);
        assert!((series.processing_time.sum_seconds - 30.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_broker_error_is_returned_without_retry() {
        let metrics = Arc::new(RelayMetrics::new());
        let producer = Producer::new(
            Arc::new(FailingBroker),
            Duration::from_secs(30),
            Arc::clone(&metrics),
        );

        let result = producer.send(&StreamId::new("s"), Bytes::new()).await;
        assert!(matches!(result, Err(LogError::Broker(_))));
        assert_eq!(metrics.snapshot().streams["s"].processing_time.count, 1);
    }
}
