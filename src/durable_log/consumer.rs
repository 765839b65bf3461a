//! Consumer loop: log → transform → hub → commit

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{LogConsumer, LogError, LogRecord};
use crate::config::{ConsumerConfig, TransformStage};
use crate::hub::{HubError, HubHandle, StreamId, StreamMessage};
use crate::observability::RelayMetrics;
use crate::transform;

/// Exponential backoff for read errors
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; doubles the next one up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl From<&ConsumerConfig> for Backoff {
    fn from(config: &ConsumerConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_initial_ms),
            Duration::from_millis(config.backoff_max_ms),
        )
    }
}

enum Outcome {
    /// Handed to the hub; safe to commit
    Commit,
    /// Dropped; position is not committed
    Skip,
    /// The hub is gone
    Stop,
}

/// The single read-process-commit loop
pub struct ConsumerWorker {
    consumer: Box<dyn LogConsumer>,
    hub: HubHandle,
    metrics: Arc<RelayMetrics>,
    stage: TransformStage,
    backoff: Backoff,
    shutdown: watch::Receiver<bool>,
}

impl ConsumerWorker {
    pub fn new(
        consumer: Box<dyn LogConsumer>,
        hub: HubHandle,
        metrics: Arc<RelayMetrics>,
        stage: TransformStage,
        backoff: Backoff,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            consumer,
            hub,
            metrics,
            stage,
            backoff,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        info!(stage = ?self.stage, "Consumer started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let polled = tokio::select! {
                _ = self.shutdown.changed() => break,
                polled = self.consumer.poll() => polled,
            };

            let record = match polled {
                Ok(record) => record,
                Err(LogError::Closed) => {
                    info!("Durable log closed");
                    break;
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(error = %e, retry_in = ?delay, "Consumer read failed");
                    if !self.pause(delay).await {
                        break;
                    }
                    continue;
                }
            };
            self.backoff.reset();

            match self.handle(&record).await {
                Outcome::Commit => {
                    if let Err(e) = self.consumer.commit(&record).await {
                        warn!(offset = record.offset, error = %e, "Commit failed");
                    }
                }
                Outcome::Skip => {}
                Outcome::Stop => break,
            }
        }

        info!("Consumer stopped");
    }

    /// Sleep for `delay` unless shutdown arrives first
    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.changed() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn handle(&mut self, record: &LogRecord) -> Outcome {
        let Some(key) = record.key.as_deref() else {
            warn!(
                partition = record.partition,
                offset = record.offset,
                "Skipping record without stream key"
            );
            return Outcome::Skip;
        };
        let stream_id = StreamId::new(key);

        let payload = match self.prepare(&record.payload) {
            Ok(payload) => payload,
            Err(e) => {
                self.metrics.increment_transform_failures(&stream_id);
                warn!(
                    stream_id = %stream_id,
                    offset = record.offset,
                    error = %e,
                    "Skipping record that failed to transform"
                );
                return Outcome::Skip;
            }
        };

        match self.hub.broadcast(StreamMessage::new(stream_id.clone(), payload)).await {
            Ok(report) => {
                self.metrics.record_broadcast(&stream_id, &report);
                debug!(
                    stream_id = %stream_id,
                    offset = record.offset,
                    delivered = report.delivered,
                    evicted = report.evicted,
                    "Record broadcast"
                );
                Outcome::Commit
            }
            Err(HubError::Stopped) => {
                error!("Hub stopped; consumer exiting");
                Outcome::Stop
            }
            Err(e) => {
                warn!(stream_id = %stream_id, error = %e, "Broadcast failed");
                Outcome::Skip
            }
        }
    }

    fn prepare(&self, raw: &Bytes) -> transform::TransformResult<Bytes> {
        match self.stage {
            TransformStage::Consumer => transform::process(raw).map(Bytes::from),
            TransformStage::Ingress => {
                transform::decode_object(raw)?;
                Ok(raw.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable_log::{LogResult, MemoryLog};
    use async_trait::async_trait;
    use serde_json::Value;

    struct Running {
        log: MemoryLog,
        hub: HubHandle,
        metrics: Arc<RelayMetrics>,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<()>,
    }

    async fn start(stage: TransformStage) -> Running {
        let log = MemoryLog::new("t");
        let (hub, _hub_task) = HubHandle::spawn(16);
        let metrics = Arc::new(RelayMetrics::new());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = ConsumerWorker::new(
            Box::new(log.consumer("g")),
            hub.clone(),
            Arc::clone(&metrics),
            stage,
            Backoff::from(&ConsumerConfig::default()),
            shutdown_rx,
        )
        .spawn();

        Running {
            log,
            hub,
            metrics,
            shutdown,
            task,
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_transforms_broadcasts_then_commits() {
        let relay = start(TransformStage::Consumer).await;
        let id = StreamId::new("s");
        relay.hub.create_stream(id.clone()).await.unwrap();
        let mut subscription = relay.hub.register(id).await.unwrap();

        relay
            .log
            .append(Some("s".into()), Bytes::from_static(br#"{"data":"hello"}"#))
            .unwrap();

        let frame = subscription.frames.recv().await.unwrap();
        let value: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(value["data"], "HELLO");
        assert!(value["processed_at"].is_string());

        let log = relay.log.clone();
        wait_for(|| log.committed("g") == Some(1)).await;
        assert_eq!(relay.metrics.snapshot().streams["s"].messages_broadcast, 1);
    }

    #[tokio::test]
    async fn test_malformed_record_is_skipped_without_commit() {
        let relay = start(TransformStage::Consumer).await;
        relay
            .log
            .append(Some("s".into()), Bytes::from_static(b"{broken"))
            .unwrap();

        let metrics = Arc::clone(&relay.metrics);
        wait_for(|| {
            metrics
                .snapshot()
                .streams
                .get("s")
                .is_some_and(|s| s.transform_failures == 1)
        })
        .await;

        relay.shutdown.send(true).unwrap();
        relay.task.await.unwrap();
        assert_eq!(relay.log.committed("g"), None);

        // a restarted consumer in the same group sees the record again
        let mut restarted = relay.log.consumer("g");
        assert_eq!(restarted.poll().await.unwrap().offset, 0);
    }

    #[tokio::test]
    async fn test_loop_survives_bad_records() {
        let relay = start(TransformStage::Consumer).await;
        let id = StreamId::new("s");
        relay.hub.create_stream(id.clone()).await.unwrap();
        let mut subscription = relay.hub.register(id).await.unwrap();

        relay.log.append(None, Bytes::from_static(b"{}")).unwrap();
        relay
            .log
            .append(Some("s".into()), Bytes::from_static(b"[1]"))
            .unwrap();
        relay
            .log
            .append(Some("s".into()), Bytes::from_static(br#"{"n":1}"#))
            .unwrap();

        let frame = subscription.frames.recv().await.unwrap();
        let value: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(value["n"], 1);

        let log = relay.log.clone();
        wait_for(|| log.committed("g") == Some(3)).await;
    }

    #[tokio::test]
    async fn test_ingress_stage_passes_payload_through() {
        let relay = start(TransformStage::Ingress).await;
        let id = StreamId::new("s");
        relay.hub.create_stream(id.clone()).await.unwrap();
        let mut subscription = relay.hub.register(id).await.unwrap();

        let payload = Bytes::from_static(br#"{"data":"ALREADY"}"#);
        relay.log.append(Some("s".into()), payload.clone()).unwrap();

        assert_eq!(subscription.frames.recv().await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_stops_on_shutdown_signal() {
        let relay = start(TransformStage::Consumer).await;
        relay.shutdown.send(true).unwrap();
        relay.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stops_when_hub_stops() {
        let relay = start(TransformStage::Consumer).await;
        relay.hub.shutdown().await.unwrap();
        relay
            .log
            .append(Some("s".into()), Bytes::from_static(b"{}"))
            .unwrap();

        relay.task.await.unwrap();
        assert_eq!(relay.log.committed("g"), None);
    }

    /// Fails every read until `failures` runs out, then reports the log closed
    struct FlakyConsumer {
        failures: usize,
        attempts: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl LogConsumer for FlakyConsumer {
        async fn poll(&mut self) -> LogResult<LogRecord> {
            self.attempts
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if self.failures == 0 {
                return Err(LogError::Closed);
            }
            self.failures -= 1;
            Err(LogError::Broker("connection refused".into()))
        }

        async fn commit(&mut self, _record: &LogRecord) -> LogResult<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_errors_back_off() {
        let (hub, _hub_task) = HubHandle::spawn(4);
        let (_shutdown, shutdown_rx) = watch::channel(false);
        let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let worker = ConsumerWorker::new(
            Box::new(FlakyConsumer {
                failures: 4,
                attempts: Arc::clone(&attempts),
            }),
            hub,
            Arc::new(RelayMetrics::new()),
            TransformStage::Consumer,
            Backoff::new(Duration::from_millis(100), Duration::from_secs(5)),
            shutdown_rx,
        );

        let started = tokio::time::Instant::now();
        worker.run().await;

        // 100 + 200 + 400 + 800 ms of backoff before the fifth read
        assert_eq!(started.elapsed(), Duration::from_millis(1500));
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 5);
    }

    #[test]
    fn test_backoff_doubles_to_cap_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_near_duration_max_does_not_overflow() {
        let mut backoff = Backoff::new(Duration::from_secs(u64::MAX / 2 + 1), Duration::MAX);
        backoff.next_delay();
        assert_eq!(backoff.next_delay(), Duration::MAX);
        assert_eq!(backoff.next_delay(), Duration::MAX);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_run_future_is_send() {
        let (hub, _hub_task) = HubHandle::spawn(4);
        let (_shutdown, shutdown_rx) = watch::channel(false);
        let worker = ConsumerWorker::new(
            Box::new(MemoryLog::new("t").consumer("g")),
            hub,
            Arc::new(RelayMetrics::new()),
            TransformStage::Consumer,
            Backoff::from(&ConsumerConfig::default()),
            shutdown_rx,
        );
        assert_send(&worker.run());
    }
}
