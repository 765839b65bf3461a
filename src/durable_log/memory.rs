//! In-process durable log
//!
//! A single-partition append-only record list with per-group committed
//! offsets. It survives for the life of the process, which is enough to
//! exercise at-least-once redelivery: a consumer opened for a group starts
//! at that group's committed offset, so anything read but not committed is
//! read again.
//!
//! Offsets are absolute. Records every known group has committed are
//! released, and at most `retention` records are kept regardless; a group
//! left behind by the cap resumes at the oldest retained record.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::{
    Delivery, LogBackend, LogConsumer, LogError, LogProducer, LogRecord, LogResult,
    OutgoingRecord,
};

const PARTITION: i32 = 0;

#[derive(Debug, Default)]
struct LogState {
    records: VecDeque<LogRecord>,
    /// Offset of `records[0]`
    base_offset: i64,
    /// Next offset to read, per consumer group that has committed
    committed: HashMap<String, i64>,
    /// Lowest offset each known group may still read
    low_water: HashMap<String, i64>,
    closed: bool,
}

impl LogState {
    fn next_offset(&self) -> i64 {
        self.base_offset + self.records.len() as i64
    }

    fn get(&self, offset: i64) -> Option<&LogRecord> {
        let index = offset.checked_sub(self.base_offset)?;
        usize::try_from(index).ok().and_then(|i| self.records.get(i))
    }

    /// Drop records below `floor`; returns how many were dropped
    fn release_below(&mut self, floor: i64) -> usize {
        let mut released = 0;
        while self.base_offset < floor && self.records.pop_front().is_some() {
            self.base_offset += 1;
            released += 1;
        }
        released
    }

    fn release_committed(&mut self) -> usize {
        match self.low_water.values().min().copied() {
            Some(floor) => self.release_below(floor),
            None => 0,
        }
    }
}

#[derive(Debug)]
struct Shared {
    topic: String,
    retention: usize,
    state: Mutex<LogState>,
    appended: Notify,
}

/// Handle to an in-process log; clones share the same records
#[derive(Debug, Clone)]
pub struct MemoryLog {
    shared: Arc<Shared>,
}

impl MemoryLog {
    pub fn new(topic: impl Into<String>) -> Self {
        Self::with_retention(topic, usize::MAX)
    }

    /// Log that keeps at most `retention` records
    pub fn with_retention(topic: impl Into<String>, retention: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                topic: topic.into(),
                retention: retention.max(1),
                state: Mutex::new(LogState::default()),
                appended: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn producer(&self) -> MemoryProducer {
        MemoryProducer { log: self.clone() }
    }

    /// Consumer for `group`, positioned at the group's committed offset
    ///
    /// The group is known to the log from here on, so records it has not
    /// committed are kept for it.
    pub fn consumer(&self, group: impl Into<String>) -> MemoryConsumer {
        let group = group.into();
        let position = {
            let mut state = self.state();
            let base = state.base_offset;
            let position = state.committed.get(&group).copied().unwrap_or(base).max(base);
            state.low_water.entry(group.clone()).or_insert(position);
            position
        };
        MemoryConsumer {
            log: self.clone(),
            group,
            position,
        }
    }

    /// Producer and consumer over this log as trait objects
    pub fn backend(&self, group: impl Into<String>) -> LogBackend {
        LogBackend {
            producer: Arc::new(self.producer()),
            consumer: Box::new(self.consumer(group)),
        }
    }

    /// Append a record. A `None` key models a record written by a foreign producer.
    pub fn append(&self, key: Option<String>, payload: Bytes) -> LogResult<Delivery> {
        let delivery = {
            let mut state = self.state();
            if state.closed {
                return Err(LogError::Closed);
            }
            let offset = state.next_offset();
            state.records.push_back(LogRecord {
                topic: self.shared.topic.clone(),
                partition: PARTITION,
                offset,
                key,
                payload,
                timestamp: Utc::now(),
            });

            if state.records.len() > self.shared.retention {
                let floor = state.next_offset() - self.shared.retention as i64;
                let dropped = state.release_below(floor);
                warn!(
                    topic = %self.shared.topic,
                    dropped,
                    "Retention limit reached; oldest records dropped"
                );
            }

            Delivery {
                partition: PARTITION,
                offset,
            }
        };
        self.shared.appended.notify_waiters();
        Ok(delivery)
    }

    /// Next offset `group` will read on a fresh consumer
    pub fn committed(&self, group: &str) -> Option<i64> {
        self.state().committed.get(group).copied()
    }

    /// Number of records currently retained
    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse further appends and wake pending consumers
    pub fn close(&self) {
        self.state().closed = true;
        self.shared.appended.notify_waiters();
    }
}

pub struct MemoryProducer {
    log: MemoryLog,
}

#[async_trait]
impl LogProducer for MemoryProducer {
    async fn produce(&self, record: OutgoingRecord) -> LogResult<Delivery> {
        self.log.append(Some(record.key), record.payload)
    }
}

pub struct MemoryConsumer {
    log: MemoryLog,
    group: String,
    position: i64,
}

impl MemoryConsumer {
    fn next_record(&mut self) -> Option<LogResult<LogRecord>> {
        let state = self.log.state();
        if self.position < state.base_offset {
            warn!(
                group = %self.group,
                from = self.position,
                to = state.base_offset,
                "Records expired before they were read"
            );
            self.position = state.base_offset;
        }
        match state.get(self.position) {
            Some(record) => Some(Ok(record.clone())),
            None if state.closed => Some(Err(LogError::Closed)),
            None => None,
        }
    }
}

#[async_trait]
impl LogConsumer for MemoryConsumer {
    async fn poll(&mut self) -> LogResult<LogRecord> {
        loop {
            // Register interest before checking, so an append in between is not missed
            let shared = Arc::clone(&self.log.shared);
            let appended = shared.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if let Some(next) = self.next_record() {
                let record = next?;
                self.position = record.offset + 1;
                return Ok(record);
            }

            appended.await;
        }
    }

    async fn commit(&mut self, record: &LogRecord) -> LogResult<()> {
        let mut state = self.log.state();
        if record.topic != self.log.shared.topic
            || record.partition != PARTITION
            || record.offset < 0
            || record.offset >= state.next_offset()
        {
            return Err(LogError::Commit {
                topic: record.topic.clone(),
                partition: record.partition,
                offset: record.offset,
                reason: "record does not belong to this log".to_string(),
            });
        }

        let next = record.offset + 1;
        let committed = state.committed.entry(self.group.clone()).or_insert(0);
        *committed = (*committed).max(next);
        let committed = *committed;

        let low_water = state.low_water.entry(self.group.clone()).or_insert(0);
        *low_water = (*low_water).max(committed);

        let released = state.release_committed();
        if released > 0 {
            debug!(group = %self.group, released, "Released committed records");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn outgoing(key: &str, payload: &'static str) -> OutgoingRecord {
        OutgoingRecord {
            key: key.to_string(),
            payload: Bytes::from_static(payload.as_bytes()),
        }
    }

    #[tokio::test]
    async fn test_offsets_are_sequential() {
        let log = MemoryLog::new("t");
        let producer = log.producer();

        let first = producer.produce(outgoing("a", "1")).await.unwrap();
        let second = producer.produce(outgoing("b", "2")).await.unwrap();

        assert_eq!(first, Delivery { partition: 0, offset: 0 });
        assert_eq!(second.offset, 1);
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn test_poll_waits_for_append() {
        let log = MemoryLog::new("t");
        let mut consumer = log.consumer("g");

        let pending = tokio::spawn(async move { consumer.poll().await.unwrap() });
        tokio::time::sleep(Duration::from_millis(10)).await;
        log.append(Some("s".into()), Bytes::from_static(b"{}")).unwrap();

        let record = pending.await.unwrap();
        assert_eq!(record.offset, 0);
        assert_eq!(record.key.as_deref(), Some("s"));
        assert_eq!(record.topic, "t");
    }

    #[tokio::test]
    async fn test_uncommitted_records_are_redelivered_to_group() {
        let log = MemoryLog::new("t");
        for payload in ["a", "b", "c"] {
            log.append(Some("s".into()), Bytes::from(payload)).unwrap();
        }

        let mut consumer = log.consumer("g");
        let mut other = log.consumer("other");
        let first = consumer.poll().await.unwrap();
        consumer.commit(&first).await.unwrap();
        let _second = consumer.poll().await.unwrap();
        drop(consumer);

        assert_eq!(log.committed("g"), Some(1));
        let mut restarted = log.consumer("g");
        assert_eq!(restarted.poll().await.unwrap().payload, Bytes::from("b"));

        // other groups are independent
        assert_eq!(other.poll().await.unwrap().offset, 0);
    }

    #[tokio::test]
    async fn test_records_committed_by_every_group_are_released() {
        let log = MemoryLog::new("t");
        let mut consumer = log.consumer("g");
        for _ in 0..1000 {
            log.append(Some("s".into()), Bytes::from(vec![b'x'; 1024])).unwrap();
        }

        for _ in 0..1000 {
            let record = consumer.poll().await.unwrap();
            consumer.commit(&record).await.unwrap();
        }

        assert_eq!(log.committed("g"), Some(1000));
        assert!(log.is_empty());

        // offsets keep counting from where they were
        let delivery = log.append(Some("s".into()), Bytes::from("next")).unwrap();
        assert_eq!(delivery.offset, 1000);
        assert_eq!(consumer.poll().await.unwrap().offset, 1000);
    }

    #[tokio::test]
    async fn test_lagging_group_holds_records() {
        let log = MemoryLog::new("t");
        let mut fast = log.consumer("fast");
        let mut slow = log.consumer("slow");
        for payload in ["a", "b", "c"] {
            log.append(Some("s".into()), Bytes::from(payload)).unwrap();
        }

        for _ in 0..3 {
            let record = fast.poll().await.unwrap();
            fast.commit(&record).await.unwrap();
        }
        assert_eq!(log.len(), 3);

        let first = slow.poll().await.unwrap();
        slow.commit(&first).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(slow.poll().await.unwrap().payload, Bytes::from("b"));
    }

    #[tokio::test]
    async fn test_retention_caps_records_and_skips_lagging_consumer_ahead() {
        let log = MemoryLog::with_retention("t", 2);
        let mut consumer = log.consumer("g");
        for payload in ["a", "b", "c", "d"] {
            log.append(Some("s".into()), Bytes::from(payload)).unwrap();
        }

        assert_eq!(log.len(), 2);
        let record = consumer.poll().await.unwrap();
        assert_eq!(record.offset, 2);
        assert_eq!(record.payload, Bytes::from("c"));
    }

    #[tokio::test]
    async fn test_commit_never_moves_backwards() {
        let log = MemoryLog::new("t");
        log.append(Some("s".into()), Bytes::from("a")).unwrap();
        log.append(Some("s".into()), Bytes::from("b")).unwrap();

        let mut consumer = log.consumer("g");
        let first = consumer.poll().await.unwrap();
        let second = consumer.poll().await.unwrap();
        consumer.commit(&second).await.unwrap();
        consumer.commit(&first).await.unwrap();

        assert_eq!(log.committed("g"), Some(2));
    }

    #[tokio::test]
    async fn test_commit_rejects_foreign_record() {
        let log = MemoryLog::new("t");
        let mut consumer = log.consumer("g");
        let foreign = LogRecord {
            topic: "elsewhere".into(),
            partition: 0,
            offset: 0,
            key: None,
            payload: Bytes::new(),
            timestamp: Utc::now(),
        };

        assert!(matches!(
            consumer.commit(&foreign).await,
            Err(LogError::Commit { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_wakes_consumer_and_rejects_appends() {
        let log = MemoryLog::new("t");
        let mut consumer = log.consumer("g");

        let pending = tokio::spawn(async move { consumer.poll().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        log.close();

        assert!(matches!(pending.await.unwrap(), Err(LogError::Closed)));
        assert!(matches!(
            log.append(Some("s".into()), Bytes::new()),
            Err(LogError::Closed)
        ));
    }
}
