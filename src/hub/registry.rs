//! # Stream Registry & Broadcast Hub
//!
//! One actor task owns the stream → subscribers table exclusively. Every
//! operation (create, lookup, register, unregister, broadcast) is a message
//! in its ordered mailbox, so membership changes and fan-out are indivisible
//! with respect to each other without any lock.
//!
//! ## Backpressure
//! Delivery uses `try_send` on each subscriber's bounded queue. A subscriber
//! whose queue is full is evicted on the spot and broadcasting continues with
//! the others; the hub never waits on a slow consumer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::errors::{HubError, HubResult};
use super::message::{ConnectionId, StreamId, StreamMessage};

/// Receiving side of a registered subscriber
///
/// Dropping it (or the hub unregistering the connection) closes the queue.
#[derive(Debug)]
pub struct Subscription {
    pub id: ConnectionId,
    pub stream_id: StreamId,
    pub frames: mpsc::Receiver<Bytes>,
}

/// Outcome of a single broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    /// Subscribers whose queue accepted the payload
    pub delivered: usize,
    /// Subscribers dropped because their queue was full
    pub evicted: usize,
    /// Subscribers found already gone (receiver dropped)
    pub closed: usize,
}

/// Point-in-time view of the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub streams: usize,
    pub subscribers: usize,
}

enum HubCommand {
    CreateStream {
        stream_id: StreamId,
        reply: oneshot::Sender<bool>,
    },
    StreamExists {
        stream_id: StreamId,
        reply: oneshot::Sender<bool>,
    },
    Register {
        stream_id: StreamId,
        id: ConnectionId,
        queue: mpsc::Sender<Bytes>,
        reply: oneshot::Sender<HubResult<()>>,
    },
    Unregister {
        stream_id: StreamId,
        id: ConnectionId,
        reply: oneshot::Sender<bool>,
    },
    Broadcast {
        message: StreamMessage,
        reply: oneshot::Sender<BroadcastReport>,
    },
    SubscriberCount {
        stream_id: StreamId,
        reply: oneshot::Sender<usize>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
    PruneIdle {
        max_idle: Duration,
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct StreamEntry {
    subscribers: HashMap<ConnectionId, mpsc::Sender<Bytes>>,
    last_active: Instant,
}

impl StreamEntry {
    fn new() -> Self {
        Self {
            subscribers: HashMap::new(),
            last_active: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_active = Instant::now();
    }
}

/// The actor owning the membership table
struct HubActor {
    streams: HashMap<StreamId, StreamEntry>,
    mailbox: mpsc::UnboundedReceiver<HubCommand>,
}

impl HubActor {
    async fn run(mut self) {
        info!("Hub started");

        while let Some(command) = self.mailbox.recv().await {
            match command {
                HubCommand::CreateStream { stream_id, reply } => {
                    let _ = reply.send(self.create_stream(stream_id));
                }
                HubCommand::StreamExists { stream_id, reply } => {
                    let _ = reply.send(self.streams.contains_key(&stream_id));
                }
                HubCommand::Register {
                    stream_id,
                    id,
                    queue,
                    reply,
                } => {
                    let _ = reply.send(self.register(stream_id, id, queue));
                }
                HubCommand::Unregister {
                    stream_id,
                    id,
                    reply,
                } => {
                    let _ = reply.send(self.unregister(&stream_id, id));
                }
                HubCommand::Broadcast { message, reply } => {
                    let _ = reply.send(self.broadcast(message));
                }
                HubCommand::SubscriberCount { stream_id, reply } => {
                    let count = self
                        .streams
                        .get(&stream_id)
                        .map(|entry| entry.subscribers.len())
                        .unwrap_or(0);
                    let _ = reply.send(count);
                }
                HubCommand::Stats { reply } => {
                    let _ = reply.send(self.stats());
                }
                HubCommand::PruneIdle { max_idle, reply } => {
                    let _ = reply.send(self.prune_idle(max_idle));
                }
                HubCommand::Shutdown { reply } => {
                    self.close_all();
                    let _ = reply.send(());
                    break;
                }
            }
        }

        self.close_all();
        info!("Hub stopped");
    }

    fn create_stream(&mut self, stream_id: StreamId) -> bool {
        if self.streams.contains_key(&stream_id) {
            return false;
        }
        debug!(stream_id = %stream_id, "Stream created");
        self.streams.insert(stream_id, StreamEntry::new());
        true
    }

    fn register(
        &mut self,
        stream_id: StreamId,
        id: ConnectionId,
        queue: mpsc::Sender<Bytes>,
    ) -> HubResult<()> {
        let entry = self
            .streams
            .get_mut(&stream_id)
            .ok_or_else(|| HubError::StreamNotFound(stream_id.clone()))?;
        entry.subscribers.insert(id, queue);
        entry.touch();
        info!(stream_id = %stream_id, connection_id = %id, "Subscriber registered");
        Ok(())
    }

    /// Removing the sender closes the subscriber's queue. Returns false when
    /// the connection was not (or no longer) registered.
    fn unregister(&mut self, stream_id: &StreamId, id: ConnectionId) -> bool {
        let Some(entry) = self.streams.get_mut(stream_id) else {
            return false;
        };
        let removed = entry.subscribers.remove(&id).is_some();
        if removed {
            entry.touch();
            info!(stream_id = %stream_id, connection_id = %id, "Subscriber unregistered");
        }
        removed
    }

    fn broadcast(&mut self, message: StreamMessage) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        // A missing entry and an empty entry both mean "no subscribers".
        let Some(entry) = self.streams.get_mut(&message.stream_id) else {
            return report;
        };
        entry.touch();

        let mut dropped = Vec::new();
        for (id, queue) in &entry.subscribers {
            match queue.try_send(message.payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    report.evicted += 1;
                    dropped.push(*id);
                    warn!(
                        stream_id = %message.stream_id,
                        connection_id = %id,
                        "Subscriber evicted: outbound queue full"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    report.closed += 1;
                    dropped.push(*id);
                }
            }
        }
        for id in dropped {
            entry.subscribers.remove(&id);
        }

        debug!(
            stream_id = %message.stream_id,
            delivered = report.delivered,
            evicted = report.evicted,
            "Broadcast complete"
        );
        report
    }

    fn stats(&self) -> HubStats {
        HubStats {
            streams: self.streams.len(),
            subscribers: self.streams.values().map(|e| e.subscribers.len()).sum(),
        }
    }

    fn prune_idle(&mut self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.streams.len();
        self.streams.retain(|_, entry| {
            !entry.subscribers.is_empty() || now.duration_since(entry.last_active) < max_idle
        });
        let pruned = before - self.streams.len();
        if pruned > 0 {
            info!(pruned, "Pruned idle streams");
        }
        pruned
    }

    fn close_all(&mut self) {
        for entry in self.streams.values_mut() {
            entry.subscribers.clear();
        }
    }
}

/// Clonable client of the hub actor
#[derive(Clone)]
pub struct HubHandle {
    mailbox: mpsc::UnboundedSender<HubCommand>,
    next_connection: Arc<AtomicU64>,
    queue_capacity: usize,
}

impl HubHandle {
    /// Spawn the hub actor on the current runtime
    ///
    /// `queue_capacity` is the default outbound queue size of subscribers.
    pub fn spawn(queue_capacity: usize) -> (Self, JoinHandle<()>) {
        let (mailbox, rx) = mpsc::unbounded_channel();
        let actor = HubActor {
            streams: HashMap::new(),
            mailbox: rx,
        };
        let task = tokio::spawn(actor.run());

        let handle = Self {
            mailbox,
            next_connection: Arc::new(AtomicU64::new(1)),
            queue_capacity: queue_capacity.max(1),
        };
        (handle, task)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> HubCommand,
    ) -> HubResult<T> {
        let (reply, rx) = oneshot::channel();
        self.mailbox
            .send(build(reply))
            .map_err(|_| HubError::Stopped)?;
        rx.await.map_err(|_| HubError::Stopped)
    }

    /// Ensure an entry exists for `stream_id`. Returns true if it was new.
    pub async fn create_stream(&self, stream_id: StreamId) -> HubResult<bool> {
        self.request(|reply| HubCommand::CreateStream { stream_id, reply })
            .await
    }

    pub async fn stream_exists(&self, stream_id: &StreamId) -> HubResult<bool> {
        let stream_id = stream_id.clone();
        self.request(|reply| HubCommand::StreamExists { stream_id, reply })
            .await
    }

    /// Register a new subscriber with the default queue capacity
    pub async fn register(&self, stream_id: StreamId) -> HubResult<Subscription> {
        self.register_with_capacity(stream_id, self.queue_capacity)
            .await
    }

    pub async fn register_with_capacity(
        &self,
        stream_id: StreamId,
        capacity: usize,
    ) -> HubResult<Subscription> {
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let (queue, frames) = mpsc::channel(capacity.max(1));

        let target = stream_id.clone();
        self.request(|reply| HubCommand::Register {
            stream_id: target,
            id,
            queue,
            reply,
        })
        .await??;

        Ok(Subscription {
            id,
            stream_id,
            frames,
        })
    }

    /// Remove a subscriber and close its queue. Idempotent.
    pub async fn unregister(&self, stream_id: &StreamId, id: ConnectionId) -> HubResult<bool> {
        let stream_id = stream_id.clone();
        self.request(|reply| HubCommand::Unregister {
            stream_id,
            id,
            reply,
        })
        .await
    }

    /// Fan a message out to every subscriber registered at invocation time
    pub async fn broadcast(&self, message: StreamMessage) -> HubResult<BroadcastReport> {
        self.request(|reply| HubCommand::Broadcast { message, reply })
            .await
    }

    pub async fn subscriber_count(&self, stream_id: &StreamId) -> HubResult<usize> {
        let stream_id = stream_id.clone();
        self.request(|reply| HubCommand::SubscriberCount { stream_id, reply })
            .await
    }

    pub async fn stats(&self) -> HubResult<HubStats> {
        self.request(|reply| HubCommand::Stats { reply }).await
    }

    /// Drop streams without subscribers that saw no activity for `max_idle`
    pub async fn prune_idle(&self, max_idle: Duration) -> HubResult<usize> {
        self.request(|reply| HubCommand::PruneIdle { max_idle, reply })
            .await
    }

    /// Close every subscriber queue and stop the actor
    pub async fn shutdown(&self) -> HubResult<()> {
        self.request(|reply| HubCommand::Shutdown { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(stream: &str, payload: &'static str) -> StreamMessage {
        StreamMessage::new(StreamId::new(stream), Bytes::from_static(payload.as_bytes()))
    }

    #[tokio::test]
    async fn test_create_stream_is_idempotent() {
        let (hub, _task) = HubHandle::spawn(8);
        let id = StreamId::new("s-1");

        assert!(hub.create_stream(id.clone()).await.unwrap());
        assert!(!hub.create_stream(id.clone()).await.unwrap());
        assert!(hub.stream_exists(&id).await.unwrap());
        assert!(!hub.stream_exists(&StreamId::new("s-2")).await.unwrap());
    }

    #[tokio::test]
    async fn test_register_unknown_stream_fails() {
        let (hub, _task) = HubHandle::spawn(8);
        let err = hub.register(StreamId::new("nope")).await.unwrap_err();
        assert!(matches!(err, HubError::StreamNotFound(_)));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_only_matching_stream() {
        let (hub, _task) = HubHandle::spawn(8);
        hub.create_stream(StreamId::new("a")).await.unwrap();
        hub.create_stream(StreamId::new("b")).await.unwrap();

        let mut sub_a = hub.register(StreamId::new("a")).await.unwrap();
        let mut sub_b = hub.register(StreamId::new("b")).await.unwrap();

        let report = hub.broadcast(message("a", "hello")).await.unwrap();
        assert_eq!(report.delivered, 1);

        assert_eq!(sub_a.frames.recv().await.unwrap(), Bytes::from_static(b"hello"));
        assert!(sub_b.frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_to_missing_or_empty_stream_is_noop() {
        let (hub, _task) = HubHandle::spawn(8);
        hub.create_stream(StreamId::new("empty")).await.unwrap();

        let empty = hub.broadcast(message("empty", "x")).await.unwrap();
        let missing = hub.broadcast(message("missing", "x")).await.unwrap();
        assert_eq!(empty, BroadcastReport::default());
        assert_eq!(missing, BroadcastReport::default());
    }

    #[tokio::test]
    async fn test_full_queue_is_evicted_others_still_served() {
        let (hub, _task) = HubHandle::spawn(8);
        let id = StreamId::new("s");
        hub.create_stream(id.clone()).await.unwrap();

        let mut slow = hub.register_with_capacity(id.clone(), 1).await.unwrap();
        let mut fast = hub.register_with_capacity(id.clone(), 8).await.unwrap();

        let first = hub.broadcast(message("s", "one")).await.unwrap();
        assert_eq!(first.delivered, 2);

        // slow never drains, so its single slot is still occupied
        let second = hub.broadcast(message("s", "two")).await.unwrap();
        assert_eq!(second.delivered, 1);
        assert_eq!(second.evicted, 1);
        assert_eq!(hub.subscriber_count(&id).await.unwrap(), 1);

        assert_eq!(fast.frames.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(fast.frames.recv().await.unwrap(), Bytes::from_static(b"two"));

        // the evicted queue yields what it had, then reports closed
        assert_eq!(slow.frames.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert!(slow.frames.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent_and_closes_queue() {
        let (hub, _task) = HubHandle::spawn(8);
        let id = StreamId::new("s");
        hub.create_stream(id.clone()).await.unwrap();

        let mut sub = hub.register(id.clone()).await.unwrap();
        assert!(hub.unregister(&id, sub.id).await.unwrap());
        assert!(!hub.unregister(&id, sub.id).await.unwrap());
        assert!(sub.frames.recv().await.is_none());

        // the entry stays valid once empty
        assert!(hub.stream_exists(&id).await.unwrap());
        assert_eq!(hub.subscriber_count(&id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_cleaned_on_broadcast() {
        let (hub, _task) = HubHandle::spawn(8);
        let id = StreamId::new("s");
        hub.create_stream(id.clone()).await.unwrap();

        let sub = hub.register(id.clone()).await.unwrap();
        drop(sub);

        let report = hub.broadcast(message("s", "x")).await.unwrap();
        assert_eq!(report.closed, 1);
        assert_eq!(hub.subscriber_count(&id).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_idle_keeps_active_streams() {
        let (hub, _task) = HubHandle::spawn(8);
        hub.create_stream(StreamId::new("idle")).await.unwrap();
        hub.create_stream(StreamId::new("watched")).await.unwrap();
        let _sub = hub.register(StreamId::new("watched")).await.unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;

        assert_eq!(hub.prune_idle(Duration::from_secs(60)).await.unwrap(), 1);
        assert!(!hub.stream_exists(&StreamId::new("idle")).await.unwrap());
        assert!(hub.stream_exists(&StreamId::new("watched")).await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_closes_subscribers() {
        let (hub, task) = HubHandle::spawn(8);
        let id = StreamId::new("s");
        hub.create_stream(id.clone()).await.unwrap();
        let mut sub = hub.register(id.clone()).await.unwrap();

        hub.shutdown().await.unwrap();
        task.await.unwrap();

        assert!(sub.frames.recv().await.is_none());
        assert!(matches!(hub.stream_exists(&id).await, Err(HubError::Stopped)));
    }
}
