//! # Subscriber Connection
//!
//! Each WebSocket subscriber runs two cooperating tasks:
//!
//! - **delivery** drains the connection's outbound queue into the socket and
//!   sends a ping every probe period. When the hub closes the queue it sends
//!   a close frame and stops. A failed or timed-out write also stops it.
//! - **liveness** reads inbound frames only to observe pings/pongs, which
//!   push the read deadline forward. Deadline expiry or a read error
//!   unregisters the connection from the hub.
//!
//! The tasks share no mutable state. Delivery learns about termination via
//! its queue closing; liveness learns about it via a `watch` flag that
//! delivery raises on exit.

use std::fmt;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::message::{ConnectionId, StreamId};
use super::registry::{HubHandle, Subscription};
use crate::config::ConnectionConfig;

/// Timing constants of one connection
#[derive(Debug, Clone, Copy)]
pub struct ConnectionTimings {
    pub read_timeout: Duration,
    pub probe_period: Duration,
    pub write_timeout: Duration,
}

impl From<&ConnectionConfig> for ConnectionTimings {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            read_timeout: config.read_timeout(),
            probe_period: config.probe_period(),
            write_timeout: config.write_timeout(),
        }
    }
}

/// Join handles of a running connection
pub struct ConnectionTasks {
    pub delivery: JoinHandle<()>,
    pub liveness: JoinHandle<()>,
}

impl ConnectionTasks {
    /// Wait for both tasks to finish
    pub async fn join(self) {
        let _ = self.delivery.await;
        let _ = self.liveness.await;
    }
}

/// A registered subscriber, ready to be attached to a transport
pub struct SubscriberConnection {
    hub: HubHandle,
    subscription: Subscription,
    timings: ConnectionTimings,
}

impl SubscriberConnection {
    pub fn new(hub: HubHandle, subscription: Subscription, timings: ConnectionTimings) -> Self {
        Self {
            hub,
            subscription,
            timings,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.subscription.id
    }

    /// Attach to an upgraded WebSocket
    pub fn spawn(self, socket: WebSocket) -> ConnectionTasks {
        let (sink, stream) = socket.split();
        self.spawn_with(sink, stream)
    }

    /// Attach to any message sink/stream pair
    pub fn spawn_with<S, R, E>(self, sink: S, stream: R) -> ConnectionTasks
    where
        S: Sink<Message> + Send + Unpin + 'static,
        S::Error: fmt::Display + Send,
        R: Stream<Item = Result<Message, E>> + Send + Unpin + 'static,
        E: fmt::Display + Send + 'static,
    {
        let Subscription {
            id,
            stream_id,
            frames,
        } = self.subscription;
        let (done_tx, done_rx) = watch::channel(false);

        let delivery = tokio::spawn(deliver(
            sink,
            frames,
            self.timings,
            done_tx,
            id,
            stream_id.clone(),
        ));
        let liveness = tokio::spawn(watch_liveness(
            stream,
            self.hub,
            self.timings.read_timeout,
            done_rx,
            id,
            stream_id,
        ));

        ConnectionTasks { delivery, liveness }
    }
}

/// Payloads are JSON, so they normally go out as text frames
fn data_frame(payload: Bytes) -> Message {
    match String::from_utf8(payload.to_vec()) {
        Ok(text) => Message::Text(text),
        Err(e) => Message::Binary(e.into_bytes()),
    }
}

async fn write<S>(sink: &mut S, message: Message, timeout: Duration) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    match tokio::time::timeout(timeout, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("write timed out after {:?}", timeout)),
    }
}

async fn deliver<S>(
    mut sink: S,
    mut frames: mpsc::Receiver<Bytes>,
    timings: ConnectionTimings,
    done: watch::Sender<bool>,
    id: ConnectionId,
    stream_id: StreamId,
) where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let mut probe =
        tokio::time::interval_at(Instant::now() + timings.probe_period, timings.probe_period);

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(payload) => {
                    if let Err(reason) = write(&mut sink, data_frame(payload), timings.write_timeout).await {
                        warn!(stream_id = %stream_id, connection_id = %id, error = %reason, "Delivery failed");
                        break;
                    }
                }
                None => {
                    // Queue closed by the hub: unregistered, evicted or shutting down
                    let _ = write(&mut sink, Message::Close(None), timings.write_timeout).await;
                    debug!(stream_id = %stream_id, connection_id = %id, "Outbound queue closed");
                    break;
                }
            },
            _ = probe.tick() => {
                if let Err(reason) = write(&mut sink, Message::Ping(Vec::new()), timings.write_timeout).await {
                    warn!(stream_id = %stream_id, connection_id = %id, error = %reason, "Probe failed");
                    break;
                }
            }
        }
    }

    let _ = tokio::time::timeout(timings.write_timeout, sink.close()).await;
    let _ = done.send(true);
}

async fn watch_liveness<R, E>(
    mut stream: R,
    hub: HubHandle,
    read_timeout: Duration,
    mut done: watch::Receiver<bool>,
    id: ConnectionId,
    stream_id: StreamId,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    let mut deadline = Instant::now() + read_timeout;

    loop {
        tokio::select! {
            _ = done.changed() => break,
            next = tokio::time::timeout_at(deadline, stream.next()) => match next {
                Err(_) => {
                    info!(stream_id = %stream_id, connection_id = %id, "Liveness deadline expired");
                    break;
                }
                Ok(None) | Ok(Some(Ok(Message::Close(_)))) => {
                    debug!(stream_id = %stream_id, connection_id = %id, "Closed by peer");
                    break;
                }
                Ok(Some(Err(e))) => {
                    warn!(stream_id = %stream_id, connection_id = %id, error = %e, "Read failed");
                    break;
                }
                Ok(Some(Ok(Message::Pong(_) | Message::Ping(_)))) => {
                    deadline = Instant::now() + read_timeout;
                }
                // application data carries no meaning on this connection
                Ok(Some(Ok(_))) => {}
            },
        }
    }

    let _ = hub.unregister(&stream_id, id).await;
}
