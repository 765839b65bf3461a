//! # Stream Hub
//!
//! Live subscriber membership and fan-out.
//!
//! ```text
//!   consumer ──► HubHandle::broadcast ──► [hub actor] ──try_send──► queue ──► delivery task ──► socket
//!                                            ▲                                                    │
//!   ingress  ──► create_stream / exists ─────┤                                                    │
//!   upgrade  ──► register ───────────────────┤                                                    │
//!   liveness ──► unregister ─────────────────┘ ◄──────────────── pong / read error ◄──────────────┘
//! ```

mod connection;
mod errors;
mod message;
mod registry;

pub use connection::{ConnectionTasks, ConnectionTimings, SubscriberConnection};
pub use errors::{HubError, HubResult};
pub use message::{ConnectionId, StreamId, StreamMessage};
pub use registry::{BroadcastReport, HubHandle, HubStats, Subscription};
