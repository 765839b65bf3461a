//! streamrelay - durable real-time stream relay
//!
//! Clients create streams, push JSON payloads into them over HTTP, and
//! watch them over WebSockets. Payloads pass through a durable log before
//! they are fanned out, so a relay restart redelivers what was not yet
//! broadcast.
//!
//! ```text
//! POST /stream/:id/send ─► admission ─► auth ─► transform ─► Producer ─► durable log
//!                                                                          │
//! WebSocket subscribers ◄─ hub ◄─ transform ◄─ ConsumerWorker ◄────────────┘
//! ```

pub mod auth;
pub mod cli;
pub mod config;
pub mod context;
pub mod durable_log;
pub mod http_server;
pub mod hub;
pub mod observability;
pub mod ratelimit;
pub mod transform;

pub use context::Relay;
