//! Stream identifiers and the messages routed through the hub.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier of a stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    /// Wrap an existing identifier (e.g. a path segment or a log key)
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh, globally unique identifier
    pub fn generate() -> Self {
        Self(format!("stream-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for StreamId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of one subscriber connection, unique within a hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A processed payload on its way to the subscribers of one stream
///
/// Cheap to clone: the payload is reference counted, so every subscriber
/// queue shares the same allocation.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub stream_id: StreamId,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl StreamMessage {
    pub fn new(stream_id: StreamId, payload: impl Into<Bytes>) -> Self {
        Self {
            stream_id,
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generated_ids_are_distinct() {
        let ids: HashSet<StreamId> = (0..1000).map(|_| StreamId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_stream_id_serializes_as_plain_string() {
        let id = StreamId::new("s-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"s-1\"");
        assert_eq!(id.to_string(), "s-1");
    }
}
