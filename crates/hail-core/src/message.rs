//! Emitted message envelopes and connection identifiers.

use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A unique message identifier.
pub type MessageId = u64;

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    ID_COUNTER.fetch_add(1, Ordering::Relaxed) + 1
}

/// Opaque identifier of a live connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Arc<str>);

impl ConnectionId {
    #[must_use]
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// Generate a connection ID of the form `<millis>-<counter>`.
    #[must_use]
    pub fn generate() -> Self {
        let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self::new(format!("{}-{:x}", now_millis(), counter))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

/// A message emitted on a channel.
#[derive(Debug, Clone)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Connection the message was emitted on behalf of.
    ///
    /// Broadcasts are never delivered back to their source.
    pub source: Option<ConnectionId>,
    /// Target channel (`<event><entity-id>`).
    pub channel: String,
    /// JSON payload, shared between all recipients.
    pub payload: Arc<Value>,
    /// Creation time in milliseconds since the epoch.
    pub timestamp: u64,
}

impl Message {
    #[must_use]
    pub fn new(channel: impl Into<String>, payload: Value) -> Self {
        Self {
            id: generate_message_id(),
            source: None,
            channel: channel.into(),
            payload: Arc::new(payload),
            timestamp: now_millis(),
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: ConnectionId) -> Self {
        self.source = Some(source);
        self
    }

    /// Whether this message should be delivered to `connection`.
    #[must_use]
    pub fn is_visible_to(&self, connection: &ConnectionId) -> bool {
        self.source.as_ref() != Some(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_visibility() {
        let me = ConnectionId::new("a");
        let other = ConnectionId::new("b");
        let msg = Message::new("home", json!({})).with_source(me.clone());

        assert!(!msg.is_visible_to(&me));
        assert!(msg.is_visible_to(&other));
        assert!(Message::new("home", json!({})).is_visible_to(&me));
    }

    #[test]
    fn test_unique_ids() {
        assert_ne!(generate_message_id(), generate_message_id());
        assert_ne!(ConnectionId::generate(), ConnectionId::generate());
    }
}
