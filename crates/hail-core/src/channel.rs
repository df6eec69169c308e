//! Channel addressing and the broadcast hub.
//!
//! A channel is nothing more than a name: the event (or outbound prefix)
//! followed by the id of the entity that should listen, e.g.
//! `Vehicle_Bidding42`. There is no subscription list on the server. Every
//! broadcast reaches every connection except its source and clients pick out
//! the names that end with their own id.

use crate::message::{ConnectionId, Message};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// Default hub capacity.
pub const DEFAULT_HUB_CAPACITY: usize = 4096;

/// Build the channel name for `entity_id` listening on `prefix`.
#[must_use]
pub fn channel_name(prefix: &str, entity_id: &str) -> String {
    let mut name = String::with_capacity(prefix.len() + entity_id.len());
    name.push_str(prefix);
    name.push_str(entity_id);
    name
}

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if name.chars().any(char::is_control) {
        return Err("Channel name contains control characters");
    }
    Ok(())
}

/// Process-wide broadcast fabric.
///
/// Cloning is cheap; all clones publish into the same fabric.
#[derive(Debug, Clone)]
pub struct Hub {
    sender: broadcast::Sender<Arc<Message>>,
}

impl Hub {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HUB_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Receive every message published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Message>> {
        self.sender.subscribe()
    }

    /// Publish a message.
    ///
    /// Returns the number of receivers that were handed the message.
    pub fn publish(&self, message: Message) -> usize {
        if let Err(reason) = validate_channel_name(&message.channel) {
            warn!(channel = %message.channel, reason, "Dropping message on invalid channel");
            return 0;
        }
        trace!(channel = %message.channel, "Publishing message");
        self.sender.send(Arc::new(message)).unwrap_or_default()
    }

    /// Broadcast `payload` on `channel` to everyone but `source`.
    pub fn broadcast(
        &self,
        source: &ConnectionId,
        channel: impl Into<String>,
        payload: Value,
    ) -> usize {
        self.publish(Message::new(channel, payload).with_source(source.clone()))
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_channel_name_concatenates() {
        assert_eq!(channel_name("Vehicle_Bidding", "42"), "Vehicle_Bidding42");
        assert_eq!(channel_name("V_homemap", ""), "V_homemap");
    }

    #[test]
    fn test_channel_name_validation() {
        assert!(validate_channel_name("Send_Chat17").is_ok());
        assert!(validate_channel_name("").is_err());
        assert!(validate_channel_name("bad\nname").is_err());

        let long_name = "a".repeat(MAX_CHANNEL_NAME_LENGTH + 1);
        assert!(validate_channel_name(&long_name).is_err());
    }

    #[tokio::test]
    async fn test_hub_broadcast_carries_source() {
        let hub = Hub::new();
        let mut rx = hub.subscribe();
        let source = ConnectionId::new("conn-1");

        let count = hub.broadcast(&source, "home", json!({"x": 1}));
        assert_eq!(count, 1);

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.channel, "home");
        assert_eq!(msg.source.as_ref(), Some(&source));
        assert_eq!(msg.payload["x"], 1);
    }

    #[test]
    fn test_publish_rejects_invalid_channel() {
        let hub = Hub::new();
        let _rx = hub.subscribe();
        assert_eq!(hub.publish(Message::new("", json!({}))), 0);
    }

    #[test]
    fn test_publish_without_receivers() {
        let hub = Hub::with_capacity(4);
        assert_eq!(hub.publish(Message::new("home", json!(null))), 0);
    }
}
