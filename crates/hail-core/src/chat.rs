//! Chat relay: persist, then forward verbatim.

use crate::channel::{channel_name, Hub};
use crate::error::DispatchError;
use crate::gateway::{row, Gateway, Table};
use crate::message::ConnectionId;
use crate::payload::require_text;
use hail_protocol::EventName;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::trace;

/// Persists chat messages and forwards them to the receiving party.
#[derive(Clone)]
pub struct ChatRelay {
    gateway: Arc<dyn Gateway>,
    hub: Hub,
}

impl ChatRelay {
    #[must_use]
    pub fn new(gateway: Arc<dyn Gateway>, hub: Hub) -> Self {
        Self { gateway, hub }
    }

    /// Store a `Send_Chat` message and forward it to the receiver.
    ///
    /// Nothing is forwarded if the store rejects the message.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a missing field and
    /// [`DispatchError::Gateway`] if the insert fails.
    pub async fn relay(&self, source: &ConnectionId, payload: &Value) -> Result<(), DispatchError> {
        let sender = require_text(payload, "sender_id")?;
        let receiver = require_text(payload, "recevier_id")?;
        let message = require_text(payload, "message")?;
        let status = require_text(payload, "status")?;

        self.gateway
            .insert(
                Table::Chat,
                row(json!({
                    "sender_id": sender,
                    "receiver_id": receiver,
                    "message": message,
                    "status": status,
                })),
            )
            .await
            .map_err(|e| DispatchError::gateway("Chat", e))?;

        trace!(sender = %sender, receiver = %receiver, "Chat relayed");
        self.hub.broadcast(
            source,
            channel_name(EventName::SendChat.as_str(), &receiver),
            payload.clone(),
        );
        Ok(())
    }
}
