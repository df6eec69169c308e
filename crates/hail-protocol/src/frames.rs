//! Frame types for the hail protocol.
//!
//! Frames are the fundamental unit of communication between clients and the
//! dispatch engine. Every application message is an `event` frame carrying a
//! named event and a JSON payload; the remaining frames handle acknowledgments,
//! errors and liveness.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Event = 0x01,
    Ack = 0x02,
    Error = 0x03,
    Ping = 0x04,
    Pong = 0x05,
    Connected = 0x06,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Event),
            0x02 => Ok(FrameType::Ack),
            0x03 => Ok(FrameType::Error),
            0x04 => Ok(FrameType::Ping),
            0x05 => Ok(FrameType::Pong),
            0x06 => Ok(FrameType::Connected),
            _ => Err("Invalid frame type"),
        }
    }
}

/// Error codes carried by [`Frame::Error`].
pub mod codes {
    /// The frame could not be decoded.
    pub const MALFORMED_FRAME: u16 = 1001;
    /// The frame type is not accepted from clients.
    pub const UNEXPECTED_FRAME: u16 = 1002;
    /// The server is at its connection ceiling.
    pub const CAPACITY_EXCEEDED: u16 = 1003;
    /// The long-poll session does not exist.
    pub const UNKNOWN_SESSION: u16 = 1004;
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// A named event, inbound from a client or outbound on a channel.
    ///
    /// Outbound frames carry the channel name (`<event><entity-id>`) in
    /// `event`; clients listen on the names that end with their own id.
    #[serde(rename = "event")]
    Event {
        /// Optional request ID for acknowledgment.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Event or channel name.
        event: String,
        /// Event payload.
        #[serde(default)]
        data: Value,
    },

    /// Acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack {
        /// ID of the acknowledged request.
        id: u64,
    },

    /// Transport-level error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code.
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Connection established response.
    #[serde(rename = "connected")]
    Connected {
        /// Unique connection identifier.
        connection_id: String,
        /// Negotiated protocol version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Event { .. } => FrameType::Event,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::Connected { .. } => FrameType::Connected,
        }
    }

    /// Create a new Event frame.
    #[must_use]
    pub fn event(event: impl Into<String>, data: Value) -> Self {
        Frame::Event {
            id: None,
            event: event.into(),
            data,
        }
    }

    /// Create a new Event frame with ID for acknowledgment.
    #[must_use]
    pub fn event_with_ack(id: u64, event: impl Into<String>, data: Value) -> Self {
        Frame::Event {
            id: Some(id),
            event: event.into(),
            data,
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Ping frame with timestamp.
    #[must_use]
    pub fn ping_with_timestamp(timestamp: u64) -> Self {
        Frame::Ping {
            timestamp: Some(timestamp),
        }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, version: u8, heartbeat: u32) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version,
            heartbeat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_type() {
        let event = Frame::event("homemap", json!({"uid": "7"}));
        assert_eq!(event.frame_type(), FrameType::Event);

        assert_eq!(Frame::ack(3).frame_type(), FrameType::Ack);
        assert_eq!(Frame::ping().frame_type(), FrameType::Ping);
    }

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::try_from(0x01), Ok(FrameType::Event));
        assert_eq!(FrameType::try_from(0x06), Ok(FrameType::Connected));
        assert!(FrameType::try_from(0x07).is_err());
    }

    #[test]
    fn test_event_frame_json_shape() {
        let frame = Frame::event("Send_Chat", json!({"message": "hi"}));
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["event"], "Send_Chat");
        assert_eq!(value["data"]["message"], "hi");
        assert!(value.get("id").is_none());
    }

    #[test]
    fn test_event_frame_without_data() {
        let frame: Frame = serde_json::from_str(r#"{"type":"event","event":"home"}"#).unwrap();
        assert_eq!(frame, Frame::event("home", Value::Null));
    }
}
