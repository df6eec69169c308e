//! # hail-protocol
//!
//! Wire protocol and event contract for the hail dispatch engine.
//!
//! ## Frame Types
//!
//! - `Event` - Named event with a JSON payload (both directions)
//! - `Ack` / `Error` - Acknowledgments and transport errors
//! - `Ping` / `Pong` - Heartbeat
//! - `Connected` - Handshake response
//!
//! ## Example
//!
//! ```rust
//! use hail_protocol::{codec, Frame};
//! use serde_json::json;
//!
//! let frame = Frame::event("homemap", json!({"uid": "12", "lat": 24.7, "long": 46.6, "status": "on"}));
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod events;
pub mod frames;
pub mod version;

pub use codec::{decode, decode_text, encode, encode_text, ProtocolError};
pub use events::{EventName, UnknownEvent};
pub use frames::{codes, Frame, FrameType};
pub use version::{Version, PROTOCOL_VERSION};
