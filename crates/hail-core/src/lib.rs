//! # hail-core
//!
//! Dispatch coordination for the hail ride-hailing engine.
//!
//! This crate provides the building blocks behind every socket event:
//!
//! - **Router** - Validates inbound events and calls exactly one handler
//! - **Registry** - Live connections, capacity ceiling, per-connection outbox
//! - **Hub** - `<event><id>` channel addressing and broadcast to everyone but the source
//! - **Negotiator** - Bidding rounds with expiry timers
//! - **ScheduleStore** - Armed bid timers, cancellation and sweeping
//! - **Fanout** - Capped driver location broadcasts
//! - **ChatRelay** / **RideFlow** - Thin persist-and-forward handlers
//! - **Gateway** - Typed access to the platform's data store
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│   Router    │────▶│   Gateway   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │
//!        │                   ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Registry   │◀────│     Hub     │     │  Schedule   │
//! └─────────────┘     └─────────────┘     │    Store    │
//!                                         └─────────────┘
//! ```

pub mod bidding;
pub mod channel;
pub mod chat;
pub mod error;
pub mod fanout;
pub mod gateway;
pub mod maintenance;
pub mod message;
pub mod payload;
pub mod registry;
pub mod ride;
pub mod router;
pub mod schedule;

pub use bidding::{BidAction, Negotiator};
pub use channel::{channel_name, Hub};
pub use chat::ChatRelay;
pub use error::DispatchError;
pub use fanout::{CheckStatus, DutyStatus, Fanout, FanoutLimits, RideStatus};
pub use gateway::{Gateway, GatewayError, MemoryGateway};
pub use maintenance::{Maintenance, MaintenanceConfig, MaintenanceHandle};
pub use message::{ConnectionId, Message};
pub use registry::{Registry, RegistryError, Session};
pub use ride::RideFlow;
pub use router::{Router, RouterConfig, RouterStats};
pub use schedule::{NegotiationKey, ScheduleStore};
