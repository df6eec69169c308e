//! Connection registry.
//!
//! Admits connections up to a fixed ceiling, gives each one a bounded outbox,
//! and tears down everything a connection owns when it goes away. A
//! connection whose outbox fills up is cut off: its outbox closes once the
//! queued messages are drained, and the transport disconnects it.

use crate::channel::Hub;
use crate::message::{ConnectionId, Message};
use crate::schedule::ScheduleStore;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Default connection ceiling.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;

/// Default number of messages queued per connection before it is cut off.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The active connection count is at the ceiling.
    #[error("Connection capacity of {0} reached")]
    CapacityExceeded(usize),

    /// The id is already registered.
    #[error("Connection already registered: {0}")]
    AlreadyRegistered(ConnectionId),
}

/// Receiving half of a connection's outbox.
///
/// Yields origin replies and every hub message not sourced by the connection,
/// in the order they were queued. `recv` returning `None` means the
/// connection was unregistered or fell behind.
#[derive(Debug)]
pub struct Session {
    pub id: ConnectionId,
    pub outbox: mpsc::Receiver<Arc<Message>>,
}

struct ConnectionEntry {
    /// The forwarder holds the only strong sender.
    outbox: mpsc::WeakSender<Arc<Message>>,
    forwarder: JoinHandle<()>,
    /// Milliseconds since the registry epoch.
    last_seen: AtomicU64,
}

/// Live connections.
pub struct Registry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    active: AtomicUsize,
    max_connections: usize,
    outbox_capacity: usize,
    hub: Hub,
    schedules: Arc<ScheduleStore>,
    epoch: Instant,
}

impl Registry {
    #[must_use]
    pub fn new(hub: Hub, schedules: Arc<ScheduleStore>) -> Self {
        Self::with_capacity(hub, schedules, DEFAULT_MAX_CONNECTIONS)
    }

    #[must_use]
    pub fn with_capacity(hub: Hub, schedules: Arc<ScheduleStore>, max_connections: usize) -> Self {
        info!(max_connections, "Creating connection registry");
        Self {
            connections: DashMap::new(),
            active: AtomicUsize::new(0),
            max_connections,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            hub,
            schedules,
            epoch: Instant::now(),
        }
    }

    /// Set the per-connection outbox bound. Zero is raised to one.
    #[must_use]
    pub fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity.max(1);
        self
    }

    /// Admit a connection.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::CapacityExceeded`] when the ceiling is reached
    /// and [`RegistryError::AlreadyRegistered`] for a duplicate id.
    pub fn register(&self, id: ConnectionId) -> Result<Session, RegistryError> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_connections).then_some(n + 1)
            })
            .map_err(|_| {
                warn!(connection = %id, max = self.max_connections, "Rejecting connection at capacity");
                RegistryError::CapacityExceeded(self.max_connections)
            })?;

        let slot = match self.connections.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                self.active.fetch_sub(1, Ordering::AcqRel);
                return Err(RegistryError::AlreadyRegistered(id));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => slot,
        };

        let (tx, rx) = mpsc::channel(self.outbox_capacity);
        let outbox = tx.downgrade();
        let forwarder = tokio::spawn(forward(self.hub.subscribe(), tx, id.clone()));

        slot.insert(ConnectionEntry {
            outbox,
            forwarder,
            last_seen: AtomicU64::new(self.now_ms()),
        });

        debug!(connection = %id, active = self.len(), "Connection registered");
        Ok(Session { id, outbox: rx })
    }

    /// Remove a connection and cancel every negotiation it owns.
    ///
    /// Safe to call more than once; returns whether the id was registered.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        let removed = self.connections.remove(id);
        let cancelled = self.schedules.cancel_owned(id);

        let Some((_, entry)) = removed else {
            return false;
        };
        entry.forwarder.abort();
        self.active.fetch_sub(1, Ordering::AcqRel);

        debug!(
            connection = %id,
            cancelled = cancelled.len(),
            active = self.len(),
            "Connection unregistered"
        );
        true
    }

    /// Record activity on a connection.
    pub fn touch(&self, id: &ConnectionId) {
        if let Some(entry) = self.connections.get(id) {
            entry.last_seen.store(self.now_ms(), Ordering::Relaxed);
        }
    }

    /// Connections with no activity for longer than `timeout`.
    #[must_use]
    pub fn stale(&self, timeout: Duration) -> Vec<ConnectionId> {
        let now = self.now_ms();
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.connections
            .iter()
            .filter(|e| now.saturating_sub(e.last_seen.load(Ordering::Relaxed)) > timeout_ms)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Deliver a message to `id` only.
    ///
    /// Returns `false` if the connection is gone or its outbox is full; a full
    /// outbox also cuts the connection off.
    pub fn reply(&self, id: &ConnectionId, channel: impl Into<String>, payload: Value) -> bool {
        let Some(entry) = self.connections.get(id) else {
            trace!(connection = %id, "Reply to unknown connection dropped");
            return false;
        };
        let Some(outbox) = entry.outbox.upgrade() else {
            return false;
        };
        match outbox.try_send(Arc::new(Message::new(channel, payload))) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(connection = %id, capacity = self.outbox_capacity, "Outbox full, cutting connection off");
                entry.forwarder.abort();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    #[must_use]
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        for entry in self.connections.iter() {
            entry.forwarder.abort();
        }
    }
}

async fn forward(
    mut hub: broadcast::Receiver<Arc<Message>>,
    outbox: mpsc::Sender<Arc<Message>>,
    id: ConnectionId,
) {
    loop {
        match hub.recv().await {
            Ok(message) if !message.is_visible_to(&id) => {}
            Ok(message) => match outbox.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        connection = %id,
                        capacity = outbox.max_capacity(),
                        "Outbox full, cutting connection off"
                    );
                    break;
                }
                Err(TrySendError::Closed(_)) => break,
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(connection = %id, skipped, "Connection lagging behind hub");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
