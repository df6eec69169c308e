//! Event router for hail.
//!
//! The router owns the engine's shared state and turns each inbound event
//! into exactly one handler call. Payload validation happens here so that
//! handlers only see events carrying their required fields.

use crate::bidding::Negotiator;
use crate::channel::Hub;
use crate::chat::ChatRelay;
use crate::error::DispatchError;
use crate::fanout::{Fanout, FanoutLimits, LocationUpdate};
use crate::gateway::{BidAcceptance, Gateway};
use crate::message::ConnectionId;
use crate::payload::{first_missing, is_truthy};
use crate::registry::{
    Registry, RegistryError, Session, DEFAULT_MAX_CONNECTIONS, DEFAULT_OUTBOX_CAPACITY,
};
use crate::ride::RideFlow;
use crate::schedule::ScheduleStore;
use hail_protocol::events::outbound;
use hail_protocol::EventName;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, trace};

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum number of concurrent connections.
    pub max_connections: usize,
    /// Messages queued per connection before it is cut off.
    pub outbox_capacity: usize,
    /// Hub broadcast capacity.
    pub hub_capacity: usize,
    /// Location fanout recipient caps.
    pub fanout: FanoutLimits,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            hub_capacity: crate::channel::DEFAULT_HUB_CAPACITY,
            fanout: FanoutLimits::default(),
        }
    }
}

/// The central event router.
pub struct Router {
    registry: Arc<Registry>,
    schedules: Arc<ScheduleStore>,
    negotiator: Negotiator,
    fanout: Fanout,
    chat: ChatRelay,
    rides: RideFlow,
}

impl Router {
    /// Create a router with default configuration.
    #[must_use]
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self::with_config(gateway, RouterConfig::default())
    }

    #[must_use]
    pub fn with_config(gateway: Arc<dyn Gateway>, config: RouterConfig) -> Self {
        info!("Creating router with config: {:?}", config);

        let hub = Hub::with_capacity(config.hub_capacity);
        let schedules = Arc::new(ScheduleStore::new());
        let registry = Arc::new(
            Registry::with_capacity(hub.clone(), Arc::clone(&schedules), config.max_connections)
                .with_outbox_capacity(config.outbox_capacity),
        );
        let fanout = Fanout::new(Arc::clone(&gateway), hub.clone(), config.fanout);

        Self {
            negotiator: Negotiator::new(
                Arc::clone(&gateway),
                Arc::clone(&registry),
                Arc::clone(&schedules),
            ),
            chat: ChatRelay::new(Arc::clone(&gateway), hub),
            rides: RideFlow::new(gateway, Arc::clone(&registry), fanout.clone()),
            fanout,
            registry,
            schedules,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[must_use]
    pub fn schedules(&self) -> &Arc<ScheduleStore> {
        &self.schedules
    }

    /// Admit a new connection with a generated id.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::CapacityExceeded`] at the connection ceiling.
    pub fn connect(&self) -> Result<Session, RegistryError> {
        self.registry.register(ConnectionId::generate())
    }

    /// Tear down a connection and everything it owns.
    pub fn disconnect(&self, id: &ConnectionId) {
        self.registry.unregister(id);
    }

    /// Validate and handle one inbound event.
    ///
    /// Failures are reported to `source` before being returned, so callers
    /// only need the result for bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns the validation or gateway error that stopped the event.
    pub async fn dispatch(
        &self,
        source: &ConnectionId,
        event: &str,
        payload: Value,
    ) -> Result<EventName, DispatchError> {
        self.registry.touch(source);

        let name = match event.parse::<EventName>() {
            Ok(name) => name,
            Err(unknown) => {
                let err = DispatchError::UnknownEvent(unknown.0);
                self.report(source, None, &err);
                return Err(err);
            }
        };

        trace!(connection = %source, event = %name, "Dispatching event");
        match self.handle(source, name, payload).await {
            Ok(()) => Ok(name),
            Err(err) => {
                self.report(source, Some(name), &err);
                Err(err)
            }
        }
    }

    async fn handle(
        &self,
        source: &ConnectionId,
        event: EventName,
        payload: Value,
    ) -> Result<(), DispatchError> {
        if event.requires_payload() && !is_truthy(&payload) {
            return Err(DispatchError::InvalidPayload(format!(
                "{event} requires a payload"
            )));
        }
        if let Some(field) = first_missing(&payload, event.required_fields()) {
            return Err(DispatchError::MissingField(field));
        }

        match event {
            EventName::Home
            | EventName::VehicleRequest
            | EventName::RequestTimeOut
            | EventName::AcceptRemoveOther
            | EventName::DriverIAmHere
            | EventName::RideCancel
            | EventName::RideOtp => {
                self.rides.relay(source, event, payload);
                Ok(())
            }
            EventName::HomeMap => {
                let update = LocationUpdate::from_payload(&payload)?;
                self.fanout.location_update(source, &update).await.map(drop)
            }
            EventName::VehicleBidding => self.negotiator.handle(source, &payload).await,
            EventName::AcceptBidding => {
                let acceptance = BidAcceptance::from_payload(&payload)?;
                self.negotiator.accept(source, acceptance).await
            }
            EventName::AcceptVehicleRequest => self.rides.accept_request(source, &payload).await,
            EventName::VehicleTimeUpdate => self.rides.time_update(source, &payload).await,
            EventName::VehicleTimeRequest => self.rides.time_request(source, &payload),
            EventName::VehicleAcceptCancel => self.rides.accept_cancel(source, &payload),
            EventName::RideStartEnd => self.rides.start_end(source, &payload).await,
            EventName::DropLocationList => self.rides.drop_locations(source, &payload).await,
            EventName::PaymentChange => self.rides.payment_change(source, &payload).await,
            EventName::RideComplete => self.rides.ride_complete(source, &payload),
            EventName::SendChat => self.chat.relay(source, &payload).await,
        }
    }

    fn report(&self, source: &ConnectionId, event: Option<EventName>, err: &DispatchError) {
        match err {
            DispatchError::Gateway { .. } => {
                error!(connection = %source, event = ?event, error = %err, "Event failed");
            }
            _ => debug!(connection = %source, event = ?event, error = %err, "Event rejected"),
        }

        let (channel, payload) = match (event, err) {
            (Some(EventName::HomeMap), DispatchError::Gateway { .. }) => (
                outbound::DATABASE_ERROR,
                json!({
                    "ResponseCode": 401,
                    "Result": false,
                    "message": "Database error occurred",
                }),
            ),
            _ => (outbound::ERROR, err.to_payload()),
        };
        self.registry.reply(source, channel, payload);
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            connection_count: self.registry.len(),
            negotiation_count: self.schedules.len(),
        }
    }
}

/// Router statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterStats {
    /// Number of connected clients.
    pub connection_count: usize,
    /// Number of armed bidding timers.
    pub negotiation_count: usize,
}
