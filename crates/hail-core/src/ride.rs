//! Ride lifecycle events after a driver has been matched.

use crate::channel::{channel_name, Hub};
use crate::error::DispatchError;
use crate::fanout::Fanout;
use crate::gateway::{queries, row, Gateway, RideRef, Table};
use crate::message::ConnectionId;
use crate::payload::{require_text, scalar_text};
use crate::registry::Registry;
use hail_protocol::events::outbound;
use hail_protocol::EventName;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Ride progress status reported once the customer has been dropped off.
pub const RIDE_COMPLETED: &str = "7";

/// Whether a ride progress report marks the ride as completed.
#[must_use]
pub fn is_completed(progress: &Value) -> bool {
    progress
        .get("status")
        .and_then(scalar_text)
        .is_some_and(|s| s == RIDE_COMPLETED)
}

/// Handlers for the ride-state events that follow an accepted bid.
#[derive(Clone)]
pub struct RideFlow {
    gateway: Arc<dyn Gateway>,
    hub: Hub,
    registry: Arc<Registry>,
    fanout: Fanout,
}

impl RideFlow {
    #[must_use]
    pub fn new(gateway: Arc<dyn Gateway>, registry: Arc<Registry>, fanout: Fanout) -> Self {
        Self {
            gateway,
            hub: registry.hub().clone(),
            registry,
            fanout,
        }
    }

    /// Rebroadcast an event unchanged on its own name.
    pub fn relay(&self, source: &ConnectionId, event: EventName, payload: Value) {
        self.hub.broadcast(source, event.as_str(), payload);
    }

    /// A driver accepted a ride request (`acceptvehrequest`).
    ///
    /// # Errors
    ///
    /// Returns a validation or gateway error.
    pub async fn accept_request(
        &self,
        source: &ConnectionId,
        payload: &Value,
    ) -> Result<(), DispatchError> {
        let driver = require_text(payload, "uid")?;
        let request = require_text(payload, "request_id")?;
        let customer = require_text(payload, "c_id")?;

        let cart = self
            .gateway
            .find(&queries::cart_driver_list(&request, &customer, &driver))
            .await
            .map_err(|e| DispatchError::gateway("Accept request", e))?;
        if let Some(cart) = cart.first() {
            self.hub.broadcast(
                source,
                EventName::AcceptRemoveOther.as_str(),
                json!({
                    "requestid": request,
                    "driverid": driver_list(cart.get("driver_id_list")),
                }),
            );
        }

        self.hub.broadcast(
            source,
            channel_name(EventName::AcceptVehicleRequest.as_str(), &customer),
            payload.clone(),
        );
        self.fanout.fare_context(source, &driver).await?;
        Ok(())
    }

    /// `Vehicle_Time_update`: apply a ride timer change and tell the customer.
    ///
    /// # Errors
    ///
    /// Returns a validation or gateway error.
    pub async fn time_update(&self, source: &ConnectionId, payload: &Value) -> Result<(), DispatchError> {
        let customer = require_text(payload, "c_id")?;
        let applied = self
            .gateway
            .update_ride_time(payload)
            .await
            .map_err(|e| DispatchError::gateway("Time update", e))?;

        if applied {
            self.hub.broadcast(
                source,
                channel_name(EventName::VehicleTimeUpdate.as_str(), &customer),
                payload.clone(),
            );
        } else {
            debug!(customer = %customer, "Ride time update not applied");
        }
        Ok(())
    }

    /// `Vehicle_Time_Request`: forward to the driver.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::MissingField`] without a `d_id`.
    pub fn time_request(&self, source: &ConnectionId, payload: &Value) -> Result<(), DispatchError> {
        let driver = require_text(payload, "d_id")?;
        self.hub.broadcast(
            source,
            channel_name(EventName::VehicleTimeRequest.as_str(), &driver),
            payload.clone(),
        );
        Ok(())
    }

    /// `Vehicle_Accept_Cancel`: the driver backed out of an accepted request.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::MissingField`] for an absent field.
    pub fn accept_cancel(&self, source: &ConnectionId, payload: &Value) -> Result<(), DispatchError> {
        let driver = require_text(payload, "uid")?;
        let request = require_text(payload, "request_id")?;
        let customer = require_text(payload, "c_id")?;
        self.hub.broadcast(
            source,
            channel_name(EventName::VehicleAcceptCancel.as_str(), &customer),
            json!({ "request_id": request, "d_id": driver }),
        );
        Ok(())
    }

    /// `Vehicle_Ride_Start_End`: publish progress, refresh the driver
    /// position and settle the fare once the ride is completed.
    ///
    /// # Errors
    ///
    /// Returns a validation or gateway error.
    pub async fn start_end(&self, source: &ConnectionId, payload: &Value) -> Result<(), DispatchError> {
        let ride = RideRef {
            driver_id: require_text(payload, "uid")?,
            customer_id: require_text(payload, "c_id")?,
            request_id: require_text(payload, "request_id")?,
        };

        let progress = self
            .gateway
            .ride_progress(&ride)
            .await
            .map_err(|e| DispatchError::gateway("Ride start/end", e))?;
        let completed = is_completed(&progress);

        self.hub.broadcast(
            source,
            channel_name(EventName::RideStartEnd.as_str(), &ride.customer_id),
            progress,
        );
        self.fanout.fare_context(source, &ride.driver_id).await?;

        if completed {
            let fare = self
                .gateway
                .compute_ride_fare(&ride)
                .await
                .map_err(|e| DispatchError::gateway("Ride start/end", e))?;
            debug!(request = %ride.request_id, ?fare, "Ride completed");
            self.hub.broadcast(
                source,
                channel_name(outbound::RIDE_PAYMENT, &ride.customer_id),
                fare.to_payload(),
            );
        }
        Ok(())
    }

    /// `drop_location_list`: answer the caller with the ride's drop points.
    ///
    /// # Errors
    ///
    /// Returns a validation or gateway error.
    pub async fn drop_locations(
        &self,
        source: &ConnectionId,
        payload: &Value,
    ) -> Result<(), DispatchError> {
        let ride = RideRef {
            driver_id: require_text(payload, "d_id")?,
            customer_id: require_text(payload, "c_id")?,
            request_id: require_text(payload, "r_id")?,
        };
        let progress = self
            .gateway
            .ride_progress(&ride)
            .await
            .map_err(|e| DispatchError::gateway("Drop location", e))?;

        self.registry.reply(
            source,
            channel_name(outbound::DROP_LOCATION, &ride.customer_id),
            progress,
        );
        Ok(())
    }

    /// `Vehicle_P_Change`: switch the ride to another payment method.
    ///
    /// Unknown or disabled methods are ignored.
    ///
    /// # Errors
    ///
    /// Returns a validation or gateway error.
    pub async fn payment_change(
        &self,
        source: &ConnectionId,
        payload: &Value,
    ) -> Result<(), DispatchError> {
        let payment_id = require_text(payload, "payment_id")?;
        let driver = require_text(payload, "d_id")?;
        let customer = require_text(payload, "userid")?;

        let methods = self
            .gateway
            .find(&queries::active_payment_method(&payment_id))
            .await
            .map_err(|e| DispatchError::gateway("Payment change", e))?;
        let Some(method) = methods.into_iter().next() else {
            debug!(payment_id = %payment_id, "Payment method not available");
            return Ok(());
        };

        let method_id = method.get("id").cloned().unwrap_or_else(|| json!(payment_id));
        self.gateway
            .update(
                Table::CartVehicle,
                row(json!({ "payment_id": method_id })),
                row(json!({ "d_id": driver, "c_id": customer })),
            )
            .await
            .map_err(|e| DispatchError::gateway("Payment change", e))?;

        self.hub.broadcast(
            source,
            channel_name(EventName::PaymentChange.as_str(), &driver),
            json!({ "payment_data": method }),
        );
        Ok(())
    }

    /// `Vehicle_Ride_Complete`: tell the driver payment went through.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::MissingField`] without a `d_id`.
    pub fn ride_complete(&self, source: &ConnectionId, payload: &Value) -> Result<(), DispatchError> {
        let driver = require_text(payload, "d_id")?;
        self.hub.broadcast(
            source,
            channel_name(EventName::RideComplete.as_str(), &driver),
            payload.clone(),
        );
        Ok(())
    }
}

/// The cart's `driver_id_list`, decoded if the store returned it as text.
fn driver_list(value: Option<&Value>) -> Value {
    match value {
        Some(Value::String(text)) => serde_json::from_str(text).unwrap_or_else(|_| json!(text)),
        Some(other) => other.clone(),
        None => Value::Null,
    }
}
