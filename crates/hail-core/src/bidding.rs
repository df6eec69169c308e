//! Bidding negotiation.
//!
//! A bidding round for one `(request, driver, customer)` key moves from no bid
//! to an offered state with an optional expiry timer, and ends accepted,
//! withdrawn or expired. Timers live in the [`ScheduleStore`]; the durable bid
//! list lives behind the [`Gateway`].

use crate::channel::{channel_name, Hub};
use crate::error::DispatchError;
use crate::gateway::{queries, BidAcceptance, BidOffer, Gateway, Row};
use crate::message::ConnectionId;
use crate::payload::{require_text, scalar_text};
use crate::registry::Registry;
use crate::schedule::{NegotiationKey, ScheduleStore, Ticket};
use hail_protocol::events::outbound;
use hail_protocol::EventName;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, trace};

/// What a `Vehicle_Bidding` event asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BidAction {
    Place,
    Withdraw,
}

impl BidAction {
    /// Parse the `status` field: `"1"` places, `"2"` withdraws.
    #[must_use]
    pub fn parse(status: &str) -> Option<Self> {
        match status {
            "1" => Some(BidAction::Place),
            "2" => Some(BidAction::Withdraw),
            _ => None,
        }
    }
}

impl BidOffer {
    /// Read an offer from a `Vehicle_Bidding` payload.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::MissingField`] for an absent field.
    pub fn from_payload(payload: &Value) -> Result<Self, DispatchError> {
        Ok(Self {
            driver_id: require_text(payload, "uid")?,
            request_id: require_text(payload, "request_id")?,
            customer_id: require_text(payload, "c_id")?,
            price: require_text(payload, "price")?,
        })
    }

    #[must_use]
    pub fn key(&self) -> NegotiationKey {
        NegotiationKey::new(&self.request_id, &self.driver_id, &self.customer_id)
    }
}

impl BidAcceptance {
    /// Read an acceptance from an `Accept_Bidding` payload.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::MissingField`] for an absent field.
    pub fn from_payload(payload: &Value) -> Result<Self, DispatchError> {
        Ok(Self {
            customer_id: require_text(payload, "uid")?,
            driver_id: require_text(payload, "d_id")?,
            price: require_text(payload, "price")?,
            request_id: require_text(payload, "request_id")?,
        })
    }
}

/// Drives bidding rounds.
///
/// Cloning is cheap; timer tasks hold their own clone.
#[derive(Clone)]
pub struct Negotiator {
    gateway: Arc<dyn Gateway>,
    hub: Hub,
    registry: Arc<Registry>,
    schedules: Arc<ScheduleStore>,
}

impl Negotiator {
    #[must_use]
    pub fn new(
        gateway: Arc<dyn Gateway>,
        registry: Arc<Registry>,
        schedules: Arc<ScheduleStore>,
    ) -> Self {
        Self {
            gateway,
            hub: registry.hub().clone(),
            registry,
            schedules,
        }
    }

    /// Handle a `Vehicle_Bidding` event.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad payload or status, and a gateway
    /// error if the store call fails.
    pub async fn handle(&self, source: &ConnectionId, payload: &Value) -> Result<(), DispatchError> {
        let offer = BidOffer::from_payload(payload)?;
        let status = require_text(payload, "status")?;
        match BidAction::parse(&status) {
            Some(BidAction::Place) => self.place(source, offer).await,
            Some(BidAction::Withdraw) => self.withdraw(source, offer).await,
            None => Err(DispatchError::InvalidPayload(format!(
                "unknown bidding status {status}"
            ))),
        }
    }

    /// Place or supersede an offer.
    ///
    /// The key is reserved before the store is called, which cancels any live
    /// timer for it; that timer stays cancelled if the call fails. A
    /// reservation removed while the call is in flight, by an acceptance or a
    /// disconnect, is never armed.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Gateway`] if the placement fails.
    pub async fn place(&self, source: &ConnectionId, offer: BidOffer) -> Result<(), DispatchError> {
        let key = offer.key();
        let reservation = self.schedules.reserve(key.clone(), source.clone());

        let board = match self.gateway.place_bid(&offer).await {
            Ok(board) => board,
            Err(e) => {
                self.schedules.release(&reservation);
                return Err(DispatchError::gateway("Bidding", e));
            }
        };
        let Some(board) = board else {
            self.schedules.release(&reservation);
            debug!(key = %key, "Bid declined by gateway");
            return Ok(());
        };

        let customer = board
            .customer_id
            .clone()
            .unwrap_or_else(|| offer.customer_id.clone());
        self.hub.broadcast(
            source,
            channel_name(EventName::VehicleBidding.as_str(), &customer),
            board.to_value(),
        );

        let Some(expiry) = board.expiry() else {
            self.schedules.release(&reservation);
            debug!(key = %key, "Bid placed without expiry");
            return Ok(());
        };
        let negotiator = self.clone();
        let owner = source.clone();
        let armed = self
            .schedules
            .arm(&reservation, expiry, move |ticket| async move {
                negotiator.expire(ticket, owner, offer, customer).await;
            });
        if !armed {
            debug!(key = %key, "Bid closed before its timer was armed");
        }
        Ok(())
    }

    /// Withdraw an offer and publish the remaining bids.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Gateway`] if the withdrawal fails.
    pub async fn withdraw(&self, source: &ConnectionId, offer: BidOffer) -> Result<(), DispatchError> {
        self.schedules.cancel(&offer.key());

        let board = self
            .gateway
            .withdraw_bid(&offer)
            .await
            .map_err(|e| DispatchError::gateway("Bidding", e))?;

        if let Some(board) = board {
            let customer = board.customer_id.as_deref().unwrap_or(&offer.customer_id);
            self.hub.broadcast(
                source,
                channel_name(EventName::VehicleBidding.as_str(), customer),
                board.summary(),
            );
        }
        Ok(())
    }

    /// Accept one driver's offer, closing every round on the request.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Gateway`] if a store call fails. Timers
    /// cancelled before the failure stay cancelled.
    pub async fn accept(
        &self,
        source: &ConnectionId,
        acceptance: BidAcceptance,
    ) -> Result<(), DispatchError> {
        let rows = self
            .gateway
            .find(&queries::request_offered_to(
                &acceptance.request_id,
                &acceptance.driver_id,
            ))
            .await
            .map_err(|e| DispatchError::gateway("Accept bidding", e))?;
        let Some(request) = rows.first() else {
            debug!(
                request = %acceptance.request_id,
                driver = %acceptance.driver_id,
                "Request not offered to driver"
            );
            return Ok(());
        };

        let cancelled = self.schedules.cancel_request(&acceptance.request_id);
        debug!(
            request = %acceptance.request_id,
            cancelled = cancelled.len(),
            "Closed bidding rounds for request"
        );

        let accepted = self
            .gateway
            .accept_bid(&acceptance)
            .await
            .map_err(|e| DispatchError::gateway("Accept bidding", e))?;
        let Some(accepted) = accepted else {
            debug!(request = %acceptance.request_id, "Acceptance declined by gateway");
            return Ok(());
        };

        self.registry.reply(
            source,
            channel_name(EventName::VehicleBidding.as_str(), &acceptance.customer_id),
            accepted.clone(),
        );
        self.hub.broadcast(
            source,
            channel_name(EventName::AcceptBidding.as_str(), &acceptance.driver_id),
            accepted,
        );

        let losers = cancelled
            .into_iter()
            .map(|key| key.driver_id)
            .chain(offered_drivers(request))
            .filter(|driver| *driver != acceptance.driver_id)
            .collect::<BTreeSet<_>>();
        for driver in losers {
            self.hub.broadcast(
                source,
                channel_name(outbound::BIDDING_DECLINE, &driver),
                json!({ "request_id": acceptance.request_id }),
            );
        }
        Ok(())
    }

    async fn expire(&self, ticket: Ticket, owner: ConnectionId, offer: BidOffer, customer: String) {
        if !self.schedules.is_live(&ticket) {
            trace!(key = %ticket.key, "Expiry skipped for superseded entry");
            return;
        }

        let board = match self.gateway.resolve_bid_expiry(&offer).await {
            Ok(board) => board,
            Err(err) => {
                self.schedules.complete(&ticket);
                error!(key = %ticket.key, error = %err, "Failed to resolve bid expiry");
                return;
            }
        };

        if !self.schedules.complete(&ticket) {
            return;
        }
        debug!(key = %ticket.key, "Bid expired");

        if let Some(board) = board {
            let customer = board.customer_id.as_deref().unwrap_or(&customer);
            self.hub.broadcast(
                &owner,
                channel_name(EventName::VehicleBidding.as_str(), customer),
                board.summary(),
            );
        }
    }
}

/// Drivers a request row was offered to.
///
/// The store keeps the list either as a JSON array or as its text encoding.
fn offered_drivers(row: &Row) -> Vec<String> {
    let list = match row.get("d_id") {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::String(text)) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Array(items)) => items,
            Ok(other) => vec![other],
            Err(_) => text.split(',').map(|s| json!(s.trim())).collect(),
        },
        Some(other) => vec![other.clone()],
        None => Vec::new(),
    };
    list.iter()
        .filter_map(scalar_text)
        .filter(|s| !s.is_empty())
        .collect()
}
