//! The external data gateway.
//!
//! All durable ride, bid and cart state lives behind this interface. The
//! engine never builds query text from client input: reads go through named
//! statements from [`queries`] with positional parameters, and writes name a
//! [`Table`] plus field maps.

pub mod memory;
pub mod queries;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryGateway;

/// One result row.
pub type Row = Map<String, Value>;

/// Gateway failures.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The backing store could not be reached.
    #[error("Gateway unavailable: {0}")]
    Unavailable(String),

    /// The store rejected or failed the operation.
    #[error("Query failed: {0}")]
    Query(String),

    /// The store answered with something the engine cannot interpret.
    #[error("Malformed gateway response: {0}")]
    Decode(String),
}

/// Tables the engine writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Table {
    #[serde(rename = "tbl_driver")]
    Driver,
    #[serde(rename = "tbl_cart_vehicle")]
    CartVehicle,
    #[serde(rename = "tbl_chat")]
    Chat,
}

impl Table {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Table::Driver => "tbl_driver",
            Table::CartVehicle => "tbl_cart_vehicle",
            Table::Chat => "tbl_chat",
        }
    }
}

/// A parameterized read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Query {
    /// Stable statement name, used by gateways that dispatch by name.
    pub name: &'static str,
    /// Statement text with `?` placeholders.
    pub sql: &'static str,
    /// Positional parameters.
    pub params: Vec<Value>,
}

impl Query {
    #[must_use]
    pub fn new(statement: &queries::Statement, params: Vec<Value>) -> Self {
        Self {
            name: statement.name,
            sql: statement.sql,
            params,
        }
    }
}

/// A driver's offer on a ride request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BidOffer {
    pub driver_id: String,
    pub request_id: String,
    pub customer_id: String,
    pub price: String,
}

/// A customer's acceptance of one driver's offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BidAcceptance {
    pub customer_id: String,
    pub driver_id: String,
    pub price: String,
    pub request_id: String,
}

/// Identifies one ride between a driver and a customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RideRef {
    pub driver_id: String,
    pub customer_id: String,
    pub request_id: String,
}

/// Current bids on a request as reported by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidBoard {
    /// Customer that owns the request, when the gateway reports it.
    #[serde(
        rename = "c_id",
        default,
        deserialize_with = "optional_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub bidding_list: Value,
    /// Offer expiry in seconds; zero means the offer never expires on its own.
    #[serde(default, deserialize_with = "seconds")]
    pub off_ex_time: f64,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl BidBoard {
    /// Timer duration for this offer, or `None` for manual resolution only.
    ///
    /// Values that do not fit a [`Duration`] are treated as manual resolution.
    #[must_use]
    pub fn expiry(&self) -> Option<Duration> {
        if self.off_ex_time <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(self.off_ex_time).ok()
    }

    /// The reduced view broadcast after withdrawal or expiry.
    #[must_use]
    pub fn summary(&self) -> Value {
        json!({
            "bidding_list": self.bidding_list,
            "off_ex_time": self.off_ex_time,
        })
    }

    /// The full board as broadcast after a placement.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Result of settling a completed ride.
#[derive(Debug, Clone, PartialEq)]
pub enum FareOutcome {
    NotFound,
    StepsIncomplete,
    Failed,
    Settled {
        price_list: Value,
        payment: Value,
        review_list: Value,
    },
}

impl FareOutcome {
    /// Map the backend's answer: a status code `1`..`4` or a settlement object.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Decode`] for anything else.
    pub fn from_value(value: &Value) -> Result<Self, GatewayError> {
        let code = match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(false) | Value::Null => return Ok(FareOutcome::NotFound),
            _ => None,
        };

        match code.as_deref() {
            Some("1") => Ok(FareOutcome::NotFound),
            Some("2") => Ok(FareOutcome::StepsIncomplete),
            Some("3" | "4") => Ok(FareOutcome::Failed),
            Some(other) => Err(GatewayError::Decode(format!("unknown fare code {other}"))),
            None => Ok(FareOutcome::Settled {
                price_list: value.get("price_list").cloned().unwrap_or(Value::Null),
                payment: value.get("payment").cloned().unwrap_or(Value::Null),
                review_list: value.get("review_list").cloned().unwrap_or(Value::Null),
            }),
        }
    }

    /// Payload of the `Vehicle_Ride_Payment` event.
    #[must_use]
    pub fn to_payload(&self) -> Value {
        let failure = |message: &str| {
            json!({
                "ResponseCode": 401,
                "Result": false,
                "message": message,
            })
        };

        match self {
            FareOutcome::NotFound => failure("Request Not Found!"),
            FareOutcome::StepsIncomplete => failure("Please Complete Other Step!"),
            FareOutcome::Failed => failure("Something went wrong"),
            FareOutcome::Settled {
                price_list,
                payment,
                review_list,
            } => json!({
                "ResponseCode": 200,
                "Result": true,
                "message": "Ride Complete Successful",
                "price_list": price_list,
                "payment_data": payment,
                "review_list": review_list,
            }),
        }
    }
}

/// Typed access to the backing store.
///
/// Every call may suspend; no engine lock is held across one.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Run a parameterized read.
    async fn find(&self, query: &Query) -> Result<Vec<Row>, GatewayError>;

    /// Insert a row and return it as stored.
    async fn insert(&self, table: Table, row: Row) -> Result<Row, GatewayError>;

    /// Update rows matching every field of `filter`; returns the affected count.
    async fn update(&self, table: Table, set: Row, filter: Row) -> Result<u64, GatewayError>;

    /// Delete rows matching every field of `filter`; returns the affected count.
    async fn delete(&self, table: Table, filter: Row) -> Result<u64, GatewayError>;

    /// Record an offer. `None` means the store declined it.
    async fn place_bid(&self, offer: &BidOffer) -> Result<Option<BidBoard>, GatewayError>;

    /// Expire an offer and return the fresh board.
    async fn resolve_bid_expiry(&self, offer: &BidOffer) -> Result<Option<BidBoard>, GatewayError>;

    /// Remove an offer and return the fresh board.
    async fn withdraw_bid(&self, offer: &BidOffer) -> Result<Option<BidBoard>, GatewayError>;

    /// Commit an acceptance. `None` means the store declined it.
    async fn accept_bid(&self, acceptance: &BidAcceptance) -> Result<Option<Value>, GatewayError>;

    /// Settle the fare of a completed ride.
    async fn compute_ride_fare(&self, ride: &RideRef) -> Result<FareOutcome, GatewayError>;

    /// Current progress of a ride (status, stops, drop points).
    async fn ride_progress(&self, ride: &RideRef) -> Result<Value, GatewayError>;

    /// Apply a ride timer update; `false` when nothing changed.
    async fn update_ride_time(&self, update: &Value) -> Result<bool, GatewayError>;
}

/// Build a [`Row`] from a JSON object literal.
#[must_use]
pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

fn optional_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(crate::payload::scalar_text))
}

fn seconds<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or_default(),
        Some(Value::String(s)) => s.trim().parse().unwrap_or_default(),
        _ => 0.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bid_board_accepts_string_expiry() {
        let board: BidBoard = serde_json::from_value(json!({
            "c_id": 42,
            "bidding_list": [{"d_id": "7", "price": "20"}],
            "off_ex_time": "30",
            "request_id": "9",
        }))
        .unwrap();

        assert_eq!(board.customer_id.as_deref(), Some("42"));
        assert_eq!(board.expiry(), Some(Duration::from_secs(30)));
        assert_eq!(board.rest["request_id"], "9");
        assert_eq!(board.summary()["off_ex_time"], 30.0);
    }

    #[test]
    fn test_bid_board_out_of_range_expiry_is_manual() {
        for off_ex_time in [json!(1e20), json!("1e300"), json!(-5), json!("-0.5"), json!(0)] {
            let board: BidBoard = serde_json::from_value(json!({
                "c_id": "42",
                "bidding_list": [],
                "off_ex_time": off_ex_time,
            }))
            .unwrap();
            assert_eq!(board.expiry(), None, "{off_ex_time}");
        }

        let board = BidBoard {
            customer_id: None,
            bidding_list: Value::Null,
            off_ex_time: f64::NAN,
            rest: Map::new(),
        };
        assert_eq!(board.expiry(), None);
    }

    #[test]
    fn test_zero_or_missing_expiry_means_manual() {
        let zero: BidBoard = serde_json::from_value(json!({"off_ex_time": 0})).unwrap();
        let missing: BidBoard = serde_json::from_value(json!({})).unwrap();
        let junk: BidBoard = serde_json::from_value(json!({"off_ex_time": "soon"})).unwrap();

        assert_eq!(zero.expiry(), None);
        assert_eq!(missing.expiry(), None);
        assert_eq!(junk.expiry(), None);
    }

    #[test]
    fn test_fare_outcome_codes() {
        assert_eq!(
            FareOutcome::from_value(&json!("1")).unwrap(),
            FareOutcome::NotFound
        );
        assert_eq!(
            FareOutcome::from_value(&json!(2)).unwrap(),
            FareOutcome::StepsIncomplete
        );
        assert_eq!(
            FareOutcome::from_value(&json!("4")).unwrap(),
            FareOutcome::Failed
        );
        assert!(FareOutcome::from_value(&json!("9")).is_err());

        let settled = FareOutcome::from_value(&json!({
            "price_list": [1],
            "payment": {"id": 2},
            "review_list": [],
        }))
        .unwrap();
        let payload = settled.to_payload();
        assert_eq!(payload["ResponseCode"], 200);
        assert_eq!(payload["payment_data"]["id"], 2);
    }

    #[test]
    fn test_fare_failure_payload() {
        let payload = FareOutcome::StepsIncomplete.to_payload();
        assert_eq!(payload["ResponseCode"], 401);
        assert_eq!(payload["Result"], false);
        assert_eq!(payload["message"], "Please Complete Other Step!");
    }
}
