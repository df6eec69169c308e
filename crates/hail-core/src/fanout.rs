//! Driver location fanout.
//!
//! A location update is persisted and then broadcast to at most a fixed
//! number of interested customers. Which broadcasts go out depends on the
//! driver's ride and check status:
//!
//! | rid_status | check_status | homemap | vdriloc |
//! |------------|--------------|---------|---------|
//! | 0          | any          | yes     | no      |
//! | 1          | 0            | yes     | no      |
//! | 1          | other        | no      | yes     |
//! | other      | any          | no      | no      |

use crate::channel::{channel_name, Hub};
use crate::error::DispatchError;
use crate::gateway::{queries, row, Gateway, Row, Table};
use crate::message::ConnectionId;
use crate::payload::{require_text, scalar_text};
use hail_protocol::events::outbound;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, trace};

/// Recipient caps per fanout kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanoutLimits {
    /// Customers with an open request on the driver.
    pub open_requests: usize,
    /// Customers whose fare context shows the driver.
    pub fare_context: usize,
}

impl Default for FanoutLimits {
    fn default() -> Self {
        Self {
            open_requests: 10,
            fare_context: 50,
        }
    }
}

/// Driver duty status as sent by the app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DutyStatus {
    On,
    Off,
}

impl DutyStatus {
    /// `"on"` is on duty; anything else is off.
    #[must_use]
    pub fn parse(status: &str) -> Self {
        if status == "on" {
            DutyStatus::On
        } else {
            DutyStatus::Off
        }
    }

    /// Value stored in the driver's `fstatus` column.
    #[must_use]
    pub const fn fstatus(self) -> &'static str {
        match self {
            DutyStatus::On => "1",
            DutyStatus::Off => "0",
        }
    }
}

/// A `homemap` update.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationUpdate {
    pub driver_id: String,
    pub lat: String,
    pub long: String,
    pub status: DutyStatus,
}

impl LocationUpdate {
    /// # Errors
    ///
    /// Returns [`DispatchError::MissingField`] for an absent field.
    pub fn from_payload(payload: &Value) -> Result<Self, DispatchError> {
        Ok(Self {
            driver_id: require_text(payload, "uid")?,
            lat: require_text(payload, "lat")?,
            long: require_text(payload, "long")?,
            status: DutyStatus::parse(&require_text(payload, "status")?),
        })
    }
}

/// The driver's `rid_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RideStatus {
    /// `0`: not on a ride.
    Free,
    /// `1`: assigned to a ride.
    OnRide,
    Unknown,
}

impl RideStatus {
    #[must_use]
    pub fn parse(code: &str) -> Self {
        match code.trim() {
            "0" => RideStatus::Free,
            "1" => RideStatus::OnRide,
            _ => RideStatus::Unknown,
        }
    }
}

/// The driver's `check_status`; only `0` is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Unchecked,
    Checked,
}

impl CheckStatus {
    #[must_use]
    pub fn parse(code: &str) -> Self {
        if code.trim() == "0" {
            CheckStatus::Unchecked
        } else {
            CheckStatus::Checked
        }
    }
}

/// Which broadcasts a location update triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BroadcastFlags {
    pub homemap: bool,
    pub vdriloc: bool,
}

impl BroadcastFlags {
    #[must_use]
    pub fn from_status(ride: RideStatus, check: CheckStatus) -> Self {
        match (ride, check) {
            (RideStatus::Free, _) | (RideStatus::OnRide, CheckStatus::Unchecked) => Self {
                homemap: true,
                vdriloc: false,
            },
            (RideStatus::OnRide, CheckStatus::Checked) => Self {
                homemap: false,
                vdriloc: true,
            },
            (RideStatus::Unknown, _) => Self::default(),
        }
    }
}

/// What a fanout emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FanoutReport {
    pub flags: BroadcastFlags,
    pub recipients: usize,
}

/// Emits driver locations to interested customers.
#[derive(Clone)]
pub struct Fanout {
    gateway: Arc<dyn Gateway>,
    hub: Hub,
    limits: FanoutLimits,
}

impl Fanout {
    #[must_use]
    pub fn new(gateway: Arc<dyn Gateway>, hub: Hub, limits: FanoutLimits) -> Self {
        Self {
            gateway,
            hub,
            limits,
        }
    }

    /// Handle a `homemap` update.
    ///
    /// Unknown or inactive drivers are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Gateway`] if a store call fails.
    pub async fn location_update(
        &self,
        source: &ConnectionId,
        update: &LocationUpdate,
    ) -> Result<FanoutReport, DispatchError> {
        let driver = self
            .find_first(queries::driver_profile(&update.driver_id))
            .await?;
        let Some(driver) = driver else {
            debug!(driver = %update.driver_id, "Location update for inactive driver");
            return Ok(FanoutReport::default());
        };

        let ride = RideStatus::parse(&field_text(&driver, "rid_status"));
        let check = CheckStatus::parse(&field_text(&driver, "check_status"));
        let flags = BroadcastFlags::from_status(ride, check);

        self.gateway
            .update(
                Table::Driver,
                row(json!({
                    "latitude": update.lat,
                    "longitude": update.long,
                    "fstatus": update.status.fstatus(),
                })),
                row(json!({ "id": update.driver_id })),
            )
            .await
            .map_err(|e| DispatchError::gateway("Location update", e))?;

        let driver = Value::Object(driver);
        if flags.homemap {
            self.hub.broadcast(
                source,
                channel_name(outbound::HOMEMAP_DRIVER, &update.driver_id),
                json!({
                    "driver": driver,
                    "check_status": if ride == RideStatus::OnRide { "1" } else { "0" },
                    "vdriloc": u8::from(flags.vdriloc),
                }),
            );
        }

        let mut recipients = 0;
        if flags.vdriloc {
            let customers = self
                .find_all(queries::open_request_customers(
                    &update.driver_id,
                    self.limits.open_requests,
                ))
                .await?;
            recipients = self.emit_location(
                source,
                &update.driver_id,
                &driver,
                &customers,
                self.limits.open_requests,
            );
        }

        trace!(driver = %update.driver_id, ?flags, recipients, "Location fanout");
        Ok(FanoutReport { flags, recipients })
    }

    /// Show the driver's current position to every customer whose fare
    /// context includes it.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Gateway`] if a store call fails.
    pub async fn fare_context(
        &self,
        source: &ConnectionId,
        driver_id: &str,
    ) -> Result<usize, DispatchError> {
        let Some(position) = self.find_first(queries::driver_position(driver_id)).await? else {
            return Ok(0);
        };
        let customers = self
            .find_all(queries::fare_visible_customers(
                driver_id,
                self.limits.fare_context,
            ))
            .await?;

        Ok(self.emit_location(
            source,
            driver_id,
            &Value::Object(position),
            &customers,
            self.limits.fare_context,
        ))
    }

    fn emit_location(
        &self,
        source: &ConnectionId,
        driver_id: &str,
        location: &Value,
        customers: &[Row],
        cap: usize,
    ) -> usize {
        let recipients: Vec<String> = customers
            .iter()
            .filter_map(|row| row.get("c_id").and_then(scalar_text))
            .take(cap)
            .collect();

        for customer in &recipients {
            self.hub.broadcast(
                source,
                channel_name(outbound::DRIVER_LOCATION, customer),
                json!({
                    "d_id": driver_id,
                    "driver_location": location,
                }),
            );
        }
        recipients.len()
    }

    async fn find_all(&self, query: crate::gateway::Query) -> Result<Vec<Row>, DispatchError> {
        self.gateway
            .find(&query)
            .await
            .map_err(|e| DispatchError::gateway("Location lookup", e))
    }

    async fn find_first(&self, query: crate::gateway::Query) -> Result<Option<Row>, DispatchError> {
        Ok(self.find_all(query).await?.into_iter().next())
    }
}

fn field_text(row: &Row, field: &str) -> String {
    row.get(field).and_then(scalar_text).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::memory::ops;
    use crate::gateway::queries::{
        DRIVER_POSITION, DRIVER_PROFILE, FARE_VISIBLE_CUSTOMERS, OPEN_REQUEST_CUSTOMERS,
    };
    use crate::gateway::MemoryGateway;
    use crate::message::Message;
    use tokio::sync::broadcast;

    fn fanout() -> (Fanout, Arc<MemoryGateway>, broadcast::Receiver<Arc<Message>>) {
        let gateway = Arc::new(MemoryGateway::new());
        let hub = Hub::new();
        let rx = hub.subscribe();
        let fanout = Fanout::new(
            Arc::clone(&gateway) as Arc<dyn Gateway>,
            hub,
            FanoutLimits::default(),
        );
        (fanout, gateway, rx)
    }

    fn driver(rid_status: Value, check_status: Value) -> Value {
        json!({
            "id": "7",
            "latitude": "24.1",
            "longitude": "46.2",
            "rid_status": rid_status,
            "check_status": check_status,
        })
    }

    fn customers(n: usize) -> Vec<Value> {
        (0..n).map(|i| json!({ "c_id": format!("c{i}") })).collect()
    }

    fn update() -> LocationUpdate {
        LocationUpdate {
            driver_id: "7".into(),
            lat: "24.5".into(),
            long: "46.9".into(),
            status: DutyStatus::On,
        }
    }

    fn channels(rx: &mut broadcast::Receiver<Arc<Message>>) -> Vec<Arc<Message>> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn test_truth_table() {
        let flags = |r, c| BroadcastFlags::from_status(RideStatus::parse(r), CheckStatus::parse(c));
        assert_eq!(flags("0", "0"), BroadcastFlags { homemap: true, vdriloc: false });
        assert_eq!(flags("0", "1"), BroadcastFlags { homemap: true, vdriloc: false });
        assert_eq!(flags("1", "0"), BroadcastFlags { homemap: true, vdriloc: false });
        assert_eq!(flags("1", "2"), BroadcastFlags { homemap: false, vdriloc: true });
        assert_eq!(flags("2", "0"), BroadcastFlags::default());
        assert_eq!(flags("", ""), BroadcastFlags::default());
    }

    #[test]
    fn test_duty_status() {
        assert_eq!(DutyStatus::parse("on").fstatus(), "1");
        assert_eq!(DutyStatus::parse("off").fstatus(), "0");
        assert_eq!(DutyStatus::parse("ON"), DutyStatus::Off);
    }

    #[tokio::test]
    async fn test_on_ride_unchecked_driver_gets_homemap_only() {
        let (fanout, gateway, mut rx) = fanout();
        gateway.script_rows(DRIVER_PROFILE.name, vec![driver(json!(1), json!("0"))]);
        gateway.script_rows(OPEN_REQUEST_CUSTOMERS.name, customers(3));

        let report = fanout.location_update(&"drv".into(), &update()).await.unwrap();

        assert_eq!(report.recipients, 0);
        let sent = channels(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel, "V_homemap7");
        assert_eq!(sent[0].payload["check_status"], "1");
        assert_eq!(sent[0].payload["vdriloc"], 0);
        assert_eq!(sent[0].payload["driver"]["id"], "7");

        let updates = gateway.updates(Table::Driver);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0["fstatus"], "1");
        assert_eq!(updates[0].0["latitude"], "24.5");
        assert_eq!(updates[0].1["id"], "7");
    }

    #[tokio::test]
    async fn test_checked_driver_location_capped_at_ten() {
        let (fanout, gateway, mut rx) = fanout();
        gateway.script_rows(DRIVER_PROFILE.name, vec![driver(json!("1"), json!("1"))]);
        gateway.script_rows(OPEN_REQUEST_CUSTOMERS.name, customers(25));

        let report = fanout.location_update(&"drv".into(), &update()).await.unwrap();

        assert!(!report.flags.homemap);
        assert_eq!(report.recipients, 10);
        let sent = channels(&mut rx);
        assert_eq!(sent.len(), 10);
        assert!(sent.iter().all(|m| m.channel.starts_with("V_Driver_Location")));
        assert_eq!(sent[0].channel, "V_Driver_Locationc0");
        assert_eq!(sent[0].payload["d_id"], "7");
    }

    #[tokio::test]
    async fn test_inactive_driver_is_ignored() {
        let (fanout, gateway, mut rx) = fanout();
        let report = fanout.location_update(&"drv".into(), &update()).await.unwrap();

        assert_eq!(report, FanoutReport::default());
        assert_eq!(gateway.calls(ops::UPDATE), 0);
        assert!(channels(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_failed_persist_emits_nothing() {
        let (fanout, gateway, mut rx) = fanout();
        gateway.script_rows(DRIVER_PROFILE.name, vec![driver(json!("0"), json!("0"))]);
        gateway.fail(ops::UPDATE);

        let err = fanout.location_update(&"drv".into(), &update()).await;
        assert!(matches!(err, Err(DispatchError::Gateway { .. })));
        assert!(channels(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_fare_context_capped_at_fifty() {
        let (fanout, gateway, mut rx) = fanout();
        gateway.script_rows(
            DRIVER_POSITION.name,
            vec![json!({"id": "7", "latitude": "1", "longitude": "2"})],
        );
        gateway.script_rows(FARE_VISIBLE_CUSTOMERS.name, customers(80));

        let sent = fanout.fare_context(&"drv".into(), "7").await.unwrap();

        assert_eq!(sent, 50);
        assert_eq!(channels(&mut rx).len(), 50);
    }

    #[tokio::test]
    async fn test_fare_context_without_position() {
        let (fanout, gateway, _rx) = fanout();
        gateway.script_rows(FARE_VISIBLE_CUSTOMERS.name, customers(5));
        assert_eq!(fanout.fare_context(&"drv".into(), "7").await.unwrap(), 0);
    }
}
