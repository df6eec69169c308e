//! The closed event contract shared with mobile and web clients.
//!
//! Event names and their required payload fields are part of the versioned
//! client contract and must not change spelling, including the historical
//! `recevier_id` field of `Send_Chat`.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Inbound event names accepted by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    Home,
    HomeMap,
    VehicleRequest,
    VehicleBidding,
    RequestTimeOut,
    AcceptBidding,
    AcceptVehicleRequest,
    AcceptRemoveOther,
    VehicleTimeUpdate,
    VehicleTimeRequest,
    VehicleAcceptCancel,
    DriverIAmHere,
    RideCancel,
    RideOtp,
    RideStartEnd,
    DropLocationList,
    PaymentChange,
    RideComplete,
    SendChat,
}

impl EventName {
    /// Every event in the contract.
    pub const ALL: [EventName; 19] = [
        EventName::Home,
        EventName::HomeMap,
        EventName::VehicleRequest,
        EventName::VehicleBidding,
        EventName::RequestTimeOut,
        EventName::AcceptBidding,
        EventName::AcceptVehicleRequest,
        EventName::AcceptRemoveOther,
        EventName::VehicleTimeUpdate,
        EventName::VehicleTimeRequest,
        EventName::VehicleAcceptCancel,
        EventName::DriverIAmHere,
        EventName::RideCancel,
        EventName::RideOtp,
        EventName::RideStartEnd,
        EventName::DropLocationList,
        EventName::PaymentChange,
        EventName::RideComplete,
        EventName::SendChat,
    ];

    /// The wire spelling of the event.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EventName::Home => "home",
            EventName::HomeMap => "homemap",
            EventName::VehicleRequest => "vehiclerequest",
            EventName::VehicleBidding => "Vehicle_Bidding",
            EventName::RequestTimeOut => "RequestTimeOut",
            EventName::AcceptBidding => "Accept_Bidding",
            EventName::AcceptVehicleRequest => "acceptvehrequest",
            EventName::AcceptRemoveOther => "AcceRemoveOther",
            EventName::VehicleTimeUpdate => "Vehicle_Time_update",
            EventName::VehicleTimeRequest => "Vehicle_Time_Request",
            EventName::VehicleAcceptCancel => "Vehicle_Accept_Cancel",
            EventName::DriverIAmHere => "Vehicle_D_IAmHere",
            EventName::RideCancel => "Vehicle_Ride_Cancel",
            EventName::RideOtp => "Vehicle_Ride_OTP",
            EventName::RideStartEnd => "Vehicle_Ride_Start_End",
            EventName::DropLocationList => "drop_location_list",
            EventName::PaymentChange => "Vehicle_P_Change",
            EventName::RideComplete => "Vehicle_Ride_Complete",
            EventName::SendChat => "Send_Chat",
        }
    }

    /// Payload fields that must be present (and truthy) for the event.
    #[must_use]
    pub const fn required_fields(self) -> &'static [&'static str] {
        match self {
            EventName::HomeMap => &["uid", "lat", "long", "status"],
            EventName::VehicleBidding => &["uid", "request_id", "c_id", "price", "status"],
            EventName::AcceptBidding => &["uid", "d_id", "price", "request_id"],
            EventName::AcceptVehicleRequest => &["uid", "request_id", "c_id"],
            EventName::VehicleTimeUpdate => &["c_id"],
            EventName::VehicleTimeRequest => &["d_id"],
            EventName::VehicleAcceptCancel => &["uid", "request_id", "c_id"],
            EventName::RideStartEnd => &["uid", "c_id", "request_id"],
            EventName::DropLocationList => &["d_id", "c_id", "r_id"],
            EventName::PaymentChange => &["payment_id", "d_id", "userid"],
            EventName::RideComplete => &["d_id"],
            EventName::SendChat => &["sender_id", "recevier_id", "message", "status"],
            EventName::Home
            | EventName::VehicleRequest
            | EventName::RequestTimeOut
            | EventName::AcceptRemoveOther
            | EventName::DriverIAmHere
            | EventName::RideCancel
            | EventName::RideOtp => &[],
        }
    }

    /// Whether the event must carry a non-empty payload even without named fields.
    #[must_use]
    pub const fn requires_payload(self) -> bool {
        matches!(self, EventName::VehicleRequest)
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when an event name is not part of the contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown event: {0}")]
pub struct UnknownEvent(pub String);

impl FromStr for EventName {
    type Err = UnknownEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventName::ALL
            .iter()
            .copied()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| UnknownEvent(s.to_string()))
    }
}

/// Outbound channel prefixes that are not themselves inbound events.
pub mod outbound {
    pub const HOMEMAP_DRIVER: &str = "V_homemap";
    pub const DRIVER_LOCATION: &str = "V_Driver_Location";
    pub const BIDDING_DECLINE: &str = "Bidding_decline";
    pub const RIDE_PAYMENT: &str = "Vehicle_Ride_Payment";
    pub const DROP_LOCATION: &str = "drop_location";
    pub const ERROR: &str = "error";
    pub const DATABASE_ERROR: &str = "database_error";
}
