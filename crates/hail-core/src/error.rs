//! Errors surfaced by event handlers.

use crate::gateway::GatewayError;
use serde_json::{json, Value};
use thiserror::Error;

/// Failure of a single dispatched event.
///
/// Every variant is reported to the originating connection only.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A required payload field is absent or falsy.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// The payload is present but unusable.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The event name is not part of the contract.
    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    /// A gateway call failed; the operation was aborted.
    #[error("{context} failed: {source}")]
    Gateway {
        context: &'static str,
        #[source]
        source: GatewayError,
    },
}

impl DispatchError {
    /// Wrap a gateway failure with the operation it aborted.
    #[must_use]
    pub fn gateway(context: &'static str, source: GatewayError) -> Self {
        Self::Gateway { context, source }
    }

    /// Short classification used in the error payload and in metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingField(_) | Self::InvalidPayload(_) | Self::UnknownEvent(_) => {
                "validation"
            }
            Self::Gateway { .. } => "gateway",
        }
    }

    /// Payload of the error event sent back to the client.
    #[must_use]
    pub fn to_payload(&self) -> Value {
        match self {
            Self::MissingField(field) => json!({
                "kind": self.kind(),
                "message": "Missing required fields",
                "field": field,
            }),
            Self::Gateway { context, .. } => json!({
                "kind": self.kind(),
                "message": format!("{context} error occurred"),
            }),
            other => json!({
                "kind": other.kind(),
                "message": other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_field_payload() {
        let payload = DispatchError::MissingField("c_id").to_payload();
        assert_eq!(payload["kind"], "validation");
        assert_eq!(payload["message"], "Missing required fields");
        assert_eq!(payload["field"], "c_id");
    }

    #[test]
    fn test_gateway_payload_hides_details() {
        let err = DispatchError::gateway(
            "Bidding",
            GatewayError::Unavailable("connection refused".into()),
        );
        let payload = err.to_payload();
        assert_eq!(payload["kind"], "gateway");
        assert_eq!(payload["message"], "Bidding error occurred");
        assert!(err.to_string().contains("connection refused"));
    }
}
