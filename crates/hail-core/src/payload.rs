//! Helpers for reading loosely typed client payloads.
//!
//! Clients send ids and prices either as JSON strings or as numbers; both are
//! normalised to strings here. A field counts as present only when it is
//! truthy: not absent, `null`, `false`, `0` or `""`.

use crate::error::DispatchError;
use serde_json::Value;

/// Whether a payload value counts as present.
#[must_use]
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// First required field that is missing from `payload`.
#[must_use]
pub fn first_missing(payload: &Value, fields: &[&'static str]) -> Option<&'static str> {
    fields
        .iter()
        .copied()
        .find(|field| !payload.get(*field).is_some_and(is_truthy))
}

/// Render a scalar JSON value as text.
#[must_use]
pub fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Read a required `field` as text.
///
/// # Errors
///
/// Returns [`DispatchError::MissingField`] when the field is absent, falsy or
/// not a scalar.
pub fn require_text(payload: &Value, field: &'static str) -> Result<String, DispatchError> {
    payload
        .get(field)
        .filter(|v| is_truthy(v))
        .and_then(scalar_text)
        .ok_or(DispatchError::MissingField(field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthiness_follows_client_conventions() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!(false)));
        assert!(is_truthy(&json!("0")));
        assert!(is_truthy(&json!(12.5)));
        assert!(is_truthy(&json!({})));
    }

    #[test]
    fn test_first_missing() {
        let payload = json!({"uid": "4", "lat": 24.1, "long": "", "status": "on"});
        assert_eq!(
            first_missing(&payload, &["uid", "lat", "long", "status"]),
            Some("long")
        );
        assert_eq!(first_missing(&payload, &["uid", "status"]), None);
        assert_eq!(first_missing(&json!(null), &["uid"]), Some("uid"));
    }

    #[test]
    fn test_require_text_normalises_numbers() {
        let payload = json!({"request_id": 88, "price": "12.00", "nested": {"a": 1}});
        assert_eq!(require_text(&payload, "request_id").unwrap(), "88");
        assert_eq!(require_text(&payload, "price").unwrap(), "12.00");
        assert!(matches!(
            require_text(&payload, "nested"),
            Err(DispatchError::MissingField("nested"))
        ));
        assert!(require_text(&payload, "absent").is_err());
    }
}
