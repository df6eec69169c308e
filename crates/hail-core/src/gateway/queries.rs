//! Named, parameterized statements used by the engine.
//!
//! Client-supplied values only ever travel as positional parameters.

use super::Query;
use serde_json::{json, Value};

/// A named statement with `?` placeholders.
#[derive(Debug)]
pub struct Statement {
    pub name: &'static str,
    pub sql: &'static str,
}

/// Active driver with vehicle details and ride/check status.
pub const DRIVER_PROFILE: Statement = Statement {
    name: "driver_profile",
    sql: "SELECT dr.id, dr.zone, COALESCE(ve.map_img, '') AS image, COALESCE(ve.name, '') AS name, \
          COALESCE(ve.description, '') AS description, COALESCE(dr.latitude, '') AS latitude, \
          COALESCE(dr.longitude, '') AS longitude, dr.fstatus, dr.rid_status, dr.check_status \
          FROM tbl_driver AS dr JOIN tbl_vehicle AS ve ON dr.vehicle = ve.id \
          WHERE dr.id = ? AND dr.status = '1' LIMIT 1",
};

/// Customers with an open request on the driver today.
pub const OPEN_REQUEST_CUSTOMERS: Statement = Statement {
    name: "open_request_customers",
    sql: "SELECT c_id FROM tbl_cart_vehicle \
          WHERE d_id = ? AND status IN ('2', '3') AND DATE(date) = CURDATE() LIMIT ?",
};

/// Current position of a driver.
pub const DRIVER_POSITION: Statement = Statement {
    name: "driver_position",
    sql: "SELECT id, COALESCE(latitude, '') AS latitude, COALESCE(longitude, '') AS longitude \
          FROM tbl_driver WHERE id = ? LIMIT 1",
};

/// Customers whose fare context currently shows the driver.
pub const FARE_VISIBLE_CUSTOMERS: Statement = Statement {
    name: "fare_visible_customers",
    sql: "SELECT c_id FROM tbl_cart_vehicle \
          WHERE d_id = ? AND status NOT IN ('0', '7', '8') LIMIT ?",
};

/// The request, if it was offered to the driver.
pub const REQUEST_OFFERED_TO: Statement = Statement {
    name: "request_offered_to",
    sql: "SELECT id, d_id FROM tbl_request_vehicle \
          WHERE id = ? AND (JSON_CONTAINS(d_id, ?) OR JSON_CONTAINS(d_id, ?)) LIMIT 1",
};

/// Drivers that were offered a cart the driver accepted.
pub const CART_DRIVER_LIST: Statement = Statement {
    name: "cart_driver_list",
    sql: "SELECT id, driver_id_list FROM tbl_cart_vehicle \
          WHERE id = ? AND c_id = ? AND d_id = ? LIMIT 1",
};

/// An enabled payment method.
pub const ACTIVE_PAYMENT_METHOD: Statement = Statement {
    name: "active_payment_method",
    sql: "SELECT id, image, name FROM tbl_payment_detail WHERE id = ? AND status = '1' LIMIT 1",
};

#[must_use]
pub fn driver_profile(driver_id: &str) -> Query {
    Query::new(&DRIVER_PROFILE, vec![json!(driver_id)])
}

#[must_use]
pub fn open_request_customers(driver_id: &str, cap: usize) -> Query {
    Query::new(&OPEN_REQUEST_CUSTOMERS, vec![json!(driver_id), json!(cap)])
}

#[must_use]
pub fn driver_position(driver_id: &str) -> Query {
    Query::new(&DRIVER_POSITION, vec![json!(driver_id)])
}

#[must_use]
pub fn fare_visible_customers(driver_id: &str, cap: usize) -> Query {
    Query::new(&FARE_VISIBLE_CUSTOMERS, vec![json!(driver_id), json!(cap)])
}

/// `JSON_CONTAINS` takes a JSON document, so the driver id is passed encoded.
/// Offer lists written by older clients hold numeric ids, so an all-digit id
/// is also matched as a JSON number.
#[must_use]
pub fn request_offered_to(request_id: &str, driver_id: &str) -> Query {
    let as_string = json!(driver_id).to_string();
    let as_number = driver_id
        .parse::<u64>()
        .ok()
        .map(|n| n.to_string())
        .filter(|n| n == driver_id)
        .unwrap_or_else(|| as_string.clone());
    Query::new(
        &REQUEST_OFFERED_TO,
        vec![
            json!(request_id),
            Value::String(as_string),
            Value::String(as_number),
        ],
    )
}

#[must_use]
pub fn cart_driver_list(cart_id: &str, customer_id: &str, driver_id: &str) -> Query {
    Query::new(
        &CART_DRIVER_LIST,
        vec![json!(cart_id), json!(customer_id), json!(driver_id)],
    )
}

#[must_use]
pub fn active_payment_method(payment_id: &str) -> Query {
    Query::new(&ACTIVE_PAYMENT_METHOD, vec![json!(payment_id)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders_match_params() {
        let cases = [
            driver_profile("1"),
            open_request_customers("1", 10),
            driver_position("1"),
            fare_visible_customers("1", 50),
            request_offered_to("9", "1"),
            cart_driver_list("9", "2", "1"),
            active_payment_method("3"),
        ];
        for query in cases {
            assert_eq!(
                query.sql.matches('?').count(),
                query.params.len(),
                "{}",
                query.name
            );
        }
    }

    #[test]
    fn test_client_values_stay_out_of_sql() {
        let query = driver_profile("1' OR '1'='1");
        assert!(!query.sql.contains("OR '1'='1"));
        assert_eq!(query.params[0], "1' OR '1'='1");
    }

    #[test]
    fn test_json_contains_param_is_encoded() {
        let query = request_offered_to("9", "17");
        assert_eq!(query.params[1], "\"17\"");
        assert_eq!(query.params[2], "17");
    }

    #[test]
    fn test_json_contains_non_numeric_id_stays_a_string() {
        let query = request_offered_to("9", "drv-17");
        assert_eq!(query.params[1], "\"drv-17\"");
        assert_eq!(query.params[2], "\"drv-17\"");

        // "017" is not the canonical spelling of 17.
        let query = request_offered_to("9", "017");
        assert_eq!(query.params[2], "\"017\"");
    }
}
