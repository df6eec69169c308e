//! Gateway backed by the platform's HTTP API.
//!
//! Every operation is a JSON `POST` under the configured base URL. Reads send
//! the statement name, text and positional parameters; the backend binds the
//! parameters itself.

use crate::config::{Backend, GatewayConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use hail_core::gateway::{
    BidAcceptance, BidBoard, BidOffer, FareOutcome, Gateway, GatewayError, Query, RideRef, Row,
    Table,
};
use hail_core::MemoryGateway;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

/// Build the gateway selected by the configuration.
///
/// # Errors
///
/// Returns an error if the HTTP client cannot be constructed.
pub fn build(config: &GatewayConfig) -> Result<Arc<dyn Gateway>> {
    match config.backend {
        Backend::Memory => {
            warn!("Using in-memory gateway; ride and bid state will not persist");
            Ok(Arc::new(MemoryGateway::new()))
        }
        Backend::Http => Ok(Arc::new(HttpGateway::new(
            &config.base_url,
            Duration::from_millis(config.timeout_ms),
        )?)),
    }
}

#[derive(Debug, Deserialize)]
struct Rows {
    rows: Vec<Row>,
}

#[derive(Debug, Deserialize)]
struct Affected {
    affected: u64,
}

#[derive(Debug, Deserialize)]
struct Updated {
    updated: bool,
}

/// JSON-over-HTTP gateway client.
pub struct HttpGateway {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpGateway {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build gateway HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    async fn call<B, T>(&self, path: &str, body: &B) -> Result<T, GatewayError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, path);
        trace!(url = %url, "Gateway request");

        let response = self
            .http_client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("{path}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(GatewayError::Query(format!("{path}: {status} {detail}")));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| GatewayError::Decode(format!("{path}: {e}")))
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn find(&self, query: &Query) -> Result<Vec<Row>, GatewayError> {
        let found: Rows = self.call("query", query).await?;
        Ok(found.rows)
    }

    async fn insert(&self, table: Table, row: Row) -> Result<Row, GatewayError> {
        self.call(&format!("tables/{}/insert", table.as_str()), &json!({ "row": row }))
            .await
    }

    async fn update(&self, table: Table, set: Row, filter: Row) -> Result<u64, GatewayError> {
        let affected: Affected = self
            .call(
                &format!("tables/{}/update", table.as_str()),
                &json!({ "set": set, "filter": filter }),
            )
            .await?;
        Ok(affected.affected)
    }

    async fn delete(&self, table: Table, filter: Row) -> Result<u64, GatewayError> {
        let affected: Affected = self
            .call(
                &format!("tables/{}/delete", table.as_str()),
                &json!({ "filter": filter }),
            )
            .await?;
        Ok(affected.affected)
    }

    async fn place_bid(&self, offer: &BidOffer) -> Result<Option<BidBoard>, GatewayError> {
        self.call("bids/place", offer).await
    }

    async fn resolve_bid_expiry(&self, offer: &BidOffer) -> Result<Option<BidBoard>, GatewayError> {
        self.call("bids/expire", offer).await
    }

    async fn withdraw_bid(&self, offer: &BidOffer) -> Result<Option<BidBoard>, GatewayError> {
        self.call("bids/withdraw", offer).await
    }

    async fn accept_bid(&self, acceptance: &BidAcceptance) -> Result<Option<Value>, GatewayError> {
        self.call("bids/accept", acceptance).await
    }

    async fn compute_ride_fare(&self, ride: &RideRef) -> Result<FareOutcome, GatewayError> {
        let fare: Value = self.call("rides/fare", ride).await?;
        FareOutcome::from_value(&fare)
    }

    async fn ride_progress(&self, ride: &RideRef) -> Result<Value, GatewayError> {
        self.call("rides/progress", ride).await
    }

    async fn update_ride_time(&self, update: &Value) -> Result<bool, GatewayError> {
        let updated: Updated = self.call("rides/time", update).await?;
        Ok(updated.updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Path, routing::post, Json, Router};
    use hail_core::gateway::queries;
    use tokio::net::TcpListener;

    async fn backend() -> String {
        let app = Router::new()
            .route(
                "/query",
                post(|Json(query): Json<Value>| async move {
                    Json(json!({
                        "rows": [{"statement": query["name"], "param": query["params"][0]}],
                    }))
                }),
            )
            .route(
                "/tables/:table/update",
                post(|Path(table): Path<String>| async move {
                    let affected = if table == "tbl_driver" { 1 } else { 0 };
                    Json(json!({ "affected": affected }))
                }),
            )
            .route(
                "/bids/place",
                post(|Json(offer): Json<Value>| async move {
                    Json(json!({
                        "c_id": offer["customer_id"],
                        "bidding_list": [{"d_id": offer["driver_id"], "price": offer["price"]}],
                        "off_ex_time": "45",
                    }))
                }),
            )
            .route("/bids/withdraw", post(|| async { Json(Value::Null) }))
            .route("/rides/fare", post(|| async { Json(json!("2")) }))
            .route(
                "/rides/time",
                post(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
            );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    fn offer() -> BidOffer {
        BidOffer {
            driver_id: "7".into(),
            request_id: "3".into(),
            customer_id: "9".into(),
            price: "18".into(),
        }
    }

    #[tokio::test]
    async fn test_find_sends_statement_and_params() {
        let gateway = HttpGateway::new(&backend().await, Duration::from_secs(5)).unwrap();
        let rows = gateway.find(&queries::driver_profile("42")).await.unwrap();
        assert_eq!(rows[0]["statement"], "driver_profile");
        assert_eq!(rows[0]["param"], "42");
    }

    #[tokio::test]
    async fn test_bid_operations() {
        let gateway = HttpGateway::new(&backend().await, Duration::from_secs(5)).unwrap();

        let board = gateway.place_bid(&offer()).await.unwrap().unwrap();
        assert_eq!(board.customer_id.as_deref(), Some("9"));
        assert_eq!(board.expiry(), Some(Duration::from_secs(45)));

        assert!(gateway.withdraw_bid(&offer()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_table_update_and_fare() {
        let gateway = HttpGateway::new(&backend().await, Duration::from_secs(5)).unwrap();

        let affected = gateway
            .update(Table::Driver, Row::new(), Row::new())
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let ride = RideRef {
            driver_id: "7".into(),
            customer_id: "9".into(),
            request_id: "3".into(),
        };
        assert_eq!(
            gateway.compute_ride_fare(&ride).await.unwrap(),
            FareOutcome::StepsIncomplete
        );
    }

    #[tokio::test]
    async fn test_error_status_is_query_error() {
        let gateway = HttpGateway::new(&backend().await, Duration::from_secs(5)).unwrap();
        let err = gateway.update_ride_time(&json!({"c_id": "9"})).await;
        assert!(matches!(err, Err(GatewayError::Query(_))));
    }

    #[tokio::test]
    async fn test_unreachable_backend() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let gateway = HttpGateway::new(&format!("http://{addr}"), Duration::from_secs(2)).unwrap();
        let err = gateway.find(&queries::driver_profile("1")).await;
        assert!(matches!(err, Err(GatewayError::Unavailable(_))));
    }

    #[test]
    fn test_build_selects_backend() {
        assert!(build(&GatewayConfig::default()).is_ok());
    }
}
