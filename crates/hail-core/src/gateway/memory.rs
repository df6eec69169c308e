//! In-process gateway.
//!
//! Keeps bids in memory and answers reads from rows scripted per statement
//! name. Used by the test suites and by the server's `memory` backend for
//! local runs without the platform database.

use super::{
    BidAcceptance, BidBoard, BidOffer, FareOutcome, Gateway, GatewayError, Query, RideRef, Row,
    Table,
};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Operation names accepted by [`MemoryGateway::fail`] and [`MemoryGateway::hold`].
pub mod ops {
    pub const FIND: &str = "find";
    pub const INSERT: &str = "insert";
    pub const UPDATE: &str = "update";
    pub const DELETE: &str = "delete";
    pub const PLACE_BID: &str = "place_bid";
    pub const RESOLVE_BID_EXPIRY: &str = "resolve_bid_expiry";
    pub const WITHDRAW_BID: &str = "withdraw_bid";
    pub const ACCEPT_BID: &str = "accept_bid";
    pub const COMPUTE_RIDE_FARE: &str = "compute_ride_fare";
    pub const RIDE_PROGRESS: &str = "ride_progress";
    pub const UPDATE_RIDE_TIME: &str = "update_ride_time";
}

/// A live bid held by the memory gateway.
#[derive(Debug, Clone)]
struct StoredBid {
    driver_id: String,
    customer_id: String,
    price: String,
}

/// A gateway backed by process memory.
pub struct MemoryGateway {
    /// Scripted read results by statement name.
    rows: DashMap<&'static str, Vec<Row>>,
    /// Rows written through `insert`.
    tables: DashMap<Table, Vec<Row>>,
    /// `(table, set, filter)` of every update.
    updates: Mutex<Vec<(Table, Row, Row)>>,
    /// Live bids by request id.
    bids: DashMap<String, Vec<StoredBid>>,
    /// Expiry reported for placed bids, in seconds.
    bid_expiry: Mutex<f64>,
    ride_progress: Mutex<Value>,
    fare: Mutex<Value>,
    failing: DashSet<&'static str>,
    held: DashMap<&'static str, Arc<Notify>>,
    calls: DashMap<&'static str, AtomicU64>,
}

impl MemoryGateway {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            tables: DashMap::new(),
            updates: Mutex::new(Vec::new()),
            bids: DashMap::new(),
            bid_expiry: Mutex::new(0.0),
            ride_progress: Mutex::new(json!({"status": "0"})),
            fare: Mutex::new(json!("1")),
            failing: DashSet::new(),
            held: DashMap::new(),
            calls: DashMap::new(),
        }
    }

    /// Answer `find` for `statement` with `rows`.
    pub fn script_rows(&self, statement: &'static str, rows: Vec<Value>) {
        let rows = rows.into_iter().map(super::row).collect();
        self.rows.insert(statement, rows);
    }

    /// Expiry in seconds reported for subsequent placements.
    pub fn set_bid_expiry(&self, seconds: f64) {
        *lock(&self.bid_expiry) = seconds;
    }

    pub fn set_ride_progress(&self, progress: Value) {
        *lock(&self.ride_progress) = progress;
    }

    /// Raw fare answer: a code `"1"`..`"4"` or a settlement object.
    pub fn set_fare(&self, fare: Value) {
        *lock(&self.fare) = fare;
    }

    /// Make every subsequent call to `op` fail.
    pub fn fail(&self, op: &'static str) {
        self.failing.insert(op);
    }

    pub fn recover(&self, op: &'static str) {
        self.failing.remove(op);
    }

    /// Park calls to `op` until the returned handle is notified.
    pub fn hold(&self, op: &'static str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.held.insert(op, Arc::clone(&notify));
        notify
    }

    /// Number of calls made to `op`.
    #[must_use]
    pub fn calls(&self, op: &str) -> u64 {
        self.calls
            .get(op)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Rows written to `table`.
    #[must_use]
    pub fn inserted(&self, table: Table) -> Vec<Row> {
        self.tables
            .get(&table)
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    /// Updates applied to `table`, as `(set, filter)` pairs.
    #[must_use]
    pub fn updates(&self, table: Table) -> Vec<(Row, Row)> {
        lock(&self.updates)
            .iter()
            .filter(|(t, _, _)| *t == table)
            .map(|(_, set, filter)| (set.clone(), filter.clone()))
            .collect()
    }

    /// Drivers with a live bid on `request_id`.
    #[must_use]
    pub fn bidders(&self, request_id: &str) -> Vec<String> {
        self.bids
            .get(request_id)
            .map(|bids| bids.iter().map(|b| b.driver_id.clone()).collect())
            .unwrap_or_default()
    }

    async fn enter(&self, op: &'static str) -> Result<(), GatewayError> {
        self.calls
            .entry(op)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::SeqCst);

        let held = self.held.get(op).map(|n| Arc::clone(n.value()));
        if let Some(notify) = held {
            notify.notified().await;
        }

        if self.failing.contains(op) {
            return Err(GatewayError::Unavailable(format!("{op} is failing")));
        }
        Ok(())
    }

    fn board(&self, request_id: &str, customer_id: &str) -> BidBoard {
        let list: Vec<Value> = self
            .bids
            .get(request_id)
            .map(|bids| {
                bids.iter()
                    .map(|b| json!({"d_id": b.driver_id, "price": b.price}))
                    .collect()
            })
            .unwrap_or_default();

        let mut rest = Map::new();
        rest.insert("request_id".into(), json!(request_id));

        BidBoard {
            customer_id: Some(customer_id.to_string()),
            bidding_list: Value::Array(list),
            off_ex_time: *lock(&self.bid_expiry),
            rest,
        }
    }

    fn remove_bid(&self, request_id: &str, driver_id: &str) {
        if let Some(mut bids) = self.bids.get_mut(request_id) {
            bids.retain(|b| b.driver_id != driver_id);
        }
    }
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn matches(row: &Row, filter: &Row) -> bool {
    filter.iter().all(|(k, v)| row.get(k) == Some(v))
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn find(&self, query: &Query) -> Result<Vec<Row>, GatewayError> {
        self.enter(ops::FIND).await?;
        Ok(self
            .rows
            .get(query.name)
            .map(|rows| rows.clone())
            .unwrap_or_default())
    }

    async fn insert(&self, table: Table, row: Row) -> Result<Row, GatewayError> {
        self.enter(ops::INSERT).await?;
        let mut rows = self.tables.entry(table).or_default();
        let mut stored = row;
        stored.insert("id".into(), json!(rows.len() + 1));
        rows.push(stored.clone());
        Ok(stored)
    }

    async fn update(&self, table: Table, set: Row, filter: Row) -> Result<u64, GatewayError> {
        self.enter(ops::UPDATE).await?;
        let mut affected = 0;
        if let Some(mut rows) = self.tables.get_mut(&table) {
            for row in rows.iter_mut().filter(|r| matches(r, &filter)) {
                row.extend(set.clone());
                affected += 1;
            }
        }
        lock(&self.updates).push((table, set, filter));
        Ok(affected)
    }

    async fn delete(&self, table: Table, filter: Row) -> Result<u64, GatewayError> {
        self.enter(ops::DELETE).await?;
        let Some(mut rows) = self.tables.get_mut(&table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|r| !matches(r, &filter));
        Ok((before - rows.len()) as u64)
    }

    async fn place_bid(&self, offer: &BidOffer) -> Result<Option<BidBoard>, GatewayError> {
        self.enter(ops::PLACE_BID).await?;
        {
            let mut bids = self.bids.entry(offer.request_id.clone()).or_default();
            bids.retain(|b| b.driver_id != offer.driver_id);
            bids.push(StoredBid {
                driver_id: offer.driver_id.clone(),
                customer_id: offer.customer_id.clone(),
                price: offer.price.clone(),
            });
        }
        Ok(Some(self.board(&offer.request_id, &offer.customer_id)))
    }

    async fn resolve_bid_expiry(&self, offer: &BidOffer) -> Result<Option<BidBoard>, GatewayError> {
        self.enter(ops::RESOLVE_BID_EXPIRY).await?;
        self.remove_bid(&offer.request_id, &offer.driver_id);
        Ok(Some(self.board(&offer.request_id, &offer.customer_id)))
    }

    async fn withdraw_bid(&self, offer: &BidOffer) -> Result<Option<BidBoard>, GatewayError> {
        self.enter(ops::WITHDRAW_BID).await?;
        self.remove_bid(&offer.request_id, &offer.driver_id);
        Ok(Some(self.board(&offer.request_id, &offer.customer_id)))
    }

    async fn accept_bid(&self, acceptance: &BidAcceptance) -> Result<Option<Value>, GatewayError> {
        self.enter(ops::ACCEPT_BID).await?;
        let Some((_, bids)) = self.bids.remove(&acceptance.request_id) else {
            return Ok(None);
        };
        let Some(winner) = bids.iter().find(|b| b.driver_id == acceptance.driver_id) else {
            return Ok(None);
        };
        Ok(Some(json!({
            "request_id": acceptance.request_id,
            "c_id": winner.customer_id,
            "d_id": winner.driver_id,
            "price": acceptance.price,
            "status": "accepted",
        })))
    }

    async fn compute_ride_fare(&self, _ride: &RideRef) -> Result<FareOutcome, GatewayError> {
        self.enter(ops::COMPUTE_RIDE_FARE).await?;
        let fare = lock(&self.fare).clone();
        FareOutcome::from_value(&fare)
    }

    async fn ride_progress(&self, ride: &RideRef) -> Result<Value, GatewayError> {
        self.enter(ops::RIDE_PROGRESS).await?;
        let mut progress = lock(&self.ride_progress).clone();
        if let Value::Object(map) = &mut progress {
            map.entry("request_id")
                .or_insert_with(|| json!(ride.request_id));
        }
        Ok(progress)
    }

    async fn update_ride_time(&self, update: &Value) -> Result<bool, GatewayError> {
        self.enter(ops::UPDATE_RIDE_TIME).await?;
        Ok(update.get("c_id").is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{queries, row};

    fn offer(driver: &str, request: &str) -> BidOffer {
        BidOffer {
            driver_id: driver.into(),
            request_id: request.into(),
            customer_id: "c1".into(),
            price: "10".into(),
        }
    }

    #[tokio::test]
    async fn test_bids_build_board() {
        let gateway = MemoryGateway::new();
        gateway.set_bid_expiry(15.0);

        gateway.place_bid(&offer("d1", "r1")).await.unwrap();
        let board = gateway.place_bid(&offer("d2", "r1")).await.unwrap().unwrap();

        assert_eq!(board.bidding_list.as_array().unwrap().len(), 2);
        assert_eq!(board.off_ex_time, 15.0);

        let board = gateway.withdraw_bid(&offer("d1", "r1")).await.unwrap().unwrap();
        assert_eq!(board.bidding_list.as_array().unwrap().len(), 1);
        assert_eq!(gateway.bidders("r1"), vec!["d2".to_string()]);
    }

    #[tokio::test]
    async fn test_accept_requires_live_bid() {
        let gateway = MemoryGateway::new();
        let acceptance = BidAcceptance {
            customer_id: "c1".into(),
            driver_id: "d1".into(),
            price: "10".into(),
            request_id: "r1".into(),
        };
        assert!(gateway.accept_bid(&acceptance).await.unwrap().is_none());

        gateway.place_bid(&offer("d1", "r1")).await.unwrap();
        let accepted = gateway.accept_bid(&acceptance).await.unwrap().unwrap();
        assert_eq!(accepted["d_id"], "d1");
        assert!(gateway.bidders("r1").is_empty());
    }

    #[tokio::test]
    async fn test_failing_op() {
        let gateway = MemoryGateway::new();
        gateway.fail(ops::FIND);
        assert!(gateway.find(&queries::driver_profile("1")).await.is_err());
        gateway.recover(ops::FIND);
        assert!(gateway.find(&queries::driver_profile("1")).await.unwrap().is_empty());
        assert_eq!(gateway.calls(ops::FIND), 2);
    }

    #[tokio::test]
    async fn test_table_writes() {
        let gateway = MemoryGateway::new();
        let stored = gateway
            .insert(Table::Chat, row(json!({"sender_id": "1", "message": "hi"})))
            .await
            .unwrap();
        assert_eq!(stored["id"], 1);

        let affected = gateway
            .update(
                Table::Chat,
                row(json!({"message": "edited"})),
                row(json!({"sender_id": "1"})),
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);
        assert_eq!(gateway.inserted(Table::Chat)[0]["message"], "edited");

        let removed = gateway
            .delete(Table::Chat, row(json!({"sender_id": "1"})))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(gateway.inserted(Table::Chat).is_empty());
    }
}
