//! Scripted in-memory broker for tests: placements succeed unless a
//! scripted failure is queued, status polls pop from a queue, and every
//! request is recorded for assertions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::client::{BrokerApi, BrokerError};
use crate::models::{
    BrokerPosition, Funds, OrderStatus, PlaceOrderRequest, PlaceOrderResponse, Quote,
};

#[derive(Default)]
pub struct ScriptedBroker {
    next_id: AtomicU64,
    /// Scripted status replies, popped per `order_status` call. `None`
    /// simulates an order missing from the orderbook.
    pub statuses: Mutex<VecDeque<Option<OrderStatus>>>,
    /// Scripted placement failures: each `place_order` pops one; `true`
    /// means the gateway rejects it.
    pub place_failures: Mutex<VecDeque<bool>>,
    /// Scripted modify results (`true` = refuse). Defaults to success.
    pub modify_failures: Mutex<VecDeque<bool>>,
    pub placed: Mutex<Vec<PlaceOrderRequest>>,
    pub modified: Mutex<Vec<(String, f64)>>,
    pub cancelled: Mutex<Vec<String>>,
    pub quote: Mutex<Quote>,
    pub book: Mutex<Vec<BrokerPosition>>,
    pub funds: Mutex<Funds>,
}

impl ScriptedBroker {
    pub fn new() -> Self {
        let broker = Self::default();
        // A funded account by default; tests squeeze it with set_funds.
        broker.set_funds(5_000_000.0);
        broker
    }

    pub fn set_funds(&self, availablecash: f64) {
        self.funds.lock().unwrap().availablecash = availablecash;
    }

    pub fn push_status(&self, status: Option<OrderStatus>) {
        self.statuses.lock().unwrap().push_back(status);
    }

    pub fn push_fill(&self, price: f64, lots: i32) {
        self.push_status(Some(Self::complete("", price, lots)));
    }

    pub fn complete(order_id: &str, fill_price: f64, filled_lots: i32) -> OrderStatus {
        OrderStatus {
            orderid: order_id.to_string(),
            status: "COMPLETE".to_string(),
            fill_price: Some(fill_price),
            filled_lots: Some(filled_lots),
            ..Default::default()
        }
    }

    pub fn pending(order_id: &str) -> OrderStatus {
        OrderStatus {
            orderid: order_id.to_string(),
            status: "PENDING".to_string(),
            ..Default::default()
        }
    }

    pub fn partial(order_id: &str, filled: i32, remaining: i32, price: f64) -> OrderStatus {
        OrderStatus {
            orderid: order_id.to_string(),
            status: "OPEN".to_string(),
            fill_status: Some("PARTIAL".to_string()),
            avg_fill_price: Some(price),
            filled_lots: Some(filled),
            remaining_lots: Some(remaining),
            ..Default::default()
        }
    }

    pub fn placed_count(&self) -> usize {
        self.placed.lock().unwrap().len()
    }

    pub fn set_quote(&self, ltp: f64, bid: f64, ask: f64) {
        *self.quote.lock().unwrap() = Quote { ltp, bid, ask };
    }
}

#[async_trait]
impl BrokerApi for ScriptedBroker {
    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<PlaceOrderResponse, BrokerError> {
        self.placed.lock().unwrap().push(request.clone());
        let fail = self.place_failures.lock().unwrap().pop_front().unwrap_or(false);
        if fail {
            return Ok(PlaceOrderResponse {
                status: "error".to_string(),
                orderid: None,
                message: Some("rejected by exchange".to_string()),
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(PlaceOrderResponse {
            status: "success".to_string(),
            orderid: Some(format!("ORD-{id}")),
            message: None,
        })
    }

    async fn order_status(&self, order_id: &str) -> Result<Option<OrderStatus>, BrokerError> {
        let mut statuses = self.statuses.lock().unwrap();
        match statuses.pop_front() {
            Some(Some(mut status)) => {
                if status.orderid.is_empty() {
                    status.orderid = order_id.to_string();
                }
                Ok(Some(status))
            }
            Some(None) | None => Ok(None),
        }
    }

    async fn modify_order(&self, order_id: &str, new_price: f64) -> Result<PlaceOrderResponse, BrokerError> {
        self.modified.lock().unwrap().push((order_id.to_string(), new_price));
        let fail = self.modify_failures.lock().unwrap().pop_front().unwrap_or(false);
        Ok(PlaceOrderResponse {
            status: if fail { "error" } else { "success" }.to_string(),
            orderid: Some(order_id.to_string()),
            message: None,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<PlaceOrderResponse, BrokerError> {
        self.cancelled.lock().unwrap().push(order_id.to_string());
        Ok(PlaceOrderResponse {
            status: "success".to_string(),
            orderid: Some(order_id.to_string()),
            message: None,
        })
    }

    async fn quote(&self, _symbol: &str, _exchange: &str) -> Result<Quote, BrokerError> {
        Ok(self.quote.lock().unwrap().clone())
    }

    async fn funds(&self) -> Result<Funds, BrokerError> {
        Ok(self.funds.lock().unwrap().clone())
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        Ok(self.book.lock().unwrap().clone())
    }

    async fn close_position(
        &self,
        _symbol: &str,
        _quantity: i32,
        _exchange: &str,
    ) -> Result<PlaceOrderResponse, BrokerError> {
        Ok(PlaceOrderResponse {
            status: "success".to_string(),
            orderid: Some("CLOSE-1".to_string()),
            message: None,
        })
    }
}
