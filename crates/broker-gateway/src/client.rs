use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::models::*;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("broker API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("broker response missing data: {0}")]
    MissingData(&'static str),
}

/// Async seam over the brokerage gateway so executors and tests can swap in
/// stub implementations.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<PlaceOrderResponse, BrokerError>;
    async fn order_status(&self, order_id: &str) -> Result<Option<OrderStatus>, BrokerError>;
    async fn modify_order(&self, order_id: &str, new_price: f64) -> Result<PlaceOrderResponse, BrokerError>;
    async fn cancel_order(&self, order_id: &str) -> Result<PlaceOrderResponse, BrokerError>;
    async fn quote(&self, symbol: &str, exchange: &str) -> Result<Quote, BrokerError>;
    async fn funds(&self) -> Result<Funds, BrokerError>;
    async fn positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;
    async fn close_position(
        &self,
        symbol: &str,
        quantity: i32,
        exchange: &str,
    ) -> Result<PlaceOrderResponse, BrokerError>;
}

/// HTTP client for the brokerage gateway's REST API.
pub struct GatewayClient {
    client: Client,
    base_url: String,
}

impl GatewayClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, BrokerError> {
        let mut headers = header::HeaderMap::new();
        if !api_key.is_empty() {
            if let Ok(value) = header::HeaderValue::from_str(&format!("Bearer {api_key}")) {
                headers.insert(header::AUTHORIZATION, value);
            }
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .default_headers(headers)
            .build()?;
        tracing::info!(base_url, "broker gateway client initialized");
        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string() })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/api/v1/{endpoint}", self.base_url)
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<T, BrokerError> {
        let response = self.client.post(self.url(endpoint)).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(BrokerError::Api { status: status.as_u16(), message });
        }
        Ok(response.json().await?)
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, BrokerError> {
        let response = self.client.get(self.url(endpoint)).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(BrokerError::Api { status: status.as_u16(), message });
        }
        Ok(response.json().await?)
    }
}

#[derive(Debug, serde::Deserialize)]
struct DataEnvelope<T> {
    #[serde(default = "default_status")]
    status: String,
    data: Option<T>,
}

fn default_status() -> String {
    "success".to_string()
}

#[async_trait]
impl BrokerApi for GatewayClient {
    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<PlaceOrderResponse, BrokerError> {
        tracing::info!(
            symbol = %request.symbol,
            action = request.action.as_str(),
            quantity = request.quantity,
            order_type = ?request.order_type,
            "placing order"
        );
        let body = serde_json::to_value(request).unwrap_or_default();
        let response: PlaceOrderResponse = self.post_json("placeorder", &body).await?;
        if response.is_success() {
            tracing::info!(orderid = ?response.orderid, "order placed");
        } else {
            tracing::error!(message = ?response.message, "order placement rejected");
        }
        Ok(response)
    }

    /// Scan the orderbook for the order. Returns `None` when the order is
    /// not present (yet).
    async fn order_status(&self, order_id: &str) -> Result<Option<OrderStatus>, BrokerError> {
        let envelope: DataEnvelope<Vec<OrderStatus>> = self.get_json("orderbook").await?;
        let orders = envelope.data.unwrap_or_default();
        if envelope.status != "success" {
            return Err(BrokerError::MissingData("orderbook"));
        }
        Ok(orders.into_iter().find(|o| o.orderid == order_id))
    }

    async fn modify_order(&self, order_id: &str, new_price: f64) -> Result<PlaceOrderResponse, BrokerError> {
        let body = json!({ "orderid": order_id, "price": new_price });
        let response: PlaceOrderResponse = self.post_json("modifyorder", &body).await?;
        tracing::info!(order_id, new_price, status = %response.status, "order modify requested");
        Ok(response)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<PlaceOrderResponse, BrokerError> {
        let body = json!({ "orderid": order_id });
        let response: PlaceOrderResponse = self.post_json("cancelorder", &body).await?;
        tracing::info!(order_id, status = %response.status, "order cancel requested");
        Ok(response)
    }

    async fn quote(&self, symbol: &str, exchange: &str) -> Result<Quote, BrokerError> {
        let body = json!({ "symbol": symbol, "exchange": exchange });
        let envelope: DataEnvelope<Quote> = self.post_json("quotes", &body).await?;
        envelope.data.ok_or(BrokerError::MissingData("quote"))
    }

    async fn funds(&self) -> Result<Funds, BrokerError> {
        let envelope: DataEnvelope<Funds> = self.get_json("funds").await?;
        envelope.data.ok_or(BrokerError::MissingData("funds"))
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let envelope: DataEnvelope<Vec<BrokerPosition>> = self.get_json("positionbook").await?;
        Ok(envelope.data.unwrap_or_default())
    }

    async fn close_position(
        &self,
        symbol: &str,
        quantity: i32,
        exchange: &str,
    ) -> Result<PlaceOrderResponse, BrokerError> {
        let body = json!({
            "symbol": symbol,
            "quantity": quantity,
            "product": "NRML",
            "exchange": exchange,
        });
        tracing::info!(symbol, quantity, "closing position via gateway");
        self.post_json("closeposition", &body).await
    }
}
