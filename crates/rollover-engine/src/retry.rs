use std::sync::Arc;
use std::time::Duration;

use broker_gateway::{BrokerApi, OrderAction, PlaceOrderRequest};
use serde::Serialize;

/// Rollover leg executor with tighter parameters than the entry path:
/// LIMIT at a small buffer past the quote, a fixed increment per retry,
/// and a market order once the retries are spent. Rollovers trade near
/// expiry where spreads are thin, so the walk is deliberately short.
#[derive(Debug, Clone)]
pub struct RetryExecutorConfig {
    pub initial_buffer_pct: f64,
    pub increment_pct: f64,
    pub max_retries: u32,
    pub retry_interval: Duration,
}

impl Default for RetryExecutorConfig {
    fn default() -> Self {
        Self {
            initial_buffer_pct: 0.0025,
            increment_pct: 0.0005,
            max_retries: 5,
            retry_interval: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub fill_price: f64,
    pub attempts: u32,
    pub used_market: bool,
    pub error: Option<String>,
}

impl OrderResult {
    fn failed(error: impl Into<String>, attempts: u32) -> Self {
        Self {
            success: false,
            order_id: None,
            fill_price: 0.0,
            attempts,
            used_market: false,
            error: Some(error.into()),
        }
    }
}

pub struct RetryOrderExecutor {
    broker: Arc<dyn BrokerApi>,
    config: RetryExecutorConfig,
}

impl RetryOrderExecutor {
    pub fn new(broker: Arc<dyn BrokerApi>, config: RetryExecutorConfig) -> Self {
        Self { broker, config }
    }

    pub async fn execute(
        &self,
        symbol: &str,
        exchange: &str,
        action: OrderAction,
        quantity: i32,
        label: &str,
    ) -> OrderResult {
        let quote = match self.broker.quote(symbol, exchange).await {
            Ok(q) => q,
            Err(e) => return OrderResult::failed(format!("quote_failed: {e}"), 0),
        };
        let Some(base_price) = quote.mid() else {
            return OrderResult::failed("no_quote", 0);
        };

        let direction = match action {
            OrderAction::Buy => 1.0,
            OrderAction::Sell => -1.0,
        };
        let initial_price = base_price * (1.0 + direction * self.config.initial_buffer_pct);

        tracing::info!(
            label,
            symbol,
            action = action.as_str(),
            quantity,
            initial_price,
            "placing rollover limit order"
        );

        let request = PlaceOrderRequest::limit(symbol, action, quantity, exchange, round2(initial_price));
        let response = match self.broker.place_order(&request).await {
            Ok(r) if r.is_success() && r.orderid.is_some() => r,
            Ok(r) => {
                return OrderResult::failed(
                    format!("placement_rejected: {}", r.message.as_deref().unwrap_or("unknown")),
                    1,
                )
            }
            Err(e) => return OrderResult::failed(format!("placement_error: {e}"), 1),
        };
        let order_id = response.orderid.unwrap_or_default();

        for attempt in 1..=self.config.max_retries {
            tokio::time::sleep(self.config.retry_interval).await;

            match self.broker.order_status(&order_id).await {
                Ok(Some(status)) if status.is_complete() => {
                    let fill_price = status.effective_fill_price().unwrap_or(initial_price);
                    tracing::info!(label, fill_price, attempt, "rollover leg filled");
                    return OrderResult {
                        success: true,
                        order_id: Some(order_id),
                        fill_price,
                        attempts: attempt,
                        used_market: false,
                        error: None,
                    };
                }
                Ok(Some(status)) if status.is_terminal_failure() => {
                    return OrderResult::failed(format!("order_{}", status.status.to_lowercase()), attempt);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(label, error = %e, "error polling rollover order");
                }
            }

            if attempt < self.config.max_retries {
                let new_price = base_price
                    * (1.0
                        + direction
                            * (self.config.initial_buffer_pct
                                + self.config.increment_pct * attempt as f64));
                if let Err(e) = self.broker.modify_order(&order_id, round2(new_price)).await {
                    tracing::warn!(label, error = %e, "rollover order modify failed");
                }
            }
        }

        // Retries exhausted: cancel and fall back to market.
        tracing::warn!(label, symbol, "rollover limit unfilled, falling back to market");
        if let Err(e) = self.broker.cancel_order(&order_id).await {
            tracing::warn!(error = %e, "failed to cancel rollover limit order");
        }

        let market = PlaceOrderRequest::market(symbol, action, quantity, exchange);
        let response = match self.broker.place_order(&market).await {
            Ok(r) if r.is_success() && r.orderid.is_some() => r,
            Ok(r) => {
                return OrderResult::failed(
                    format!("market_rejected: {}", r.message.as_deref().unwrap_or("unknown")),
                    self.config.max_retries + 1,
                )
            }
            Err(e) => {
                return OrderResult::failed(
                    format!("market_error: {e}"),
                    self.config.max_retries + 1,
                )
            }
        };
        let market_id = response.orderid.unwrap_or_default();

        tokio::time::sleep(self.config.retry_interval.min(Duration::from_secs(2))).await;
        let fill_price = match self.broker.order_status(&market_id).await {
            Ok(Some(status)) if status.is_complete() => {
                status.effective_fill_price().unwrap_or(base_price)
            }
            _ => base_price,
        };

        OrderResult {
            success: true,
            order_id: Some(market_id),
            fill_price,
            attempts: self.config.max_retries + 1,
            used_market: true,
            error: None,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
