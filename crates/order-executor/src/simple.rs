use std::sync::Arc;

use async_trait::async_trait;

use broker_gateway::{BrokerApi, OrderType, PlaceOrderRequest};

use crate::partial::{cancel_quiet, handle_partial_fill};
use crate::{ExecOutcome, ExecutionStatus, ExecutorConfig, OrderExecutor, OrderSpec};

/// Single limit order at the given price: poll until filled or the timeout
/// lapses, then cancel. No price improvement.
pub struct SimpleLimitExecutor {
    broker: Arc<dyn BrokerApi>,
    config: ExecutorConfig,
}

impl SimpleLimitExecutor {
    pub fn new(broker: Arc<dyn BrokerApi>, config: ExecutorConfig) -> Self {
        Self { broker, config }
    }
}

#[async_trait]
impl OrderExecutor for SimpleLimitExecutor {
    async fn execute(&self, spec: &OrderSpec, limit_price: f64) -> ExecOutcome {
        tracing::info!(
            symbol = %spec.symbol,
            lots = spec.lots,
            limit_price,
            "executing simple limit order"
        );

        let request = PlaceOrderRequest {
            symbol: spec.symbol.clone(),
            action: spec.action,
            quantity: spec.quantity(),
            order_type: OrderType::Limit,
            product: "NRML".to_string(),
            exchange: spec.exchange.clone(),
            price: Some(limit_price),
        };

        let response = match self.broker.place_order(&request).await {
            Ok(r) => r,
            Err(e) => return ExecOutcome::rejected(format!("order_placement_failed: {e}"), 1),
        };
        if !response.is_success() {
            return ExecOutcome::rejected(
                format!(
                    "order_placement_rejected: {}",
                    response.message.as_deref().unwrap_or("unknown")
                ),
                1,
            );
        }
        let Some(order_id) = response.orderid else {
            return ExecOutcome::rejected("no_order_id_returned", 1);
        };

        let deadline = tokio::time::Instant::now() + self.config.simple_timeout;
        let mut attempts: u32 = 1;

        while tokio::time::Instant::now() < deadline {
            match self.broker.order_status(&order_id).await {
                Ok(Some(status)) if status.is_complete() => {
                    let fill_price = status.effective_fill_price().unwrap_or(limit_price);
                    let filled_lots = status.filled_lots.unwrap_or(spec.lots);
                    let outcome = ExecOutcome::executed(
                        fill_price,
                        filled_lots,
                        spec.signal_price,
                        Some(order_id),
                        attempts,
                    );
                    tracing::info!(
                        filled_lots,
                        fill_price,
                        slippage = ?outcome.slippage_pct,
                        "limit order filled"
                    );
                    return outcome;
                }
                Ok(Some(status)) if status.is_partial() => {
                    let filled = status.filled_lots.unwrap_or(0);
                    let remaining = status.remaining_lots.unwrap_or(spec.lots - filled);
                    let avg = status.effective_fill_price().unwrap_or(limit_price);
                    tracing::info!(filled, remaining, "partial fill on simple limit order");
                    return handle_partial_fill(
                        &self.broker,
                        &self.config,
                        spec,
                        &order_id,
                        filled,
                        remaining,
                        avg,
                    )
                    .await;
                }
                Ok(Some(status)) if status.is_terminal_failure() => {
                    return ExecOutcome::rejected(
                        format!("order_{}", status.status.to_lowercase()),
                        attempts,
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "error checking order status");
                }
            }
            tokio::time::sleep(self.config.poll_interval).await;
            attempts += 1;
        }

        tracing::warn!(order_id = %order_id, "limit order timed out, cancelling");
        cancel_quiet(&self.broker, &order_id).await;

        ExecOutcome {
            status: ExecutionStatus::Timeout,
            execution_price: None,
            lots_filled: None,
            slippage_pct: None,
            rejection_reason: Some("timeout_no_fill".to_string()),
            order_id: Some(order_id),
            attempts,
            lots_cancelled: None,
            notes: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{fast_config, MockBroker};
    use broker_gateway::OrderAction;

    fn spec() -> OrderSpec {
        OrderSpec {
            symbol: "GOLDM25DEC31FUT".to_string(),
            exchange: "MCX".to_string(),
            action: OrderAction::Buy,
            lots: 2,
            lot_size: 100,
            signal_price: 75_000.0,
        }
    }

    #[tokio::test]
    async fn fills_on_first_poll() {
        let broker = Arc::new(MockBroker::new());
        broker.push_status(Some(MockBroker::complete("ORD-1", 75_010.0, 2)));
        let executor = SimpleLimitExecutor::new(broker.clone(), fast_config());

        let outcome = executor.execute(&spec(), 75_005.0).await;
        assert_eq!(outcome.status, ExecutionStatus::Executed);
        assert_eq!(outcome.lots_filled, Some(2));
        assert_eq!(outcome.execution_price, Some(75_010.0));
        // Slippage vs the signal price, not the limit price.
        let expected = (75_010.0 - 75_000.0) / 75_000.0;
        assert!((outcome.slippage_pct.unwrap() - expected).abs() < 1e-12);
        assert_eq!(broker.placed_count(), 1);
    }

    #[tokio::test]
    async fn placement_rejection_is_terminal() {
        let broker = Arc::new(MockBroker::new());
        broker.place_failures.lock().unwrap().push_back(true);
        let executor = SimpleLimitExecutor::new(broker, fast_config());

        let outcome = executor.execute(&spec(), 75_005.0).await;
        assert_eq!(outcome.status, ExecutionStatus::Rejected);
        assert!(outcome.rejection_reason.unwrap().starts_with("order_placement_rejected"));
    }

    #[tokio::test]
    async fn timeout_cancels_order() {
        let broker = Arc::new(MockBroker::new());
        // Never completes.
        for _ in 0..50 {
            broker.push_status(Some(MockBroker::pending("ORD-1")));
        }
        let executor = SimpleLimitExecutor::new(broker.clone(), fast_config());

        let outcome = executor.execute(&spec(), 75_005.0).await;
        assert_eq!(outcome.status, ExecutionStatus::Timeout);
        assert_eq!(broker.cancelled.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn partial_fill_cancel_strategy() {
        let broker = Arc::new(MockBroker::new());
        broker.push_status(Some(MockBroker::partial("ORD-1", 1, 1, 75_002.0)));
        let executor = SimpleLimitExecutor::new(broker.clone(), fast_config());

        let outcome = executor.execute(&spec(), 75_005.0).await;
        assert_eq!(outcome.status, ExecutionStatus::Partial);
        assert_eq!(outcome.lots_filled, Some(1));
        assert_eq!(outcome.lots_cancelled, Some(1));
        assert_eq!(outcome.notes.as_deref(), Some("partial_fill_remaining_cancelled"));
        // The residual was cancelled with the broker.
        assert_eq!(broker.cancelled.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exchange_rejection_during_poll() {
        let broker = Arc::new(MockBroker::new());
        broker.push_status(Some(broker_gateway::OrderStatus {
            orderid: "ORD-1".to_string(),
            status: "REJECTED".to_string(),
            ..Default::default()
        }));
        let executor = SimpleLimitExecutor::new(broker, fast_config());

        let outcome = executor.execute(&spec(), 75_005.0).await;
        assert_eq!(outcome.status, ExecutionStatus::Rejected);
        assert_eq!(outcome.rejection_reason.as_deref(), Some("order_rejected"));
    }
}
