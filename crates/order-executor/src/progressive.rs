use std::sync::Arc;

use async_trait::async_trait;

use broker_gateway::{BrokerApi, OrderAction, OrderType, PlaceOrderRequest};

use crate::partial::{cancel_quiet, handle_partial_fill};
use crate::{ExecOutcome, ExecutionStatus, ExecutorConfig, OrderExecutor, OrderSpec};

/// Progressive price-improvement executor.
///
/// Walks the limit price through the configured offsets (default
/// 0 / +0.5% / +1.0% / +1.5% for buys, negated for sells), enforcing the
/// hard slippage ceiling against the signal price before every attempt.
/// Prefers modifying the resting order; cancels and replaces when the
/// modify is refused. After the last attempt the residual is cancelled and
/// a market order goes out as the final resort.
pub struct ProgressiveExecutor {
    broker: Arc<dyn BrokerApi>,
    config: ExecutorConfig,
}

impl ProgressiveExecutor {
    pub fn new(broker: Arc<dyn BrokerApi>, config: ExecutorConfig) -> Self {
        Self { broker, config }
    }

    fn step(&self, attempt: usize) -> f64 {
        self.config
            .improvement_steps
            .get(attempt)
            .copied()
            .unwrap_or_else(|| {
                let last = self.config.improvement_steps.last().copied().unwrap_or(0.0);
                (last + 0.005 * (attempt + 1 - self.config.improvement_steps.len()) as f64)
                    .min(self.config.hard_slippage_limit)
            })
    }

    /// Adverse slippage of a candidate price vs the signal price. Positive
    /// means worse than signalled, for either side.
    fn adverse_slippage(&self, spec: &OrderSpec, price: f64) -> f64 {
        let raw = (price - spec.signal_price) / spec.signal_price;
        match spec.action {
            OrderAction::Buy => raw,
            OrderAction::Sell => -raw,
        }
    }

    async fn market_fallback(&self, spec: &OrderSpec, attempts: u32) -> ExecOutcome {
        tracing::warn!(symbol = %spec.symbol, "all limit attempts exhausted, placing market order");
        let request = PlaceOrderRequest::market(
            spec.symbol.clone(),
            spec.action,
            spec.quantity(),
            &spec.exchange,
        );
        let response = match self.broker.place_order(&request).await {
            Ok(r) if r.is_success() && r.orderid.is_some() => r,
            Ok(r) => {
                tracing::error!(message = ?r.message, "market fallback rejected");
                return ExecOutcome::rejected("market_order_failed", attempts);
            }
            Err(e) => {
                tracing::error!(error = %e, "market fallback error");
                return ExecOutcome::rejected(format!("market_order_error: {e}"), attempts);
            }
        };
        let order_id = response.orderid.unwrap_or_default();

        tokio::time::sleep(self.config.market_confirm_wait).await;
        match self.broker.order_status(&order_id).await {
            Ok(Some(status)) if status.is_complete() => {
                let price = status.effective_fill_price().unwrap_or(spec.signal_price);
                let lots = status.filled_lots.unwrap_or(spec.lots);
                let mut outcome =
                    ExecOutcome::executed(price, lots, spec.signal_price, Some(order_id), attempts + 1);
                outcome.notes = Some("market_fallback".to_string());
                tracing::info!(price, lots, "market fallback filled");
                outcome
            }
            _ => {
                tracing::warn!(order_id = %order_id, "market fallback status unknown");
                ExecOutcome {
                    status: ExecutionStatus::Timeout,
                    execution_price: None,
                    lots_filled: None,
                    slippage_pct: None,
                    rejection_reason: Some("market_order_status_unknown".to_string()),
                    order_id: Some(order_id),
                    attempts: attempts + 1,
                    lots_cancelled: None,
                    notes: Some("market_fallback".to_string()),
                }
            }
        }
    }
}

#[async_trait]
impl OrderExecutor for ProgressiveExecutor {
    async fn execute(&self, spec: &OrderSpec, limit_price: f64) -> ExecOutcome {
        tracing::info!(
            symbol = %spec.symbol,
            action = spec.action.as_str(),
            lots = spec.lots,
            limit_price,
            signal_price = spec.signal_price,
            "executing progressive order"
        );

        let direction = match spec.action {
            OrderAction::Buy => 1.0,
            OrderAction::Sell => -1.0,
        };

        let mut order_id: Option<String> = None;

        for attempt in 0..self.config.max_attempts {
            let attempt_num = attempt as u32 + 1;
            let step = self.step(attempt);
            let attempt_price = limit_price * (1.0 + direction * step);

            // Hard slippage ceiling vs the signal price, checked before the
            // order ever reaches the broker.
            let adverse = self.adverse_slippage(spec, attempt_price);
            if adverse > self.config.hard_slippage_limit {
                tracing::warn!(
                    attempt = attempt_num,
                    adverse_pct = adverse * 100.0,
                    limit_pct = self.config.hard_slippage_limit * 100.0,
                    "attempt would exceed hard slippage limit, aborting"
                );
                if let Some(id) = &order_id {
                    cancel_quiet(&self.broker, id).await;
                }
                return ExecOutcome::rejected("hard_slippage_limit_exceeded", attempt_num);
            }

            tracing::info!(
                attempt = attempt_num,
                max = self.config.max_attempts,
                attempt_price,
                step_pct = step * 100.0,
                "progressive attempt"
            );

            if let Some(id) = order_id.clone() {
                // Improve the resting order in place; cancel+replace when
                // the modify is refused.
                match self.broker.modify_order(&id, attempt_price).await {
                    Ok(r) if r.is_success() => {}
                    Ok(_) | Err(_) => {
                        tracing::warn!(order_id = %id, "modify refused, cancelling and replacing");
                        cancel_quiet(&self.broker, &id).await;
                        order_id = None;
                    }
                }
            }

            if order_id.is_none() {
                let request = PlaceOrderRequest {
                    symbol: spec.symbol.clone(),
                    action: spec.action,
                    quantity: spec.quantity(),
                    order_type: OrderType::Limit,
                    product: "NRML".to_string(),
                    exchange: spec.exchange.clone(),
                    price: Some(attempt_price),
                };
                match self.broker.place_order(&request).await {
                    Ok(r) if r.is_success() && r.orderid.is_some() => {
                        order_id = r.orderid;
                    }
                    Ok(r) => {
                        tracing::warn!(attempt = attempt_num, message = ?r.message, "placement failed");
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(attempt = attempt_num, error = %e, "placement error");
                        continue;
                    }
                }
            }
            let current_id = order_id.clone().unwrap_or_default();

            // Poll for a fill until the attempt interval lapses.
            let deadline = tokio::time::Instant::now() + self.config.attempt_interval;
            loop {
                match self.broker.order_status(&current_id).await {
                    Ok(Some(status)) if status.is_complete() => {
                        let fill_price = status.effective_fill_price().unwrap_or(attempt_price);
                        let filled_lots = status.filled_lots.unwrap_or(spec.lots);
                        let outcome = ExecOutcome::executed(
                            fill_price,
                            filled_lots,
                            spec.signal_price,
                            Some(current_id),
                            attempt_num,
                        );
                        tracing::info!(
                            attempt = attempt_num,
                            filled_lots,
                            fill_price,
                            slippage = ?outcome.slippage_pct,
                            "progressive order filled"
                        );
                        return outcome;
                    }
                    Ok(Some(status)) if status.is_partial() => {
                        let filled = status.filled_lots.unwrap_or(0);
                        let remaining = status.remaining_lots.unwrap_or(spec.lots - filled);
                        let avg = status.effective_fill_price().unwrap_or(attempt_price);
                        tracing::info!(
                            attempt = attempt_num,
                            filled,
                            remaining,
                            "partial fill on progressive order"
                        );
                        return handle_partial_fill(
                            &self.broker,
                            &self.config,
                            spec,
                            &current_id,
                            filled,
                            remaining,
                            avg,
                        )
                        .await;
                    }
                    Ok(Some(status)) if status.is_terminal_failure() => {
                        tracing::warn!(
                            attempt = attempt_num,
                            status = %status.status,
                            "order failed at exchange, replacing next attempt"
                        );
                        order_id = None;
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(attempt = attempt_num, error = %e, "error polling order");
                    }
                }
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }

        if let Some(id) = &order_id {
            cancel_quiet(&self.broker, id).await;
        }
        self.market_fallback(spec, self.config.max_attempts as u32).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{fast_config, MockBroker};

    fn spec(action: OrderAction) -> OrderSpec {
        OrderSpec {
            symbol: "BANKNIFTY25DEC2552000PE".to_string(),
            exchange: "NFO".to_string(),
            action,
            lots: 1,
            lot_size: 35,
            signal_price: 120.0,
        }
    }

    #[tokio::test]
    async fn fills_on_first_attempt() {
        let broker = Arc::new(MockBroker::new());
        broker.push_status(Some(MockBroker::complete("ORD-1", 120.5, 1)));
        let executor = ProgressiveExecutor::new(broker.clone(), fast_config());

        let outcome = executor.execute(&spec(OrderAction::Buy), 120.0).await;
        assert_eq!(outcome.status, ExecutionStatus::Executed);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(broker.placed_count(), 1);
    }

    #[tokio::test]
    async fn improves_price_across_attempts_via_modify() {
        let broker = Arc::new(MockBroker::new());
        // Attempt 1 & 2 never fill, attempt 3 completes.
        broker.push_status(Some(MockBroker::pending("ORD-1")));
        broker.push_status(Some(MockBroker::pending("ORD-1")));
        broker.push_status(Some(MockBroker::complete("ORD-1", 121.2, 1)));
        let executor = ProgressiveExecutor::new(broker.clone(), fast_config());

        let outcome = executor.execute(&spec(OrderAction::Buy), 120.0).await;
        assert_eq!(outcome.status, ExecutionStatus::Executed);
        assert_eq!(outcome.attempts, 3);

        // One placement, then modifies at +0.5% and +1.0%.
        assert_eq!(broker.placed_count(), 1);
        let modified = broker.modified.lock().unwrap();
        assert_eq!(modified.len(), 2);
        assert!((modified[0].1 - 120.0 * 1.005).abs() < 1e-9);
        assert!((modified[1].1 - 120.0 * 1.01).abs() < 1e-9);
    }

    #[tokio::test]
    async fn modify_refusal_triggers_cancel_and_replace() {
        let broker = Arc::new(MockBroker::new());
        broker.push_status(Some(MockBroker::pending("ORD-1")));
        broker.modify_failures.lock().unwrap().push_back(true);
        broker.push_status(Some(MockBroker::complete("", 120.7, 1)));
        let executor = ProgressiveExecutor::new(broker.clone(), fast_config());

        let outcome = executor.execute(&spec(OrderAction::Buy), 120.0).await;
        assert_eq!(outcome.status, ExecutionStatus::Executed);
        // Original order cancelled, replacement placed.
        assert_eq!(broker.cancelled.lock().unwrap().len(), 1);
        assert_eq!(broker.placed_count(), 2);
    }

    #[tokio::test]
    async fn hard_slippage_ceiling_rejects_before_order() {
        let broker = Arc::new(MockBroker::new());
        let executor = ProgressiveExecutor::new(broker.clone(), fast_config());

        // Limit already 2.5% above signal: first attempt breaches the 2% cap.
        let outcome = executor.execute(&spec(OrderAction::Buy), 123.0).await;
        assert_eq!(outcome.status, ExecutionStatus::Rejected);
        assert_eq!(outcome.rejection_reason.as_deref(), Some("hard_slippage_limit_exceeded"));
        assert_eq!(broker.placed_count(), 0);
    }

    #[tokio::test]
    async fn sell_side_improves_downward() {
        let broker = Arc::new(MockBroker::new());
        broker.push_status(Some(MockBroker::pending("ORD-1")));
        broker.push_status(Some(MockBroker::complete("ORD-1", 119.4, 1)));
        let executor = ProgressiveExecutor::new(broker.clone(), fast_config());

        let outcome = executor.execute(&spec(OrderAction::Sell), 120.0).await;
        assert_eq!(outcome.status, ExecutionStatus::Executed);
        let modified = broker.modified.lock().unwrap();
        // Sell improvement lowers the price.
        assert!((modified[0].1 - 120.0 * 0.995).abs() < 1e-9);
    }

    #[tokio::test]
    async fn market_fallback_after_exhausted_attempts() {
        let broker = Arc::new(MockBroker::new());
        // Four attempts never fill...
        for _ in 0..4 {
            broker.push_status(Some(MockBroker::pending("ORD-1")));
        }
        // ...market order confirms.
        broker.push_status(Some(MockBroker::complete("", 121.9, 1)));
        let executor = ProgressiveExecutor::new(broker.clone(), fast_config());

        let outcome = executor.execute(&spec(OrderAction::Buy), 120.0).await;
        assert_eq!(outcome.status, ExecutionStatus::Executed);
        assert_eq!(outcome.notes.as_deref(), Some("market_fallback"));

        // Limit cancelled before the market order went out.
        assert_eq!(broker.cancelled.lock().unwrap().len(), 1);
        let placed = broker.placed.lock().unwrap();
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[1].order_type, broker_gateway::OrderType::Market);
    }

    #[tokio::test]
    async fn market_fallback_failure_is_rejected() {
        let broker = Arc::new(MockBroker::new());
        for _ in 0..4 {
            broker.push_status(Some(MockBroker::pending("ORD-1")));
        }
        // Market placement refused by gateway.
        broker.place_failures.lock().unwrap().push_back(false); // initial limit ok
        broker.place_failures.lock().unwrap().push_back(true); // market rejected
        let executor = ProgressiveExecutor::new(broker.clone(), fast_config());

        let outcome = executor.execute(&spec(OrderAction::Buy), 120.0).await;
        assert_eq!(outcome.status, ExecutionStatus::Rejected);
        assert_eq!(outcome.rejection_reason.as_deref(), Some("market_order_failed"));
    }
}
