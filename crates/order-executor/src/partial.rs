//! Partial-fill handling shared by the limit executors.

use std::sync::Arc;

use broker_gateway::{BrokerApi, OrderType, PlaceOrderRequest};
use signal_core::config::PartialFillMode;

use crate::{slippage, ExecOutcome, ExecutionStatus, ExecutorConfig, OrderSpec};

/// Resolve a partially filled order per the configured strategy.
///
/// - `Cancel`: cancel the residual immediately (default);
/// - `Wait`: keep polling for the rest within a bounded window;
/// - `Reattempt`: cancel, replace the residual 0.1% more aggressively and
///   merge fills by weighted average.
pub async fn handle_partial_fill(
    broker: &Arc<dyn BrokerApi>,
    config: &ExecutorConfig,
    spec: &OrderSpec,
    order_id: &str,
    filled_lots: i32,
    remaining_lots: i32,
    avg_fill_price: f64,
) -> ExecOutcome {
    match config.partial_fill {
        PartialFillMode::Cancel => {
            cancel_quiet(broker, order_id).await;
            partial_outcome(
                spec,
                order_id,
                filled_lots,
                remaining_lots,
                avg_fill_price,
                "partial_fill_remaining_cancelled",
            )
        }

        PartialFillMode::Wait => {
            tracing::info!(
                order_id,
                remaining_lots,
                timeout = ?config.partial_fill_wait,
                "waiting for partial order to complete"
            );
            let deadline = tokio::time::Instant::now() + config.partial_fill_wait;
            loop {
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(config.poll_interval).await;
                match broker.order_status(order_id).await {
                    Ok(Some(status)) if status.is_complete() => {
                        let price = status.effective_fill_price().unwrap_or(avg_fill_price);
                        let lots = status.filled_lots.unwrap_or(spec.lots);
                        tracing::info!(order_id, lots, price, "order completed during wait");
                        let mut outcome =
                            ExecOutcome::executed(price, lots, spec.signal_price, Some(order_id.to_string()), 1);
                        outcome.notes = Some("partial_fill_completed_after_wait".to_string());
                        return outcome;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(order_id, error = %e, "error polling partial order");
                    }
                }
            }
            tracing::warn!(order_id, remaining_lots, "wait timeout, cancelling remainder");
            cancel_quiet(broker, order_id).await;
            partial_outcome(
                spec,
                order_id,
                filled_lots,
                remaining_lots,
                avg_fill_price,
                "partial_fill_wait_timeout_cancelled",
            )
        }

        PartialFillMode::Reattempt => {
            cancel_quiet(broker, order_id).await;
            // 0.1% more aggressive for the residual.
            let direction = match spec.action {
                broker_gateway::OrderAction::Buy => 1.0,
                broker_gateway::OrderAction::Sell => -1.0,
            };
            let adjusted_price = avg_fill_price * (1.0 + direction * 0.001);
            tracing::info!(
                order_id,
                remaining_lots,
                adjusted_price,
                "reattempting residual at adjusted price"
            );

            let request = PlaceOrderRequest {
                symbol: spec.symbol.clone(),
                action: spec.action,
                quantity: remaining_lots * spec.lot_size,
                order_type: OrderType::Limit,
                product: "NRML".to_string(),
                exchange: spec.exchange.clone(),
                price: Some(adjusted_price),
            };

            let response = match broker.place_order(&request).await {
                Ok(r) if r.is_success() && r.orderid.is_some() => r,
                Ok(r) => {
                    tracing::warn!(message = ?r.message, "reattempt placement rejected");
                    return partial_outcome(
                        spec,
                        order_id,
                        filled_lots,
                        remaining_lots,
                        avg_fill_price,
                        "partial_fill_reattempt_failed",
                    );
                }
                Err(e) => {
                    tracing::error!(error = %e, "reattempt placement error");
                    return partial_outcome(
                        spec,
                        order_id,
                        filled_lots,
                        remaining_lots,
                        avg_fill_price,
                        "partial_fill_reattempt_error",
                    );
                }
            };
            let new_order_id = response.orderid.unwrap_or_default();

            tokio::time::sleep(config.partial_fill_wait.min(std::time::Duration::from_secs(5))).await;
            match broker.order_status(&new_order_id).await {
                Ok(Some(status)) if status.is_complete() => {
                    let additional = status.filled_lots.unwrap_or(remaining_lots);
                    let additional_price = status.effective_fill_price().unwrap_or(adjusted_price);
                    let total = filled_lots + additional;
                    let weighted = (filled_lots as f64 * avg_fill_price
                        + additional as f64 * additional_price)
                        / total as f64;
                    tracing::info!(additional, additional_price, "reattempt filled");

                    let fully_filled = total == filled_lots + remaining_lots;
                    ExecOutcome {
                        status: if fully_filled {
                            ExecutionStatus::Executed
                        } else {
                            ExecutionStatus::Partial
                        },
                        execution_price: Some(weighted),
                        lots_filled: Some(total),
                        slippage_pct: slippage(weighted, spec.signal_price),
                        rejection_reason: None,
                        order_id: Some(new_order_id),
                        attempts: 1,
                        lots_cancelled: Some((remaining_lots - additional).max(0)),
                        notes: Some("partial_fill_reattempt_successful".to_string()),
                    }
                }
                _ => {
                    cancel_quiet(broker, &new_order_id).await;
                    partial_outcome(
                        spec,
                        order_id,
                        filled_lots,
                        remaining_lots,
                        avg_fill_price,
                        "partial_fill_reattempt_failed",
                    )
                }
            }
        }
    }
}

fn partial_outcome(
    spec: &OrderSpec,
    order_id: &str,
    filled_lots: i32,
    remaining_lots: i32,
    avg_fill_price: f64,
    notes: &str,
) -> ExecOutcome {
    ExecOutcome {
        status: ExecutionStatus::Partial,
        execution_price: Some(avg_fill_price),
        lots_filled: Some(filled_lots),
        slippage_pct: slippage(avg_fill_price, spec.signal_price),
        rejection_reason: None,
        order_id: Some(order_id.to_string()),
        attempts: 1,
        lots_cancelled: Some(remaining_lots),
        notes: Some(notes.to_string()),
    }
}

pub(crate) async fn cancel_quiet(broker: &Arc<dyn BrokerApi>, order_id: &str) {
    if let Err(e) = broker.cancel_order(order_id).await {
        tracing::warn!(order_id, error = %e, "failed to cancel order");
    }
}
