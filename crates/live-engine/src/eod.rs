//! Pre-close EOD phase handlers, fired by the scheduler at T−45/T−30/T−15.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use broker_gateway::{OrderAction, PlaceOrderRequest};
use eod_scheduler::EodCallbacks;
use order_executor::ExecutionStatus;
use position_sizer::{Limiter, SizingConstraints};
use signal_core::{Instrument, Signal, SignalKind, SignalOutcome};

use crate::engine::LiveEngine;
use crate::stats::EngineStats;

/// Adapter wiring the scheduler's three phases into the engine.
pub struct EngineEodHandler {
    engine: Arc<LiveEngine>,
}

impl EngineEodHandler {
    pub fn new(engine: Arc<LiveEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl EodCallbacks for EngineEodHandler {
    async fn condition_check(&self, instrument: Instrument) -> Value {
        self.engine.eod_condition_check(instrument).await
    }

    async fn execute(&self, instrument: Instrument) -> Value {
        self.engine.eod_execute(instrument).await
    }

    async fn track(&self, instrument: Instrument) -> Value {
        self.engine.eod_track(instrument).await
    }
}

impl LiveEngine {
    /// T−45: overwrite the scout's position-status claim with the store's
    /// view and decide whether this close needs an order.
    pub async fn eod_condition_check(&self, instrument: Instrument) -> Value {
        if !self.config.eod_enabled_for(instrument) {
            return json!({ "success": false, "reason": "eod_disabled" });
        }
        tracing::info!(instrument = instrument.as_str(), "EOD condition check");

        let authoritative = self.authoritative_status(instrument).await;
        tracing::info!(
            instrument = instrument.as_str(),
            in_position = authoritative.in_position,
            pyramid_count = authoritative.pyramid_count,
            "authoritative position state"
        );

        match self.eod_monitor.decide_action(instrument, authoritative) {
            None => {
                tracing::info!(instrument = instrument.as_str(), "no EOD action required");
                json!({ "success": true, "action_required": false })
            }
            Some(kind) => {
                let lots = self
                    .eod_monitor
                    .latest(instrument)
                    .and_then(|slot| slot.signal.suggested_lots)
                    .unwrap_or(1)
                    .max(1);
                self.eod_monitor.mark_prepared(instrument, kind, lots);
                tracing::info!(
                    instrument = instrument.as_str(),
                    action = kind.as_str(),
                    lots,
                    "EOD action prepared"
                );
                json!({
                    "success": true,
                    "action_required": true,
                    "signal_type": kind.as_str(),
                    "lots": lots,
                })
            }
        }
    }

    /// T−30: re-read the store (conditions can change between phases) and
    /// submit the order.
    pub async fn eod_execute(&self, instrument: Instrument) -> Value {
        if !self.config.eod_enabled_for(instrument) {
            return json!({ "success": false, "reason": "eod_disabled" });
        }
        let state = self.eod_monitor.execution_state(instrument);
        if state.execution_completed {
            return json!({ "success": true, "action_taken": false, "reason": "already_completed" });
        }

        // Fresh authoritative read at T−30; the store wins over whatever was
        // decided (or declined) at T−45.
        let authoritative = self.authoritative_status(instrument).await;
        let Some(kind) = self.eod_monitor.decide_action(instrument, authoritative) else {
            tracing::info!(instrument = instrument.as_str(), "no admissible EOD action");
            return json!({ "success": true, "action_taken": false });
        };
        let Some(slot) = self.eod_monitor.latest(instrument) else {
            return json!({ "success": false, "reason": "no_signal" });
        };
        let lots = if state.lots > 0 {
            state.lots
        } else {
            slot.signal.suggested_lots.unwrap_or(1).max(1)
        };
        self.eod_monitor.mark_prepared(instrument, kind, lots);

        tracing::info!(
            instrument = instrument.as_str(),
            action = kind.as_str(),
            lots,
            "EOD execution"
        );

        match kind {
            SignalKind::Exit => {
                // Exits run to completion right here; there is nothing to
                // track afterwards.
                let result = self.eod_close_all(instrument, &slot.signal).await;
                self.eod_monitor.mark_filled(instrument, slot.signal.price);
                self.eod_monitor.mark_executed(&slot.signal.eod_fingerprint(), SignalKind::Exit);
                EngineStats::bump(&self.stats.eod_executions);
                result
            }
            SignalKind::BaseEntry | SignalKind::Pyramid if instrument.is_synthetic() => {
                // Two-leg entries track their own fills leg by leg.
                let outcome = self
                    .synthetic
                    .execute_entry(slot.signal.price, lots, self.today_market())
                    .await;
                if outcome.status == ExecutionStatus::Executed {
                    let fill = outcome.synthetic_price().unwrap_or(slot.signal.price);
                    self.apply_eod_fill(instrument, kind, &slot.signal, fill, lots, Some(&outcome))
                        .await;
                    json!({ "success": true, "action_taken": true, "filled": true, "fill_price": fill })
                } else {
                    EngineStats::bump(&self.stats.orders_failed);
                    json!({
                        "success": false,
                        "reason": outcome.rejection_reason,
                        "notes": outcome.notes,
                    })
                }
            }
            SignalKind::BaseEntry | SignalKind::Pyramid => {
                // Single-leg: one limit order at the live mid, tracked at
                // T−15 with a market fallback.
                let symbol = self.eod_contract_symbol(instrument);
                let exchange = instrument.config().exchange.as_str();
                let limit = match self.broker.quote(&symbol, exchange).await {
                    Ok(quote) => quote.mid().unwrap_or(slot.signal.price),
                    Err(_) => slot.signal.price,
                };
                let request = PlaceOrderRequest::limit(
                    symbol.clone(),
                    OrderAction::Buy,
                    lots * instrument.config().lot_size,
                    exchange,
                    limit,
                );
                match self.broker.place_order(&request).await {
                    Ok(response) if response.is_success() && response.orderid.is_some() => {
                        let order_id = response.orderid.unwrap_or_default();
                        self.eod_monitor.mark_order_placed(instrument, &order_id, Utc::now());
                        json!({
                            "success": true,
                            "action_taken": true,
                            "order_id": order_id,
                            "limit_price": limit,
                            "lots": lots,
                        })
                    }
                    Ok(response) => {
                        EngineStats::bump(&self.stats.orders_failed);
                        json!({ "success": false, "reason": response.message })
                    }
                    Err(e) => {
                        EngineStats::bump(&self.stats.orders_failed);
                        json!({ "success": false, "reason": e.to_string() })
                    }
                }
            }
            _ => json!({ "success": false, "reason": "unsupported_action" }),
        }
    }

    /// T−15: poll the resting order; unfilled orders are cancelled and
    /// replaced with a market order before the bell.
    pub async fn eod_track(&self, instrument: Instrument) -> Value {
        if !self.config.eod_enabled_for(instrument) {
            return json!({ "success": false, "reason": "eod_disabled" });
        }
        let state = self.eod_monitor.execution_state(instrument);
        let Some(order_id) = state.order_id.clone() else {
            return json!({ "success": true, "action_taken": false });
        };
        if state.execution_completed {
            return json!({ "success": true, "action_taken": false, "reason": "already_completed" });
        }
        let Some(slot) = self.eod_monitor.latest(instrument) else {
            return json!({ "success": false, "reason": "no_signal" });
        };
        let Some(kind) = state.prepared_kind else {
            return json!({ "success": false, "reason": "no_prepared_action" });
        };

        let mut fallback_used = false;
        let fill_price = match self.broker.order_status(&order_id).await {
            Ok(Some(status)) if status.is_complete() => {
                status.effective_fill_price().unwrap_or(slot.signal.price)
            }
            _ => {
                // Not filled with seconds to the close: cancel and go market.
                tracing::warn!(
                    instrument = instrument.as_str(),
                    order_id = %order_id,
                    "EOD limit unfilled, falling back to market"
                );
                fallback_used = true;
                if let Err(e) = self.broker.cancel_order(&order_id).await {
                    tracing::warn!(error = %e, "failed to cancel EOD limit order");
                }
                let symbol = self.eod_contract_symbol(instrument);
                let exchange = instrument.config().exchange.as_str();
                let request = PlaceOrderRequest::market(
                    symbol,
                    OrderAction::Buy,
                    state.lots * instrument.config().lot_size,
                    exchange,
                );
                match self.broker.place_order(&request).await {
                    Ok(response) if response.is_success() => {
                        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                        let market_id = response.orderid.unwrap_or_default();
                        match self.broker.order_status(&market_id).await {
                            Ok(Some(status)) if status.is_complete() => {
                                status.effective_fill_price().unwrap_or(slot.signal.price)
                            }
                            _ => slot.signal.price,
                        }
                    }
                    _ => {
                        EngineStats::bump(&self.stats.orders_failed);
                        return json!({ "success": false, "reason": "market_fallback_failed" });
                    }
                }
            }
        };

        self.apply_eod_fill(instrument, kind, &slot.signal, fill_price, state.lots, None).await;

        json!({
            "success": true,
            "filled": true,
            "fill_price": fill_price,
            "fallback_used": fallback_used,
            "lots": state.lots,
        })
    }

    fn today_market(&self) -> chrono::NaiveDate {
        Utc::now().with_timezone(&eod_scheduler::market_offset()).date_naive()
    }

    fn eod_contract_symbol(&self, instrument: Instrument) -> String {
        let cfg = instrument.config();
        let expiry = signal_core::symbols::futures_expiry(self.today_market(), cfg.rollover_days);
        signal_core::symbols::futures_symbol(
            cfg.symbol_root,
            &signal_core::symbols::format_expiry(expiry),
            self.config.spaced_symbols(),
        )
    }

    async fn eod_close_all(&self, instrument: Instrument, signal: &Signal) -> Value {
        let mut exit_signal = signal.clone();
        exit_signal.kind = SignalKind::Exit;
        exit_signal.position = "ALL".to_string();
        exit_signal.reason = Some("EOD".to_string());
        let outcome = self.process_exit_for_eod(&exit_signal).await;
        json!({ "success": outcome.status == "executed", "result": outcome })
    }

    async fn process_exit_for_eod(&self, signal: &Signal) -> crate::engine::ProcessOutcome {
        // The standard exit path already carries the closing-status guard
        // and persistence.
        self.dispatch_exit(signal).await
    }

    /// Build and register the position (or pyramid) for a tracked EOD fill,
    /// then mark the bar's fingerprint so the bar-close signal is skipped.
    pub(crate) async fn apply_eod_fill(
        &self,
        instrument: Instrument,
        kind: SignalKind,
        signal: &Signal,
        fill_price: f64,
        lots: i32,
        synthetic: Option<&order_executor::SyntheticOutcome>,
    ) {
        let started = Utc::now();
        let mut portfolio = self.portfolio.lock().await;

        let constraints = SizingConstraints {
            risk_lots: lots,
            margin_lots: lots,
            vol_lots: None,
            profit_lots: None,
            final_lots: lots,
            limiter: Limiter::Input,
            risk_amount: 0.0,
            risk_per_lot: 0.0,
        };
        let is_base = kind == SignalKind::BaseEntry;
        let mut eod_signal = signal.clone();
        eod_signal.kind = kind;

        let position = self.build_position(
            &eod_signal,
            instrument,
            lots,
            fill_price,
            &constraints,
            is_base,
            synthetic,
            None,
        );
        let position_id = position.position_id.clone();

        portfolio.add_position(position.clone());
        portfolio.set_last_pyramid_price(instrument, signal.price);
        self.persist_position(&position).await;
        self.persist_pyramiding(
            instrument,
            signal.price,
            portfolio.base_position_id(instrument).map(String::as_str),
        )
        .await;
        self.persist_portfolio(&portfolio).await;
        drop(portfolio);

        self.eod_monitor.mark_filled(instrument, fill_price);
        self.eod_monitor.mark_executed(&signal.eod_fingerprint(), kind);
        EngineStats::bump(&self.stats.eod_executions);
        if is_base {
            EngineStats::bump(&self.stats.entries_executed);
        } else {
            EngineStats::bump(&self.stats.pyramids_executed);
        }

        let mut record =
            self.audit_base(&eod_signal, SignalOutcome::Processed, "eod_executed", started);
        record.order = Some(signal_core::OrderAudit {
            order_type: Some(format!("EOD_{}", kind.as_str())),
            status: Some("executed".to_string()),
            signal_price: signal.price,
            execution_price: Some(fill_price),
            slippage_pct: order_executor::slippage(fill_price, signal.price),
            attempts: 1,
            ..Default::default()
        });
        self.log_audit(&eod_signal, record).await;

        tracing::info!(
            position_id = %position_id,
            fill_price,
            lots,
            kind = kind.as_str(),
            "EOD fill applied to portfolio"
        );
    }
}
