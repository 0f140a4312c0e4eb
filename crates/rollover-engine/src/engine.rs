use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use broker_gateway::{BrokerApi, OrderAction};
use signal_core::{symbols, Instrument, Position, RolloverStatus};

use crate::retry::{OrderResult, RetryExecutorConfig, RetryOrderExecutor};

#[derive(Debug, Clone)]
pub struct RolloverConfig {
    pub strike_interval: i32,
    pub prefer_1000s: bool,
    pub spaced_symbols: bool,
    pub retry: RetryExecutorConfig,
}

impl Default for RolloverConfig {
    fn default() -> Self {
        Self {
            strike_interval: 100,
            prefer_1000s: false,
            spaced_symbols: false,
            retry: RetryExecutorConfig::default(),
        }
    }
}

/// A position due for rollover.
#[derive(Debug, Clone, Serialize)]
pub struct RolloverCandidate {
    pub position_id: String,
    pub instrument: Instrument,
    pub current_expiry: String,
    pub next_expiry: String,
    pub days_to_expiry: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LegReport {
    pub leg: &'static str,
    pub action: &'static str,
    pub symbol: String,
    pub result: OrderResult,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct RolloverResult {
    pub position_id: String,
    pub success: bool,
    pub old_expiry: Option<String>,
    pub new_expiry: Option<String>,
    pub old_strike: Option<i64>,
    pub new_strike: Option<i64>,
    pub close_legs: Vec<LegReport>,
    pub open_legs: Vec<LegReport>,
    /// Realized P&L from closing the expiring contract.
    pub close_pnl: f64,
    /// Net-premium difference between the old and new contracts.
    pub spread_cost: f64,
    pub total_rollover_cost: f64,
    pub error: Option<String>,
    pub critical: bool,
    pub reconcile_warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct BatchRolloverResult {
    pub scanned: usize,
    pub candidates: usize,
    pub rolled: usize,
    pub failed: usize,
    pub results: Vec<RolloverResult>,
}

/// Close-then-open rollover of expiring derivative positions.
pub struct RolloverEngine {
    broker: Arc<dyn BrokerApi>,
    executor: RetryOrderExecutor,
    config: RolloverConfig,
}

impl RolloverEngine {
    pub fn new(broker: Arc<dyn BrokerApi>, config: RolloverConfig) -> Self {
        let executor = RetryOrderExecutor::new(broker.clone(), config.retry.clone());
        Self { broker, executor, config }
    }

    /// Scan open positions for contracts inside their rollover window.
    pub fn scan_candidates(&self, positions: &[Position], today: NaiveDate) -> Vec<RolloverCandidate> {
        let mut candidates = Vec::new();
        for position in positions {
            if !position.is_open() {
                continue;
            }
            let Some(current_expiry) = position.expiry.as_deref().or(position.contract_month.as_deref())
            else {
                continue;
            };
            let threshold = position.instrument.config().rollover_days;
            let days = match symbols::days_to_expiry(current_expiry, today) {
                Ok(days) => days,
                Err(e) => {
                    tracing::warn!(
                        position_id = %position.position_id,
                        expiry = current_expiry,
                        error = %e,
                        "unparseable expiry, skipping rollover scan"
                    );
                    continue;
                }
            };
            if days > threshold {
                continue;
            }

            // Next contract is derived from the current expiry so the scan
            // is stable across the whole rollover window.
            let current_date = match symbols::parse_expiry(current_expiry) {
                Ok(date) => date,
                Err(_) => continue,
            };
            let next_expiry = if position.instrument.is_synthetic() {
                symbols::format_expiry(symbols::following_month_option_expiry(current_date))
            } else {
                symbols::format_expiry(symbols::following_month_futures_expiry(current_date))
            };

            candidates.push(RolloverCandidate {
                position_id: position.position_id.clone(),
                instrument: position.instrument,
                current_expiry: current_expiry.to_string(),
                next_expiry,
                days_to_expiry: days,
            });
        }
        candidates
    }

    /// Roll a single position in place. Market-hours and tape checks are the
    /// caller's responsibility (it owns the portfolio lock).
    pub async fn rollover_position(
        &self,
        position: &mut Position,
        candidate: &RolloverCandidate,
        now: DateTime<Utc>,
    ) -> RolloverResult {
        if position.instrument.is_synthetic() {
            self.rollover_synthetic(position, candidate, now).await
        } else {
            self.rollover_futures(position, candidate, now).await
        }
    }

    async fn rollover_synthetic(
        &self,
        position: &mut Position,
        candidate: &RolloverCandidate,
        now: DateTime<Utc>,
    ) -> RolloverResult {
        let mut result = RolloverResult {
            position_id: position.position_id.clone(),
            old_expiry: Some(candidate.current_expiry.clone()),
            new_expiry: Some(candidate.next_expiry.clone()),
            old_strike: position.strike,
            ..Default::default()
        };

        let cfg = position.instrument.config();
        let quantity = position.quantity;

        let (Some(old_put), Some(old_call)) = (position.put_symbol.clone(), position.call_symbol.clone())
        else {
            result.error = Some("missing_stored_leg_symbols".to_string());
            result.critical = true;
            return result;
        };

        // New ATM strike from the live underlying.
        let underlying = symbols::futures_symbol(cfg.symbol_root, &candidate.current_expiry, false);
        let current_price = match self.broker.quote(&underlying, cfg.exchange.as_str()).await {
            Ok(q) => q.mid().unwrap_or(0.0),
            Err(_) => 0.0,
        };
        let current_price = if current_price > 0.0 {
            current_price
        } else {
            // Synthetic entry price tracks the underlying closely enough for
            // strike selection when the futures quote is unavailable.
            position.entry_price
        };
        let new_strike =
            symbols::rollover_strike(current_price, self.config.strike_interval, self.config.prefer_1000s);
        result.new_strike = Some(new_strike);

        let new_put = symbols::option_symbol(
            cfg.symbol_root,
            &candidate.next_expiry,
            new_strike,
            "PE",
            self.config.spaced_symbols,
        );
        let new_call = symbols::option_symbol(
            cfg.symbol_root,
            &candidate.next_expiry,
            new_strike,
            "CE",
            self.config.spaced_symbols,
        );

        tracing::info!(
            position_id = %position.position_id,
            old_strike = ?position.strike,
            new_strike,
            old_expiry = %candidate.current_expiry,
            new_expiry = %candidate.next_expiry,
            "rolling synthetic position"
        );

        position.rollover_status = RolloverStatus::InProgress;

        // Close old: BUY put, SELL call.
        let put_close = self
            .executor
            .execute(&old_put, cfg.exchange.as_str(), OrderAction::Buy, quantity, "put close")
            .await;
        result.close_legs.push(LegReport {
            leg: "put",
            action: "BUY",
            symbol: old_put.clone(),
            result: put_close.clone(),
        });
        if !put_close.success {
            result.error = Some(format!("failed_to_close_put: {:?}", put_close.error));
            position.rollover_status = RolloverStatus::Failed;
            return result;
        }

        let call_close = self
            .executor
            .execute(&old_call, cfg.exchange.as_str(), OrderAction::Sell, quantity, "call close")
            .await;
        result.close_legs.push(LegReport {
            leg: "call",
            action: "SELL",
            symbol: old_call.clone(),
            result: call_close.clone(),
        });
        if !call_close.success {
            // Put already covered: the account holds a naked long call.
            tracing::error!(
                position_id = %position.position_id,
                "put closed but call close failed, manual intervention required"
            );
            result.error = Some(format!("failed_to_close_call: {:?}", call_close.error));
            result.critical = true;
            position.rollover_status = RolloverStatus::Failed;
            return result;
        }

        // Open new: SELL put, BUY call. Rollback can only cover the new
        // first leg; the old position is already flat, so a failure past
        // this point leaves the account FLAT and needs manual re-entry.
        let put_open = self
            .executor
            .execute(&new_put, cfg.exchange.as_str(), OrderAction::Sell, quantity, "put open")
            .await;
        result.open_legs.push(LegReport {
            leg: "put",
            action: "SELL",
            symbol: new_put.clone(),
            result: put_open.clone(),
        });
        if !put_open.success {
            tracing::error!(
                position_id = %position.position_id,
                "old position closed but new put failed, account is FLAT"
            );
            result.error = Some(format!("failed_to_open_put: {:?}", put_open.error));
            result.critical = true;
            position.rollover_status = RolloverStatus::Failed;
            return result;
        }

        let call_open = self
            .executor
            .execute(&new_call, cfg.exchange.as_str(), OrderAction::Buy, quantity, "call open")
            .await;
        result.open_legs.push(LegReport {
            leg: "call",
            action: "BUY",
            symbol: new_call.clone(),
            result: call_open.clone(),
        });
        if !call_open.success {
            tracing::error!(
                position_id = %position.position_id,
                "new put opened but call failed, covering put"
            );
            let cover = self
                .executor
                .execute(&new_put, cfg.exchange.as_str(), OrderAction::Buy, quantity, "put emergency cover")
                .await;
            if cover.success {
                tracing::info!("emergency put cover successful, account FLAT");
                result.error =
                    Some(format!("failed_to_open_call_put_covered: {:?}", call_open.error));
            } else {
                tracing::error!("emergency put cover FAILED, manual intervention required");
                result.error = Some("ROLLBACK_FAILED_CRITICAL".to_string());
            }
            result.critical = true;
            position.rollover_status = RolloverStatus::Failed;
            return result;
        }

        // Accounting: realized P&L of the closed legs plus the net-premium
        // difference between the contracts.
        let put_entry = position.put_entry_price.unwrap_or(put_close.fill_price);
        let call_entry = position.call_entry_price.unwrap_or(call_close.fill_price);
        let quantity_f = quantity as f64;

        let put_close_pnl = (put_entry - put_close.fill_price) * quantity_f;
        let call_close_pnl = (call_close.fill_price - call_entry) * quantity_f;
        result.close_pnl = put_close_pnl + call_close_pnl;

        let net_premium_old = (put_entry - call_entry) * quantity_f;
        let net_premium_new = (put_open.fill_price - call_open.fill_price) * quantity_f;
        result.spread_cost = net_premium_new - net_premium_old;
        result.total_rollover_cost = result.close_pnl + result.spread_cost;

        // Move the expiring contract into the history fields and overwrite
        // with the new one.
        position.original_expiry = Some(candidate.current_expiry.clone());
        position.original_strike = position.strike;
        position.original_entry_price = Some(position.entry_price);

        let synthetic_entry = new_strike as f64 + call_open.fill_price - put_open.fill_price;
        position.expiry = Some(candidate.next_expiry.clone());
        position.strike = Some(new_strike);
        position.entry_price = synthetic_entry;
        position.put_symbol = Some(new_put.clone());
        position.call_symbol = Some(new_call.clone());
        position.put_order_id = put_open.order_id.clone();
        position.call_order_id = call_open.order_id.clone();
        position.put_entry_price = Some(put_open.fill_price);
        position.call_entry_price = Some(call_open.fill_price);
        position.rollover_status = RolloverStatus::Rolled;
        position.rollover_timestamp = Some(now);
        position.rollover_count += 1;
        position.rollover_pnl += result.total_rollover_cost;
        if position.entry_price > position.highest_close {
            position.highest_close = position.entry_price;
        }

        tracing::info!(
            position_id = %position.position_id,
            synthetic_entry,
            close_pnl = result.close_pnl,
            spread_cost = result.spread_cost,
            "synthetic rollover complete"
        );

        result.reconcile_warnings = self
            .reconcile(&[old_put, old_call], &[(new_put, quantity), (new_call, quantity)])
            .await;
        result.success = true;
        result
    }

    async fn rollover_futures(
        &self,
        position: &mut Position,
        candidate: &RolloverCandidate,
        now: DateTime<Utc>,
    ) -> RolloverResult {
        let mut result = RolloverResult {
            position_id: position.position_id.clone(),
            old_expiry: Some(candidate.current_expiry.clone()),
            new_expiry: Some(candidate.next_expiry.clone()),
            ..Default::default()
        };

        let cfg = position.instrument.config();
        let quantity = position.quantity;

        let old_symbol = position
            .futures_symbol
            .clone()
            .unwrap_or_else(|| {
                symbols::futures_symbol(cfg.symbol_root, &candidate.current_expiry, self.config.spaced_symbols)
            });
        let new_symbol =
            symbols::futures_symbol(cfg.symbol_root, &candidate.next_expiry, self.config.spaced_symbols);

        tracing::info!(
            position_id = %position.position_id,
            old = %old_symbol,
            new = %new_symbol,
            "rolling futures position"
        );

        position.rollover_status = RolloverStatus::InProgress;

        let close = self
            .executor
            .execute(&old_symbol, cfg.exchange.as_str(), OrderAction::Sell, quantity, "futures close")
            .await;
        result.close_legs.push(LegReport {
            leg: "futures",
            action: "SELL",
            symbol: old_symbol.clone(),
            result: close.clone(),
        });
        if !close.success {
            result.error = Some(format!("failed_to_close_futures: {:?}", close.error));
            position.rollover_status = RolloverStatus::Failed;
            return result;
        }

        let open = self
            .executor
            .execute(&new_symbol, cfg.exchange.as_str(), OrderAction::Buy, quantity, "futures open")
            .await;
        result.open_legs.push(LegReport {
            leg: "futures",
            action: "BUY",
            symbol: new_symbol.clone(),
            result: open.clone(),
        });
        if !open.success {
            tracing::error!(
                position_id = %position.position_id,
                "old futures closed but new contract failed, account is FLAT"
            );
            result.error = Some(format!("failed_to_open_futures: {:?}", open.error));
            result.critical = true;
            position.rollover_status = RolloverStatus::Failed;
            return result;
        }

        result.close_pnl = (close.fill_price - position.entry_price) * position.lots as f64 * cfg.point_value;
        result.spread_cost = (open.fill_price - close.fill_price) * position.lots as f64 * cfg.point_value;
        result.total_rollover_cost = result.close_pnl;

        position.original_expiry = Some(candidate.current_expiry.clone());
        position.original_entry_price = Some(position.entry_price);
        position.contract_month = Some(candidate.next_expiry.clone());
        position.futures_symbol = Some(new_symbol.clone());
        position.futures_order_id = open.order_id.clone();
        position.entry_price = open.fill_price;
        position.rollover_status = RolloverStatus::Rolled;
        position.rollover_timestamp = Some(now);
        position.rollover_count += 1;
        position.rollover_pnl += result.close_pnl;

        result.reconcile_warnings =
            self.reconcile(&[old_symbol], &[(new_symbol, quantity)]).await;
        result.success = true;
        result
    }

    /// Cross-check the broker's position book after a rollover: the old
    /// symbols must be gone and the new symbols present with matching
    /// quantity. Mismatches are warnings, not aborts.
    async fn reconcile(
        &self,
        old_symbols: &[String],
        new_symbols: &[(String, i32)],
    ) -> Vec<String> {
        let book = match self.broker.positions().await {
            Ok(book) => book,
            Err(e) => {
                return vec![format!("positionbook_unavailable: {e}")];
            }
        };

        let mut warnings = Vec::new();
        for old in old_symbols {
            if book.iter().any(|p| &p.symbol == old && p.quantity != 0) {
                warnings.push(format!("old_symbol_still_open: {old}"));
            }
        }
        for (new, expected_qty) in new_symbols {
            match book.iter().find(|p| &p.symbol == new) {
                None => warnings.push(format!("new_symbol_missing: {new}")),
                Some(p) if p.quantity.abs() != *expected_qty => warnings.push(format!(
                    "quantity_mismatch: {new} expected {expected_qty} got {}",
                    p.quantity
                )),
                Some(_) => {}
            }
        }

        if !warnings.is_empty() {
            tracing::warn!(?warnings, "rollover reconciliation mismatches");
        }
        warnings
    }
}
