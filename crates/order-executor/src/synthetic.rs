use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;

use broker_gateway::{BrokerApi, OrderAction, PlaceOrderRequest};
use signal_core::symbols;

use crate::{ExecutionStatus, OrderExecutor, OrderSpec};

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub symbol_root: String,
    pub exchange: String,
    pub lot_size: i32,
    pub strike_interval: i32,
    pub use_monthly_expiry: bool,
    pub rollover_days: i64,
    pub spaced_symbols: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            symbol_root: "BANKNIFTY".to_string(),
            exchange: "NFO".to_string(),
            lot_size: 35,
            strike_interval: 100,
            use_monthly_expiry: true,
            rollover_days: 7,
            spaced_symbols: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LegFill {
    pub symbol: String,
    pub order_id: Option<String>,
    pub fill_price: f64,
    pub lots: i32,
}

/// Result of a two-leg synthetic execution.
#[derive(Debug, Clone, Serialize)]
pub struct SyntheticOutcome {
    pub status: ExecutionStatus,
    pub strike: Option<i64>,
    pub expiry: Option<String>,
    pub put: Option<LegFill>,
    pub call: Option<LegFill>,
    pub cover_order_id: Option<String>,
    pub rollback_performed: bool,
    pub rollback_success: bool,
    pub rejection_reason: Option<String>,
    pub notes: Option<String>,
}

impl SyntheticOutcome {
    fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Rejected,
            strike: None,
            expiry: None,
            put: None,
            call: None,
            cover_order_id: None,
            rollback_performed: false,
            rollback_success: false,
            rejection_reason: Some(reason.into()),
            notes: None,
        }
    }

    /// Effective price of the synthetic position: `strike + call − put`.
    pub fn synthetic_price(&self) -> Option<f64> {
        match (self.strike, &self.put, &self.call) {
            (Some(strike), Some(put), Some(call)) => {
                Some(strike as f64 + call.fill_price - put.fill_price)
            }
            _ => None,
        }
    }
}

/// Two-leg synthetic-future executor: a long future is replicated as
/// SELL ATM put + BUY ATM call on the same strike and expiry.
///
/// Leg order is rollback-critical. On entry the short put goes first; if
/// the call then fails, the put is flattened with an emergency market buy.
/// A failed cover is never auto-resolved: it is surfaced as
/// `ROLLBACK_FAILED_CRITICAL` for the operator.
pub struct SyntheticExecutor {
    broker: Arc<dyn BrokerApi>,
    legs: Arc<dyn OrderExecutor>,
    config: SyntheticConfig,
}

impl SyntheticExecutor {
    pub fn new(broker: Arc<dyn BrokerApi>, legs: Arc<dyn OrderExecutor>, config: SyntheticConfig) -> Self {
        Self { broker, legs, config }
    }

    pub fn select_strike(&self, reference_price: f64) -> i64 {
        symbols::atm_strike(reference_price, self.config.strike_interval)
    }

    pub fn select_expiry(&self, today: NaiveDate) -> String {
        let date = if self.config.use_monthly_expiry {
            symbols::monthly_option_expiry(today, self.config.rollover_days)
        } else {
            symbols::weekly_option_expiry(today)
        };
        symbols::format_expiry(date)
    }

    pub fn leg_symbols(&self, expiry: &str, strike: i64) -> (String, String) {
        let put = symbols::option_symbol(
            &self.config.symbol_root,
            expiry,
            strike,
            "PE",
            self.config.spaced_symbols,
        );
        let call = symbols::option_symbol(
            &self.config.symbol_root,
            expiry,
            strike,
            "CE",
            self.config.spaced_symbols,
        );
        (put, call)
    }

    async fn leg_limit_price(&self, symbol: &str) -> Option<f64> {
        match self.broker.quote(symbol, &self.config.exchange).await {
            Ok(quote) => quote.mid(),
            Err(e) => {
                tracing::error!(symbol, error = %e, "quote fetch failed for leg");
                None
            }
        }
    }

    async fn execute_leg(&self, symbol: &str, action: OrderAction, lots: i32) -> Result<LegFill, String> {
        let Some(limit) = self.leg_limit_price(symbol).await else {
            return Err(format!("no_quote_for_{symbol}"));
        };
        let spec = OrderSpec {
            symbol: symbol.to_string(),
            exchange: self.config.exchange.clone(),
            action,
            lots,
            lot_size: self.config.lot_size,
            signal_price: limit,
        };
        let outcome = self.legs.execute(&spec, limit).await;
        if outcome.is_filled() {
            Ok(LegFill {
                symbol: symbol.to_string(),
                order_id: outcome.order_id,
                fill_price: outcome.execution_price.unwrap_or(limit),
                lots: outcome.lots_filled.unwrap_or(lots),
            })
        } else {
            Err(outcome.rejection_reason.unwrap_or_else(|| "leg_execution_failed".to_string()))
        }
    }

    /// Emergency flatten of a stranded leg with a market order. Returns the
    /// cover order id on success.
    async fn emergency_cover(
        &self,
        symbol: &str,
        action: OrderAction,
        lots: i32,
    ) -> Option<String> {
        tracing::error!(symbol, action = action.as_str(), "placing emergency cover");
        let request = PlaceOrderRequest::market(
            symbol.to_string(),
            action,
            lots * self.config.lot_size,
            &self.config.exchange,
        );
        match self.broker.place_order(&request).await {
            Ok(r) if r.is_success() && r.orderid.is_some() => {
                tracing::info!(orderid = ?r.orderid, "emergency cover placed");
                r.orderid
            }
            Ok(r) => {
                tracing::error!(message = ?r.message, "emergency cover REJECTED, manual intervention required");
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "emergency cover FAILED, manual intervention required");
                None
            }
        }
    }

    /// Open the synthetic long: SELL put, then BUY call.
    pub async fn execute_entry(
        &self,
        reference_price: f64,
        lots: i32,
        today: NaiveDate,
    ) -> SyntheticOutcome {
        let strike = self.select_strike(reference_price);
        let expiry = self.select_expiry(today);
        let (put_symbol, call_symbol) = self.leg_symbols(&expiry, strike);

        tracing::info!(
            strike,
            expiry = %expiry,
            put = %put_symbol,
            call = %call_symbol,
            lots,
            "executing synthetic entry"
        );

        // Leg 1: short put. A failure here leaves nothing open.
        let put = match self.execute_leg(&put_symbol, OrderAction::Sell, lots).await {
            Ok(fill) => fill,
            Err(reason) => {
                tracing::error!(reason = %reason, "put leg failed, aborting entry");
                let mut outcome = SyntheticOutcome::failed(format!("put_leg_failed: {reason}"));
                outcome.strike = Some(strike);
                outcome.expiry = Some(expiry);
                return outcome;
            }
        };
        tracing::info!(fill = put.fill_price, "put leg filled");

        // Leg 2: long call. A failure here strands the short put.
        match self.execute_leg(&call_symbol, OrderAction::Buy, lots).await {
            Ok(call) => {
                let outcome = SyntheticOutcome {
                    status: ExecutionStatus::Executed,
                    strike: Some(strike),
                    expiry: Some(expiry),
                    put: Some(put),
                    call: Some(call),
                    cover_order_id: None,
                    rollback_performed: false,
                    rollback_success: false,
                    rejection_reason: None,
                    notes: None,
                };
                tracing::info!(
                    synthetic_price = ?outcome.synthetic_price(),
                    "synthetic entry complete"
                );
                outcome
            }
            Err(reason) => {
                tracing::error!(
                    reason = %reason,
                    put = %put_symbol,
                    "call leg failed after put fill, covering put"
                );
                let cover = self.emergency_cover(&put_symbol, OrderAction::Buy, lots).await;
                let rollback_success = cover.is_some();
                SyntheticOutcome {
                    status: ExecutionStatus::Rejected,
                    strike: Some(strike),
                    expiry: Some(expiry),
                    put: Some(put),
                    call: None,
                    cover_order_id: cover,
                    rollback_performed: true,
                    rollback_success,
                    rejection_reason: Some(format!("call_leg_failed: {reason}")),
                    notes: Some(
                        if rollback_success { "failed_ce_covered" } else { "ROLLBACK_FAILED_CRITICAL" }
                            .to_string(),
                    ),
                }
            }
        }
    }

    /// Close the synthetic long on its stored leg symbols: BUY put, then
    /// SELL call. Symmetric rollback: a stranded call is flattened with an
    /// emergency market sell.
    pub async fn execute_exit(
        &self,
        put_symbol: &str,
        call_symbol: &str,
        strike: Option<i64>,
        lots: i32,
    ) -> SyntheticOutcome {
        tracing::info!(put = put_symbol, call = call_symbol, lots, "executing synthetic exit");

        let put = match self.execute_leg(put_symbol, OrderAction::Buy, lots).await {
            Ok(fill) => fill,
            Err(reason) => {
                tracing::error!(reason = %reason, "put cover failed, position untouched");
                let mut outcome = SyntheticOutcome::failed(format!("put_cover_failed: {reason}"));
                outcome.strike = strike;
                return outcome;
            }
        };

        match self.execute_leg(call_symbol, OrderAction::Sell, lots).await {
            Ok(call) => SyntheticOutcome {
                status: ExecutionStatus::Executed,
                strike,
                expiry: None,
                put: Some(put),
                call: Some(call),
                cover_order_id: None,
                rollback_performed: false,
                rollback_success: false,
                rejection_reason: None,
                notes: None,
            },
            Err(reason) => {
                tracing::error!(
                    reason = %reason,
                    call = call_symbol,
                    "call exit failed after put cover, emergency selling call"
                );
                let cover = self.emergency_cover(call_symbol, OrderAction::Sell, lots).await;
                let rollback_success = cover.is_some();
                SyntheticOutcome {
                    status: ExecutionStatus::Rejected,
                    strike,
                    expiry: None,
                    put: Some(put),
                    call: None,
                    cover_order_id: cover,
                    rollback_performed: true,
                    rollback_success,
                    rejection_reason: Some(format!("call_exit_failed: {reason}")),
                    notes: Some(
                        if rollback_success { "failed_ce_covered" } else { "ROLLBACK_FAILED_CRITICAL" }
                            .to_string(),
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{fast_config, MockBroker};
    use crate::ProgressiveExecutor;
    use broker_gateway::Quote;

    fn executor(broker: Arc<MockBroker>) -> SyntheticExecutor {
        let legs = Arc::new(ProgressiveExecutor::new(broker.clone(), fast_config()));
        SyntheticExecutor::new(broker, legs, SyntheticConfig::default())
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[tokio::test]
    async fn entry_fills_both_legs_with_two_orders() {
        let broker = Arc::new(MockBroker::new());
        *broker.quote.lock().unwrap() = Quote { ltp: 120.0, bid: 119.0, ask: 121.0 };
        broker.push_status(Some(MockBroker::complete("", 118.0, 1))); // put sell
        broker.push_status(Some(MockBroker::complete("", 95.0, 1))); // call buy
        let executor = executor(broker.clone());

        let outcome = executor.execute_entry(52_040.0, 1, d(2025, 6, 2)).await;
        assert_eq!(outcome.status, ExecutionStatus::Executed);
        assert_eq!(outcome.strike, Some(52_000));
        assert_eq!(outcome.expiry.as_deref(), Some("25JUN25"));
        assert!(!outcome.rollback_performed);

        // Exactly two orders: put sell then call buy.
        let placed = broker.placed.lock().unwrap();
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[0].symbol, "BANKNIFTY25JUN2552000PE");
        assert_eq!(placed[0].action, OrderAction::Sell);
        assert_eq!(placed[0].quantity, 35);
        assert_eq!(placed[1].symbol, "BANKNIFTY25JUN2552000CE");
        assert_eq!(placed[1].action, OrderAction::Buy);

        // strike + call − put
        assert_eq!(outcome.synthetic_price(), Some(52_000.0 + 95.0 - 118.0));
    }

    #[tokio::test]
    async fn put_failure_aborts_with_no_positions() {
        let broker = Arc::new(MockBroker::new());
        *broker.quote.lock().unwrap() = Quote { ltp: 120.0, bid: 119.0, ask: 121.0 };
        // Every placement rejected: put leg fails through all attempts.
        for _ in 0..16 {
            broker.place_failures.lock().unwrap().push_back(true);
        }
        let executor = executor(broker.clone());

        let outcome = executor.execute_entry(52_040.0, 1, d(2025, 6, 2)).await;
        assert_eq!(outcome.status, ExecutionStatus::Rejected);
        assert!(outcome.rejection_reason.unwrap().starts_with("put_leg_failed"));
        assert!(!outcome.rollback_performed);
        assert!(outcome.put.is_none());
    }

    #[tokio::test]
    async fn call_failure_covers_put_with_third_order() {
        let broker = Arc::new(MockBroker::new());
        *broker.quote.lock().unwrap() = Quote { ltp: 120.0, bid: 119.0, ask: 121.0 };
        // Put sell fills.
        broker.push_status(Some(MockBroker::complete("", 118.0, 1)));
        // Call buy: placement ok for put (already popped), then call leg
        // placements all rejected, then the market cover succeeds.
        broker.place_failures.lock().unwrap().push_back(false); // put
        for _ in 0..5 {
            broker.place_failures.lock().unwrap().push_back(true); // call attempts + market fallback
        }
        broker.place_failures.lock().unwrap().push_back(false); // emergency cover
        let executor = executor(broker.clone());

        let outcome = executor.execute_entry(52_040.0, 1, d(2025, 6, 2)).await;
        assert_eq!(outcome.status, ExecutionStatus::Rejected);
        assert!(outcome.rollback_performed);
        assert!(outcome.rollback_success);
        assert_eq!(outcome.notes.as_deref(), Some("failed_ce_covered"));
        assert!(outcome.cover_order_id.is_some());

        // Exactly three accepted-or-attempted flows: the cover order is a
        // market BUY on the put symbol.
        let placed = broker.placed.lock().unwrap();
        let cover = placed.last().unwrap();
        assert_eq!(cover.symbol, "BANKNIFTY25JUN2552000PE");
        assert_eq!(cover.action, OrderAction::Buy);
        assert_eq!(cover.order_type, broker_gateway::OrderType::Market);
    }

    #[tokio::test]
    async fn failed_cover_is_critical() {
        let broker = Arc::new(MockBroker::new());
        *broker.quote.lock().unwrap() = Quote { ltp: 120.0, bid: 119.0, ask: 121.0 };
        broker.push_status(Some(MockBroker::complete("", 118.0, 1)));
        broker.place_failures.lock().unwrap().push_back(false); // put
        for _ in 0..6 {
            broker.place_failures.lock().unwrap().push_back(true); // call + market + cover all fail
        }
        let executor = executor(broker.clone());

        let outcome = executor.execute_entry(52_040.0, 1, d(2025, 6, 2)).await;
        assert_eq!(outcome.status, ExecutionStatus::Rejected);
        assert!(outcome.rollback_performed);
        assert!(!outcome.rollback_success);
        assert_eq!(outcome.notes.as_deref(), Some("ROLLBACK_FAILED_CRITICAL"));
    }

    #[tokio::test]
    async fn exit_reverses_both_legs() {
        let broker = Arc::new(MockBroker::new());
        *broker.quote.lock().unwrap() = Quote { ltp: 120.0, bid: 119.0, ask: 121.0 };
        broker.push_status(Some(MockBroker::complete("", 110.0, 1))); // put buy-back
        broker.push_status(Some(MockBroker::complete("", 130.0, 1))); // call sell
        let executor = executor(broker.clone());

        let outcome = executor
            .execute_exit("BANKNIFTY25JUN2552000PE", "BANKNIFTY25JUN2552000CE", Some(52_000), 1)
            .await;
        assert_eq!(outcome.status, ExecutionStatus::Executed);
        assert_eq!(outcome.synthetic_price(), Some(52_000.0 + 130.0 - 110.0));

        let placed = broker.placed.lock().unwrap();
        assert_eq!(placed[0].action, OrderAction::Buy);
        assert_eq!(placed[1].action, OrderAction::Sell);
    }

    #[tokio::test]
    async fn missing_quote_rejects_entry() {
        let broker = Arc::new(MockBroker::new());
        // Quote defaults to zeros: no mid available.
        let executor = executor(broker.clone());
        let outcome = executor.execute_entry(52_040.0, 1, d(2025, 6, 2)).await;
        assert_eq!(outcome.status, ExecutionStatus::Rejected);
        assert!(outcome.rejection_reason.unwrap().starts_with("put_leg_failed: no_quote_for_"));
    }
}
