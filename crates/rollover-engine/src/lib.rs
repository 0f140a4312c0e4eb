pub mod engine;
pub mod retry;

pub use engine::{
    BatchRolloverResult, LegReport, RolloverCandidate, RolloverConfig, RolloverEngine,
    RolloverResult,
};
pub use retry::{OrderResult, RetryExecutorConfig, RetryOrderExecutor};

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{NaiveDate, TimeZone, Utc};

    use broker_gateway::testing::ScriptedBroker;
    use broker_gateway::BrokerPosition;
    use signal_core::{Instrument, Position, RolloverStatus};

    use super::*;

    fn fast_engine(broker: Arc<ScriptedBroker>) -> RolloverEngine {
        RolloverEngine::new(
            broker,
            RolloverConfig {
                retry: RetryExecutorConfig {
                    retry_interval: Duration::ZERO,
                    ..RetryExecutorConfig::default()
                },
                ..RolloverConfig::default()
            },
        )
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn synthetic_position(expiry: &str) -> Position {
        let ts = Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap();
        let mut p = Position::new(Instrument::BankNifty, "Long_1", ts, 52_020.0, 1, 51_800.0, 100.0);
        p.strike = Some(52_000);
        p.expiry = Some(expiry.to_string());
        p.put_symbol = Some(format!("BANKNIFTY{expiry}52000PE"));
        p.call_symbol = Some(format!("BANKNIFTY{expiry}52000CE"));
        p.put_entry_price = Some(118.0);
        p.call_entry_price = Some(95.0);
        p
    }

    #[test]
    fn scan_flags_positions_inside_window() {
        let broker = Arc::new(ScriptedBroker::new());
        let engine = fast_engine(broker);

        // Expiry 2025-06-25, Bank Nifty window 7 days.
        let position = synthetic_position("25JUN25");

        // Exactly at the threshold: flagged.
        let at = engine.scan_candidates(std::slice::from_ref(&position), d(2025, 6, 18));
        assert_eq!(at.len(), 1);
        assert_eq!(at[0].days_to_expiry, 7);
        assert_eq!(at[0].next_expiry, "25JUL30");

        // One day earlier: not flagged.
        let before = engine.scan_candidates(std::slice::from_ref(&position), d(2025, 6, 17));
        assert!(before.is_empty());
    }

    #[test]
    fn scan_skips_closed_positions() {
        let broker = Arc::new(ScriptedBroker::new());
        let engine = fast_engine(broker);
        let mut position = synthetic_position("25JUN25");
        position.status = signal_core::PositionStatus::Closed;
        assert!(engine.scan_candidates(&[position], d(2025, 6, 20)).is_empty());
    }

    #[tokio::test]
    async fn synthetic_rollover_happy_path() {
        let broker = Arc::new(ScriptedBroker::new());
        broker.set_quote(52_430.0, 52_420.0, 52_440.0);
        // put close, call close, put open, call open
        broker.push_fill(110.0, 35);
        broker.push_fill(130.0, 35);
        broker.push_fill(125.0, 35);
        broker.push_fill(102.0, 35);
        broker.book.lock().unwrap().extend([
            BrokerPosition {
                symbol: "BANKNIFTY25JUL3052400PE".to_string(),
                quantity: 35,
                product: "NRML".to_string(),
                exchange: "NFO".to_string(),
                average_price: None,
            },
            BrokerPosition {
                symbol: "BANKNIFTY25JUL3052400CE".to_string(),
                quantity: 35,
                product: "NRML".to_string(),
                exchange: "NFO".to_string(),
                average_price: None,
            },
        ]);

        let engine = fast_engine(broker.clone());
        let mut position = synthetic_position("25JUN25");
        let candidates = engine.scan_candidates(std::slice::from_ref(&position), d(2025, 6, 20));
        assert_eq!(candidates.len(), 1);

        let now = Utc::now();
        let result = engine.rollover_position(&mut position, &candidates[0], now).await;
        assert!(result.success, "rollover failed: {:?}", result.error);
        assert_eq!(result.new_strike, Some(52_400));
        assert!(result.reconcile_warnings.is_empty());

        // Position history and new contract state.
        assert_eq!(position.original_expiry.as_deref(), Some("25JUN25"));
        assert_eq!(position.original_strike, Some(52_000));
        assert_eq!(position.expiry.as_deref(), Some("25JUL30"));
        assert_eq!(position.strike, Some(52_400));
        assert_eq!(position.rollover_count, 1);
        assert_eq!(position.rollover_status, RolloverStatus::Rolled);
        // New synthetic entry: 52_400 + 102 − 125.
        assert_eq!(position.entry_price, 52_377.0);
        assert_eq!(position.put_entry_price, Some(125.0));
        assert_eq!(position.call_entry_price, Some(102.0));

        // Accounting: put closed (118 − 110) × 35 + call closed (130 − 95) × 35.
        let expected_close = (118.0 - 110.0) * 35.0 + (130.0 - 95.0) * 35.0;
        assert!((result.close_pnl - expected_close).abs() < 1e-9);

        // Four limit legs went to the broker.
        assert_eq!(broker.placed_count(), 4);
    }

    #[tokio::test]
    async fn failed_new_put_leaves_account_flat_and_critical() {
        let broker = Arc::new(ScriptedBroker::new());
        broker.set_quote(52_430.0, 52_420.0, 52_440.0);
        broker.push_fill(110.0, 35); // put close
        broker.push_fill(130.0, 35); // call close
        // New put: limit placement rejected.
        broker.place_failures.lock().unwrap().push_back(false); // put close
        broker.place_failures.lock().unwrap().push_back(false); // call close
        broker.place_failures.lock().unwrap().push_back(true); // put open limit

        let engine = fast_engine(broker);
        let mut position = synthetic_position("25JUN25");
        let candidates = engine.scan_candidates(std::slice::from_ref(&position), d(2025, 6, 20));

        let result = engine.rollover_position(&mut position, &candidates[0], Utc::now()).await;
        assert!(!result.success);
        assert!(result.critical);
        assert!(result.error.unwrap().starts_with("failed_to_open_put"));
        assert_eq!(position.rollover_status, RolloverStatus::Failed);
        // Contract fields untouched on failure.
        assert_eq!(position.expiry.as_deref(), Some("25JUN25"));
    }

    #[tokio::test]
    async fn futures_rollover_updates_contract_month() {
        let broker = Arc::new(ScriptedBroker::new());
        broker.set_quote(75_000.0, 74_990.0, 75_010.0);
        broker.push_fill(75_020.0, 1); // close old
        broker.push_fill(75_400.0, 1); // open new
        broker.book.lock().unwrap().push(BrokerPosition {
            symbol: "GOLDM25JUL31FUT".to_string(),
            quantity: 100,
            product: "NRML".to_string(),
            exchange: "MCX".to_string(),
            average_price: None,
        });

        let engine = fast_engine(broker.clone());
        let ts = Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap();
        let mut position =
            Position::new(Instrument::GoldMini, "Long_1", ts, 74_500.0, 1, 73_800.0, 200.0);
        position.contract_month = Some("25JUN30".to_string());
        position.futures_symbol = Some("GOLDM25JUN30FUT".to_string());

        // Gold Mini window 8 days: June 24 is 6 days out.
        let candidates = engine.scan_candidates(std::slice::from_ref(&position), d(2025, 6, 24));
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].next_expiry, "25JUL31");

        let result = engine.rollover_position(&mut position, &candidates[0], Utc::now()).await;
        assert!(result.success, "rollover failed: {:?}", result.error);
        // Close P&L: (75_020 − 74_500) × 1 lot × 100.
        assert!((result.close_pnl - 52_000.0).abs() < 1e-9);
        assert_eq!(position.contract_month.as_deref(), Some("25JUL31"));
        assert_eq!(position.futures_symbol.as_deref(), Some("GOLDM25JUL31FUT"));
        assert_eq!(position.entry_price, 75_400.0);
        assert_eq!(position.rollover_count, 1);
        assert!(result.reconcile_warnings.is_empty());
    }
}
