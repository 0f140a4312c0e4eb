use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

use signal_core::{Instrument, Position, PositionStatus};

#[derive(Debug, thiserror::Error)]
pub enum PortfolioError {
    #[error("position not found: {0}")]
    PositionNotFound(String),
    #[error("position {0} is not open")]
    NotOpen(String),
}

/// Snapshot of the single-row portfolio state for persistence.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioSnapshot {
    pub closed_equity: f64,
    pub equity_high: f64,
    pub total_risk_amount: f64,
    pub total_vol_amount: f64,
    pub margin_used: f64,
    pub initial_capital: f64,
}

/// In-memory portfolio: ordered position map, closed equity with a
/// high-water mark, base-position index and per-instrument pyramid state.
///
/// Positions are keyed by position id in a BTreeMap, so `ALL` exits close
/// the pyramid sequence in deterministic label order. Only the leader
/// mutates this state; followers hold read-only copies for observability.
#[derive(Debug)]
pub struct Portfolio {
    positions: BTreeMap<String, Position>,
    pub closed_equity: f64,
    pub equity_high: f64,
    pub initial_capital: f64,
    pub margin_used: f64,
    max_portfolio_risk_percent: f64,
    max_portfolio_vol_percent: f64,
    base_positions: HashMap<Instrument, String>,
    last_pyramid_price: HashMap<Instrument, f64>,
}

impl Portfolio {
    pub fn new(
        initial_capital: f64,
        max_portfolio_risk_percent: f64,
        max_portfolio_vol_percent: f64,
    ) -> Self {
        Self {
            positions: BTreeMap::new(),
            closed_equity: initial_capital,
            equity_high: initial_capital,
            initial_capital,
            margin_used: 0.0,
            max_portfolio_risk_percent,
            max_portfolio_vol_percent,
            base_positions: HashMap::new(),
            last_pyramid_price: HashMap::new(),
        }
    }

    /// Rehydrate from persisted rows on startup.
    pub fn restore(
        &mut self,
        closed_equity: f64,
        equity_high: f64,
        positions: Vec<Position>,
        pyramid_state: Vec<(Instrument, f64, Option<String>)>,
    ) {
        self.closed_equity = closed_equity;
        self.equity_high = equity_high.max(closed_equity);
        for position in positions {
            if position.is_base_position && position.status != PositionStatus::Closed {
                self.base_positions.insert(position.instrument, position.position_id.clone());
            }
            self.positions.insert(position.position_id.clone(), position);
        }
        for (instrument, last_price, base_id) in pyramid_state {
            self.last_pyramid_price.insert(instrument, last_price);
            if let Some(base_id) = base_id {
                self.base_positions.entry(instrument).or_insert(base_id);
            }
        }
    }

    pub fn add_position(&mut self, position: Position) {
        if position.is_base_position {
            self.base_positions.insert(position.instrument, position.position_id.clone());
        }
        self.positions.insert(position.position_id.clone(), position);
    }

    pub fn position(&self, position_id: &str) -> Option<&Position> {
        self.positions.get(position_id)
    }

    pub fn position_mut(&mut self, position_id: &str) -> Option<&mut Position> {
        self.positions.get_mut(position_id)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    /// Open positions for one instrument, in position-id order.
    pub fn open_positions_for(&self, instrument: Instrument) -> Vec<&Position> {
        self.positions
            .values()
            .filter(|p| p.instrument == instrument && p.status == PositionStatus::Open)
            .collect()
    }

    pub fn open_position_ids_for(&self, instrument: Instrument) -> Vec<String> {
        self.open_positions_for(instrument).iter().map(|p| p.position_id.clone()).collect()
    }

    pub fn open_position_count(&self, instrument: Instrument) -> usize {
        self.open_positions_for(instrument).len()
    }

    pub fn base_position_id(&self, instrument: Instrument) -> Option<&String> {
        self.base_positions.get(&instrument)
    }

    pub fn base_position(&self, instrument: Instrument) -> Option<&Position> {
        self.base_positions.get(&instrument).and_then(|id| self.positions.get(id))
    }

    pub fn last_pyramid_price(&self, instrument: Instrument) -> Option<f64> {
        self.last_pyramid_price.get(&instrument).copied()
    }

    pub fn set_last_pyramid_price(&mut self, instrument: Instrument, price: f64) {
        self.last_pyramid_price.insert(instrument, price);
    }

    /// Close a position at `exit_price`, returning realized P&L. Closing a
    /// base position clears the instrument's base reference so pyramid adds
    /// can no longer attach to it.
    pub fn close_position(
        &mut self,
        position_id: &str,
        exit_price: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<f64, PortfolioError> {
        let position = self
            .positions
            .get_mut(position_id)
            .ok_or_else(|| PortfolioError::PositionNotFound(position_id.to_string()))?;
        if position.status == PositionStatus::Closed {
            return Err(PortfolioError::NotOpen(position_id.to_string()));
        }

        let point_value = position.instrument.config().point_value;
        let pnl = (exit_price - position.entry_price) * position.lots as f64 * point_value;
        position.status = PositionStatus::Closed;
        position.realized_pnl = pnl;
        position.unrealized_pnl = 0.0;

        let instrument = position.instrument;
        let was_base = position.is_base_position;

        self.closed_equity += pnl;
        // High-water mark moves only on positive closed-equity transitions.
        if self.closed_equity > self.equity_high {
            self.equity_high = self.closed_equity;
        }

        if was_base {
            self.base_positions.remove(&instrument);
        }

        tracing::info!(
            position_id,
            exit_price,
            pnl,
            closed_equity = self.closed_equity,
            at = %timestamp,
            "position closed"
        );
        Ok(pnl)
    }

    pub fn total_risk_amount(&self) -> f64 {
        self.positions
            .values()
            .filter(|p| p.status == PositionStatus::Open)
            .map(|p| p.risk_contribution)
            .sum()
    }

    pub fn total_vol_amount(&self) -> f64 {
        self.positions
            .values()
            .filter(|p| p.status == PositionStatus::Open)
            .map(|p| p.vol_contribution)
            .sum()
    }

    /// Portfolio-wide risk gate: admit the candidate entry only if total
    /// risk and volatility stay under the configured ceilings (percent of
    /// closed equity).
    pub fn check_portfolio_gate(&self, est_risk: f64, est_vol: f64) -> (bool, String) {
        if self.closed_equity <= 0.0 {
            return (false, "non_positive_equity".to_string());
        }

        let risk_pct = (self.total_risk_amount() + est_risk) / self.closed_equity * 100.0;
        if risk_pct > self.max_portfolio_risk_percent {
            return (
                false,
                format!(
                    "portfolio_risk_{:.2}pct_exceeds_{:.2}pct",
                    risk_pct, self.max_portfolio_risk_percent
                ),
            );
        }

        let vol_pct = (self.total_vol_amount() + est_vol) / self.closed_equity * 100.0;
        if vol_pct > self.max_portfolio_vol_percent {
            return (
                false,
                format!(
                    "portfolio_vol_{:.2}pct_exceeds_{:.2}pct",
                    vol_pct, self.max_portfolio_vol_percent
                ),
            );
        }

        (true, String::new())
    }

    pub fn snapshot(&self) -> PortfolioSnapshot {
        PortfolioSnapshot {
            closed_equity: self.closed_equity,
            equity_high: self.equity_high,
            total_risk_amount: self.total_risk_amount(),
            total_vol_amount: self.total_vol_amount(),
            margin_used: self.margin_used,
            initial_capital: self.initial_capital,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap()
    }

    fn base_position(lots: i32) -> Position {
        let mut p =
            Position::new(Instrument::BankNifty, "Long_1", ts(), 50_000.0, lots, 49_800.0, 100.0);
        p.is_base_position = true;
        p.risk_contribution = 7_000.0;
        p.vol_contribution = 3_500.0;
        p
    }

    #[test]
    fn add_and_close_updates_equity_and_base_index() {
        let mut portfolio = Portfolio::new(5_000_000.0, 6.0, 10.0);
        portfolio.add_position(base_position(1));
        assert!(portfolio.base_position(Instrument::BankNifty).is_some());

        // +200 points x 1 lot x 35 = +7,000
        let pnl = portfolio.close_position("BANK_NIFTY_Long_1", 50_200.0, ts()).unwrap();
        assert_eq!(pnl, 7_000.0);
        assert_eq!(portfolio.closed_equity, 5_007_000.0);
        assert_eq!(portfolio.equity_high, 5_007_000.0);
        // Base reference cleared after the base position closes.
        assert!(portfolio.base_position(Instrument::BankNifty).is_none());
    }

    #[test]
    fn equity_high_holds_through_drawdown() {
        let mut portfolio = Portfolio::new(5_000_000.0, 6.0, 10.0);
        portfolio.add_position(base_position(1));
        portfolio.close_position("BANK_NIFTY_Long_1", 49_800.0, ts()).unwrap(); // -7,000
        assert_eq!(portfolio.closed_equity, 4_993_000.0);
        assert_eq!(portfolio.equity_high, 5_000_000.0);
    }

    #[test]
    fn double_close_is_rejected() {
        let mut portfolio = Portfolio::new(5_000_000.0, 6.0, 10.0);
        portfolio.add_position(base_position(1));
        portfolio.close_position("BANK_NIFTY_Long_1", 50_200.0, ts()).unwrap();
        assert!(portfolio.close_position("BANK_NIFTY_Long_1", 50_300.0, ts()).is_err());
        assert!(portfolio.close_position("BANK_NIFTY_Long_9", 50_300.0, ts()).is_err());
    }

    #[test]
    fn gate_blocks_on_risk_ceiling() {
        let mut portfolio = Portfolio::new(1_000_000.0, 6.0, 10.0);
        portfolio.add_position(base_position(1)); // risk 7,000 open

        // 7,000 + 55,000 = 62,000 -> 6.2% of 1,000,000 > 6%
        let (allowed, reason) = portfolio.check_portfolio_gate(55_000.0, 0.0);
        assert!(!allowed);
        assert!(reason.starts_with("portfolio_risk_"));

        let (allowed, _) = portfolio.check_portfolio_gate(50_000.0, 0.0);
        assert!(allowed);
    }

    #[test]
    fn gate_blocks_on_vol_ceiling() {
        let portfolio = Portfolio::new(1_000_000.0, 6.0, 10.0);
        let (allowed, reason) = portfolio.check_portfolio_gate(0.0, 150_000.0);
        assert!(!allowed);
        assert!(reason.starts_with("portfolio_vol_"));
    }

    #[test]
    fn exit_all_order_is_label_order() {
        let mut portfolio = Portfolio::new(5_000_000.0, 6.0, 10.0);
        for label in ["Long_3", "Long_1", "Long_2"] {
            portfolio.add_position(Position::new(
                Instrument::BankNifty,
                label,
                ts(),
                50_000.0,
                1,
                49_800.0,
                100.0,
            ));
        }
        let ids = portfolio.open_position_ids_for(Instrument::BankNifty);
        assert_eq!(
            ids,
            vec!["BANK_NIFTY_Long_1", "BANK_NIFTY_Long_2", "BANK_NIFTY_Long_3"]
        );
    }

    #[test]
    fn restore_rebuilds_base_index() {
        let mut portfolio = Portfolio::new(5_000_000.0, 6.0, 10.0);
        let base = base_position(2);
        portfolio.restore(
            5_100_000.0,
            5_200_000.0,
            vec![base],
            vec![(Instrument::BankNifty, 50_500.0, Some("BANK_NIFTY_Long_1".to_string()))],
        );
        assert_eq!(portfolio.closed_equity, 5_100_000.0);
        assert_eq!(portfolio.equity_high, 5_200_000.0);
        assert_eq!(
            portfolio.base_position_id(Instrument::BankNifty).map(String::as_str),
            Some("BANK_NIFTY_Long_1")
        );
        assert_eq!(portfolio.last_pyramid_price(Instrument::BankNifty), Some(50_500.0));
    }
}
