use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::instrument::Instrument;

/// Position lifecycle. `Closing` is set before any close order is placed so
/// a concurrent exit path skips the position instead of double-selling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closing => "closing",
            PositionStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "closing" => PositionStatus::Closing,
            "closed" => PositionStatus::Closed,
            _ => PositionStatus::Open,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloverStatus {
    None,
    InProgress,
    Rolled,
    Failed,
}

impl RolloverStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloverStatus::None => "none",
            RolloverStatus::InProgress => "in_progress",
            RolloverStatus::Rolled => "rolled",
            RolloverStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "in_progress" => RolloverStatus::InProgress,
            "rolled" => RolloverStatus::Rolled,
            "failed" => RolloverStatus::Failed,
            _ => RolloverStatus::None,
        }
    }
}

/// An open or closed position. Identity is `{instrument}_{position label}`.
///
/// For two-leg synthetic positions the entry price is the synthetic price
/// `strike + call_price − put_price`; leg symbols and fills are kept for the
/// exit and rollover paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub position_id: String,
    pub instrument: Instrument,
    pub status: PositionStatus,
    pub entry_timestamp: DateTime<Utc>,
    pub entry_price: f64,
    pub lots: i32,
    pub quantity: i32,
    pub initial_stop: f64,
    pub current_stop: f64,
    pub highest_close: f64,
    pub atr: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub exit_reason: Option<String>,

    // Sizing provenance
    pub limiter: Option<String>,
    pub risk_contribution: f64,
    pub vol_contribution: f64,
    pub is_base_position: bool,

    // Two-leg synthetic contract details
    pub strike: Option<i64>,
    pub expiry: Option<String>,
    pub put_symbol: Option<String>,
    pub call_symbol: Option<String>,
    pub put_order_id: Option<String>,
    pub call_order_id: Option<String>,
    pub put_entry_price: Option<f64>,
    pub call_entry_price: Option<f64>,

    // Single-leg futures contract details
    pub futures_symbol: Option<String>,
    pub futures_order_id: Option<String>,
    pub contract_month: Option<String>,

    // Rollover history
    pub rollover_status: RolloverStatus,
    pub rollover_count: i32,
    pub rollover_pnl: f64,
    pub rollover_timestamp: Option<DateTime<Utc>>,
    pub original_expiry: Option<String>,
    pub original_strike: Option<i64>,
    pub original_entry_price: Option<f64>,

    /// Optimistic-concurrency version, bumped on every persisted write.
    pub version: i64,
}

impl Position {
    pub fn id_for(instrument: Instrument, label: &str) -> String {
        format!("{}_{}", instrument.as_str(), label)
    }

    /// Baseline position with the common fields filled in; callers layer on
    /// the per-route contract details.
    pub fn new(
        instrument: Instrument,
        label: &str,
        entry_timestamp: DateTime<Utc>,
        entry_price: f64,
        lots: i32,
        initial_stop: f64,
        atr: f64,
    ) -> Self {
        let cfg = instrument.config();
        Position {
            position_id: Self::id_for(instrument, label),
            instrument,
            status: PositionStatus::Open,
            entry_timestamp,
            entry_price,
            lots,
            quantity: lots * cfg.lot_size,
            initial_stop,
            current_stop: initial_stop,
            highest_close: entry_price,
            atr,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            exit_reason: None,
            limiter: None,
            risk_contribution: 0.0,
            vol_contribution: 0.0,
            is_base_position: false,
            strike: None,
            expiry: None,
            put_symbol: None,
            call_symbol: None,
            put_order_id: None,
            call_order_id: None,
            put_entry_price: None,
            call_entry_price: None,
            futures_symbol: None,
            futures_order_id: None,
            contract_month: None,
            rollover_status: RolloverStatus::None,
            rollover_count: 0,
            rollover_pnl: 0.0,
            rollover_timestamp: None,
            original_expiry: None,
            original_strike: None,
            original_entry_price: None,
            version: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Raise the protective stop, never lowering it.
    pub fn raise_stop(&mut self, candidate: f64) -> bool {
        if candidate > self.current_stop {
            self.current_stop = candidate;
            true
        } else {
            false
        }
    }
}
