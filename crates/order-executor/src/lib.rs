pub mod partial;
pub mod progressive;
pub mod simple;
pub mod synthetic;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use broker_gateway::OrderAction;
use signal_core::config::PartialFillMode;

pub use progressive::ProgressiveExecutor;
pub use simple::SimpleLimitExecutor;
pub use synthetic::{SyntheticExecutor, SyntheticOutcome};

/// What a single-leg execution ended as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Executed,
    Rejected,
    Timeout,
    Partial,
}

/// Result of one order execution, partial fills included.
#[derive(Debug, Clone, Serialize)]
pub struct ExecOutcome {
    pub status: ExecutionStatus,
    pub execution_price: Option<f64>,
    pub lots_filled: Option<i32>,
    /// `(fill − signal_price) / signal_price`.
    pub slippage_pct: Option<f64>,
    pub rejection_reason: Option<String>,
    pub order_id: Option<String>,
    pub attempts: u32,
    pub lots_cancelled: Option<i32>,
    pub notes: Option<String>,
}

impl ExecOutcome {
    pub fn rejected(reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            status: ExecutionStatus::Rejected,
            execution_price: None,
            lots_filled: None,
            slippage_pct: None,
            rejection_reason: Some(reason.into()),
            order_id: None,
            attempts,
            lots_cancelled: None,
            notes: None,
        }
    }

    pub fn executed(price: f64, lots: i32, signal_price: f64, order_id: Option<String>, attempts: u32) -> Self {
        Self {
            status: ExecutionStatus::Executed,
            execution_price: Some(price),
            lots_filled: Some(lots),
            slippage_pct: slippage(price, signal_price),
            rejection_reason: None,
            order_id,
            attempts,
            lots_cancelled: None,
            notes: None,
        }
    }

    pub fn is_filled(&self) -> bool {
        matches!(self.status, ExecutionStatus::Executed | ExecutionStatus::Partial)
            && self.lots_filled.unwrap_or(0) > 0
    }
}

pub fn slippage(fill: f64, signal_price: f64) -> Option<f64> {
    (signal_price > 0.0).then(|| (fill - signal_price) / signal_price)
}

/// One order to execute: a concrete contract symbol plus the signal price
/// the slippage ceiling is anchored to.
#[derive(Debug, Clone)]
pub struct OrderSpec {
    pub symbol: String,
    pub exchange: String,
    pub action: OrderAction,
    pub lots: i32,
    pub lot_size: i32,
    pub signal_price: f64,
}

impl OrderSpec {
    pub fn quantity(&self) -> i32 {
        self.lots * self.lot_size
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_attempts: usize,
    /// Wait per attempt before improving the price.
    pub attempt_interval: Duration,
    /// Order-status polling cadence within an attempt.
    pub poll_interval: Duration,
    /// Cumulative price-improvement offsets per attempt.
    pub improvement_steps: Vec<f64>,
    /// Adverse-slippage ceiling vs the signal price.
    pub hard_slippage_limit: f64,
    pub partial_fill: PartialFillMode,
    pub partial_fill_wait: Duration,
    /// Confirmation window after the market-order fallback.
    pub market_confirm_wait: Duration,
    /// Simple-limit strategy: total fill timeout.
    pub simple_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            attempt_interval: Duration::from_secs(10),
            poll_interval: Duration::from_secs(2),
            improvement_steps: vec![0.0, 0.005, 0.01, 0.015],
            hard_slippage_limit: 0.02,
            partial_fill: PartialFillMode::Cancel,
            partial_fill_wait: Duration::from_secs(30),
            market_confirm_wait: Duration::from_secs(2),
            simple_timeout: Duration::from_secs(30),
        }
    }
}

/// Strategy seam: simple-limit and progressive both implement this, and the
/// synthetic executor drives its legs through it.
#[async_trait]
pub trait OrderExecutor: Send + Sync {
    async fn execute(&self, spec: &OrderSpec, limit_price: f64) -> ExecOutcome;
}
