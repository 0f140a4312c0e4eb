use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::instrument::Instrument;
use crate::signal::SignalKind;

/// Terminal outcome of one processed signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalOutcome {
    Processed,
    RejectedValidation,
    RejectedRisk,
    RejectedDuplicate,
    RejectedMarket,
    RejectedManual,
    FailedOrder,
    PartialFill,
}

impl SignalOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalOutcome::Processed => "processed",
            SignalOutcome::RejectedValidation => "rejected_validation",
            SignalOutcome::RejectedRisk => "rejected_risk",
            SignalOutcome::RejectedDuplicate => "rejected_duplicate",
            SignalOutcome::RejectedMarket => "rejected_market",
            SignalOutcome::RejectedManual => "rejected_manual",
            SignalOutcome::FailedOrder => "failed_order",
            SignalOutcome::PartialFill => "partial_fill",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationAudit {
    pub is_valid: bool,
    pub stage: String,
    pub severity: Option<String>,
    pub signal_age_seconds: Option<f64>,
    pub divergence_pct: Option<f64>,
    pub risk_increase_pct: Option<f64>,
    pub reason: Option<String>,
    pub bypassed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SizingAudit {
    pub equity_high: f64,
    pub stop_distance: Option<f64>,
    pub atr: f64,
    pub er: f64,
    pub lots: i32,
    pub limiter: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskAudit {
    pub margin_available: Option<f64>,
    pub margin_required: Option<f64>,
    pub pre_trade_risk_pct: Option<f64>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderAudit {
    pub order_id: Option<String>,
    pub order_type: Option<String>,
    pub status: Option<String>,
    pub signal_price: f64,
    pub execution_price: Option<f64>,
    pub slippage_pct: Option<f64>,
    pub attempts: i32,
}

/// One audit row per processed signal, with the structured sub-records the
/// operator console renders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub fingerprint: String,
    pub instrument: Instrument,
    pub kind: SignalKind,
    pub position: String,
    pub signal_timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub outcome: SignalOutcome,
    pub outcome_reason: String,
    pub validation: Option<ValidationAudit>,
    pub sizing: Option<SizingAudit>,
    pub risk: Option<RiskAudit>,
    pub order: Option<OrderAudit>,
    pub processing_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_strings() {
        assert_eq!(SignalOutcome::Processed.as_str(), "processed");
        assert_eq!(SignalOutcome::RejectedDuplicate.as_str(), "rejected_duplicate");
        assert_eq!(SignalOutcome::FailedOrder.as_str(), "failed_order");
    }
}
