use serde::{Deserialize, Serialize};

/// Why an operator confirmation is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationType {
    ValidationFailed,
    OrderFailed,
    ExitFailed,
    RollbackFailed,
    PartialFill,
    SlippageExceeded,
    ZeroLots,
    MissingSymbols,
}

impl ConfirmationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmationType::ValidationFailed => "validation_failed",
            ConfirmationType::OrderFailed => "order_failed",
            ConfirmationType::ExitFailed => "exit_failed",
            ConfirmationType::RollbackFailed => "rollback_failed",
            ConfirmationType::PartialFill => "partial_fill",
            ConfirmationType::SlippageExceeded => "slippage_exceeded",
            ConfirmationType::ZeroLots => "zero_lots",
            ConfirmationType::MissingSymbols => "missing_symbols",
        }
    }
}

/// Actions an operator can take. The callback payload carries the
/// snake_case form (`confirm:{id}:{action}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationAction {
    Cancel,
    Retry,
    Manual,
    ExecuteAnyway,
    Reject,
    AcceptSlippage,
    MarketOrder,
    ForceOneLot,
    Skip,
    KeepPartial,
}

impl ConfirmationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmationAction::Cancel => "cancel",
            ConfirmationAction::Retry => "retry",
            ConfirmationAction::Manual => "manual",
            ConfirmationAction::ExecuteAnyway => "execute_anyway",
            ConfirmationAction::Reject => "reject",
            ConfirmationAction::AcceptSlippage => "accept_slippage",
            ConfirmationAction::MarketOrder => "market_order",
            ConfirmationAction::ForceOneLot => "force_one_lot",
            ConfirmationAction::Skip => "skip",
            ConfirmationAction::KeepPartial => "keep_partial",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "cancel" => ConfirmationAction::Cancel,
            "retry" => ConfirmationAction::Retry,
            "manual" => ConfirmationAction::Manual,
            "execute_anyway" => ConfirmationAction::ExecuteAnyway,
            "reject" => ConfirmationAction::Reject,
            "accept_slippage" => ConfirmationAction::AcceptSlippage,
            "market_order" => ConfirmationAction::MarketOrder,
            "force_one_lot" => ConfirmationAction::ForceOneLot,
            "skip" => ConfirmationAction::Skip,
            "keep_partial" => ConfirmationAction::KeepPartial,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ConfirmationOption {
    pub action: ConfirmationAction,
    pub label: String,
    /// Taken on timeout or when every channel errors.
    pub is_default: bool,
}

impl ConfirmationOption {
    pub fn new(action: ConfirmationAction, label: &str, is_default: bool) -> Self {
        Self { action, label: label.to_string(), is_default }
    }
}

/// Which channel produced the resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseSource {
    Dialog,
    Chat,
    Timeout,
    Error,
    None,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfirmationResult {
    pub action: ConfirmationAction,
    pub confirmation_id: String,
    pub source: ResponseSource,
    pub response_time_seconds: f64,
}

/// Standard option set for validation failures: reject by default, with an
/// explicit override.
pub fn validation_options() -> Vec<ConfirmationOption> {
    vec![
        ConfirmationOption::new(ConfirmationAction::Reject, "Reject Signal", true),
        ConfirmationOption::new(ConfirmationAction::ExecuteAnyway, "Execute Anyway", false),
    ]
}

pub fn order_failure_options() -> Vec<ConfirmationOption> {
    vec![
        ConfirmationOption::new(ConfirmationAction::Retry, "Retry Order", false),
        ConfirmationOption::new(ConfirmationAction::Cancel, "Cancel", true),
        ConfirmationOption::new(ConfirmationAction::Manual, "Manual Override", false),
    ]
}

pub fn zero_lots_options() -> Vec<ConfirmationOption> {
    vec![
        ConfirmationOption::new(ConfirmationAction::ForceOneLot, "Force 1 Lot", false),
        ConfirmationOption::new(ConfirmationAction::Skip, "Skip Signal", true),
    ]
}

pub fn default_action(options: &[ConfirmationOption]) -> ConfirmationAction {
    options
        .iter()
        .find(|o| o.is_default)
        .or_else(|| options.first())
        .map(|o| o.action)
        .unwrap_or(ConfirmationAction::Cancel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_round_trip() {
        for action in [
            ConfirmationAction::Cancel,
            ConfirmationAction::ExecuteAnyway,
            ConfirmationAction::Reject,
            ConfirmationAction::ForceOneLot,
        ] {
            assert_eq!(ConfirmationAction::parse(action.as_str()), Some(action));
        }
        assert_eq!(ConfirmationAction::parse("yolo"), None);
    }

    #[test]
    fn default_option_selection() {
        assert_eq!(default_action(&validation_options()), ConfirmationAction::Reject);
        assert_eq!(default_action(&order_failure_options()), ConfirmationAction::Cancel);
        assert_eq!(default_action(&zero_lots_options()), ConfirmationAction::Skip);
        assert_eq!(default_action(&[]), ConfirmationAction::Cancel);
    }
}
