use chrono::{DateTime, Utc};
use serde::Serialize;

use signal_core::signal::validate_position_label;
use signal_core::{Signal, SignalKind};

/// Severity bucket derived from signal age: fresh (<10s), aging (<30s),
/// old but still admissible (<60s).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Normal,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Normal => "normal",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// Outcome of stage-1 condition validation (signal-price based).
#[derive(Debug, Clone, Serialize)]
pub struct ConditionResult {
    pub is_valid: bool,
    pub severity: Severity,
    pub signal_age_seconds: f64,
    pub reason: Option<String>,
}

/// Outcome of stage-2 execution validation (live broker-price based).
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub is_valid: bool,
    pub divergence_pct: f64,
    pub risk_increase_pct: Option<f64>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub max_signal_age_seconds: f64,
    pub base_entry_divergence_threshold: f64,
    pub pyramid_divergence_threshold: f64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_signal_age_seconds: 60.0,
            base_entry_divergence_threshold: 0.02,
            pyramid_divergence_threshold: 0.01,
        }
    }
}

/// Two-stage signal validator. Stage 1 trusts the signal's own price and
/// gates on freshness and field sanity; stage 2 compares against the live
/// broker price fetched by the engine.
#[derive(Debug, Clone, Default)]
pub struct SignalValidator {
    config: ValidatorConfig,
}

impl SignalValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    fn severity_for_age(&self, age: f64) -> Severity {
        if age < 10.0 {
            Severity::Normal
        } else if age < 30.0 {
            Severity::Warning
        } else {
            Severity::Critical
        }
    }

    pub fn validate_conditions(&self, signal: &Signal, now: DateTime<Utc>) -> ConditionResult {
        let age = signal.age_seconds(now);
        let severity = self.severity_for_age(age);

        let fail = |reason: &str| ConditionResult {
            is_valid: false,
            severity,
            signal_age_seconds: age,
            reason: Some(reason.to_string()),
        };

        if age > self.config.max_signal_age_seconds {
            return fail("signal_stale");
        }

        if !signal.price.is_finite() || signal.price <= 0.0 {
            return fail("invalid_price");
        }

        let needs_stop = matches!(signal.kind, SignalKind::BaseEntry | SignalKind::Pyramid);
        match signal.stop {
            Some(stop) => {
                if !stop.is_finite() || stop <= 0.0 {
                    return fail("invalid_stop");
                }
                // Long-only system: the protective stop sits below price.
                if needs_stop && stop >= signal.price {
                    return fail("stop_above_price");
                }
            }
            None if needs_stop => return fail("missing_stop"),
            None => {}
        }

        let allow_all = signal.kind == SignalKind::Exit;
        if validate_position_label(&signal.position, allow_all).is_err() {
            return fail("invalid_position_label");
        }

        if signal.kind == SignalKind::Exit
            && signal.reason.as_deref().map(str::trim).unwrap_or("").is_empty()
        {
            return fail("missing_exit_reason");
        }

        ConditionResult { is_valid: true, severity, signal_age_seconds: age, reason: None }
    }

    /// Stage 2: compare the live broker price against the signal price.
    /// BASE_ENTRY tolerates 2% divergence, PYRAMID 1%; anything past the
    /// threshold escalates to the operator.
    pub fn validate_execution_price(
        &self,
        signal: &Signal,
        broker_price: f64,
        kind: SignalKind,
    ) -> ExecutionResult {
        let divergence = if signal.price > 0.0 {
            ((broker_price - signal.price) / signal.price).abs()
        } else {
            0.0
        };

        let threshold = match kind {
            SignalKind::Pyramid => self.config.pyramid_divergence_threshold,
            _ => self.config.base_entry_divergence_threshold,
        };

        let risk_increase_pct = signal.stop.and_then(|stop| {
            let stop_distance = signal.price - stop;
            (stop_distance > 0.0).then(|| (broker_price - signal.price) / stop_distance)
        });

        if divergence > threshold {
            return ExecutionResult {
                is_valid: false,
                divergence_pct: divergence,
                risk_increase_pct,
                reason: Some("excessive_divergence".to_string()),
            };
        }

        ExecutionResult {
            is_valid: true,
            divergence_pct: divergence,
            risk_increase_pct,
            reason: None,
        }
    }

    /// Shrink the lot count so the rupee risk at the broker price stays
    /// within what was budgeted at the signal price. Only ever adjusts
    /// downward.
    pub fn adjust_lots_for_execution(&self, signal: &Signal, broker_price: f64, lots: i32) -> i32 {
        let Some(stop) = signal.stop else { return lots };
        let signal_risk = signal.price - stop;
        let broker_risk = broker_price - stop;
        if signal_risk <= 0.0 || broker_risk <= signal_risk {
            return lots;
        }
        let adjusted = ((lots as f64) * signal_risk / broker_risk).floor() as i32;
        adjusted.clamp(0, lots)
    }
}
