use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::json;

use broker_gateway::{BrokerApi, OrderAction};
use confirmation_manager::{
    validation_options, ConfirmationAction, ConfirmationManager, ConfirmationType,
};
use db_state::{DbStateManager, PortfolioStateRecord};
use eod_scheduler::{market_offset, EodMonitor, PositionStatusView};
use order_executor::{
    ExecOutcome, ExecutorConfig, OrderExecutor, OrderSpec, ProgressiveExecutor,
    SimpleLimitExecutor, SyntheticExecutor, SyntheticOutcome,
};
use order_executor::synthetic::SyntheticConfig;
use portfolio_state::{Portfolio, StopManager};
use position_sizer::{PositionSizer, SizingConstraints};
use rollover_engine::{BatchRolloverResult, RolloverConfig, RolloverEngine};
use signal_core::config::ExecutionStrategy;
use signal_core::{
    symbols, AuditRecord, Instrument, OrderAudit, Position, PositionStatus, RiskAudit,
    ServiceConfig, Signal, SignalKind, SignalOutcome, SizingAudit, ValidationAudit,
};
use signal_validation::{SignalValidator, ValidatorConfig};

use crate::stats::EngineStats;

/// Business-level outcome of one processed signal, embedded in the webhook
/// response. All of these map to HTTP 200; transport-level failures do not
/// come through here.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub detail: serde_json::Value,
}

impl ProcessOutcome {
    pub fn executed(detail: serde_json::Value) -> Self {
        Self { status: "executed".to_string(), reason: None, detail }
    }
    pub fn blocked(reason: impl Into<String>) -> Self {
        Self { status: "blocked".to_string(), reason: Some(reason.into()), detail: json!(null) }
    }
    pub fn rejected(reason: impl Into<String>, detail: serde_json::Value) -> Self {
        Self { status: "rejected".to_string(), reason: Some(reason.into()), detail }
    }
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self { status: "skipped".to_string(), reason: Some(reason.into()), detail: json!(null) }
    }
    pub fn error(reason: impl Into<String>) -> Self {
        Self { status: "error".to_string(), reason: Some(reason.into()), detail: json!(null) }
    }
}

/// Orchestrates validation, sizing, risk gating, execution and persistence
/// for every signal. A single in-process lock serializes signal handling;
/// fleet-wide exclusivity is the coordinator's job.
pub struct LiveEngine {
    pub(crate) config: ServiceConfig,
    pub(crate) broker: Arc<dyn BrokerApi>,
    pub(crate) executor: Arc<dyn OrderExecutor>,
    pub(crate) synthetic: Arc<SyntheticExecutor>,
    pub(crate) rollover: RolloverEngine,
    pub(crate) sizer: PositionSizer,
    pub(crate) validator: SignalValidator,
    pub(crate) stops: StopManager,
    pub(crate) portfolio: tokio::sync::Mutex<Portfolio>,
    pub(crate) db: Option<Arc<DbStateManager>>,
    pub(crate) confirmations: Option<Arc<ConfirmationManager>>,
    pub(crate) eod_monitor: Arc<EodMonitor>,
    pub(crate) stats: EngineStats,
    pub(crate) instance_id: String,
}

impl LiveEngine {
    pub fn new(
        config: ServiceConfig,
        broker: Arc<dyn BrokerApi>,
        db: Option<Arc<DbStateManager>>,
        confirmations: Option<Arc<ConfirmationManager>>,
        instance_id: String,
    ) -> Result<Self> {
        let executor_config = ExecutorConfig {
            hard_slippage_limit: config.hard_slippage_limit,
            partial_fill: config.partial_fill_strategy,
            partial_fill_wait: Duration::from_secs(config.partial_fill_wait_timeout_secs),
            ..ExecutorConfig::default()
        };
        let executor: Arc<dyn OrderExecutor> = match config.execution_strategy {
            ExecutionStrategy::Progressive => {
                Arc::new(ProgressiveExecutor::new(broker.clone(), executor_config.clone()))
            }
            ExecutionStrategy::SimpleLimit => {
                Arc::new(SimpleLimitExecutor::new(broker.clone(), executor_config.clone()))
            }
        };

        let bank_nifty = Instrument::BankNifty.config();
        let synthetic = Arc::new(SyntheticExecutor::new(
            broker.clone(),
            executor.clone(),
            SyntheticConfig {
                symbol_root: bank_nifty.symbol_root.to_string(),
                exchange: bank_nifty.exchange.as_str().to_string(),
                lot_size: bank_nifty.lot_size,
                strike_interval: config.strike_interval,
                use_monthly_expiry: config.use_monthly_expiry,
                rollover_days: bank_nifty.rollover_days,
                spaced_symbols: config.spaced_symbols(),
            },
        ));

        let rollover = RolloverEngine::new(
            broker.clone(),
            RolloverConfig {
                strike_interval: config.strike_interval,
                prefer_1000s: config.rollover_prefer_1000s,
                spaced_symbols: config.spaced_symbols(),
                retry: rollover_engine::RetryExecutorConfig {
                    initial_buffer_pct: config.rollover_initial_buffer_pct,
                    increment_pct: config.rollover_increment_pct,
                    max_retries: config.rollover_max_retries,
                    retry_interval: Duration::from_secs(config.rollover_retry_interval_sec),
                },
            },
        );

        let sizer = PositionSizer::new(
            config.risk_percent,
            config.margin_per_lot,
            config.vol_percent,
            config.pyramid_shrink_factor,
        )?;

        let validator = SignalValidator::new(ValidatorConfig {
            max_signal_age_seconds: config.max_signal_age_seconds,
            base_entry_divergence_threshold: config.base_entry_divergence_threshold,
            pyramid_divergence_threshold: config.pyramid_divergence_threshold,
        });

        let portfolio = Portfolio::new(
            config.initial_capital,
            config.max_portfolio_risk_percent,
            config.max_portfolio_vol_percent,
        );

        Ok(Self {
            config,
            broker,
            executor,
            synthetic,
            rollover,
            sizer,
            validator,
            stops: StopManager,
            portfolio: tokio::sync::Mutex::new(portfolio),
            db,
            confirmations,
            eod_monitor: Arc::new(EodMonitor::new()),
            stats: EngineStats::default(),
            instance_id,
        })
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn eod_monitor(&self) -> Arc<EodMonitor> {
        self.eod_monitor.clone()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Rehydrate portfolio state and open positions after a restart.
    pub async fn restore_state(&self) -> Result<()> {
        let Some(db) = &self.db else { return Ok(()) };

        let state = db.get_portfolio_state().await?;
        let positions = db.get_open_positions().await?;
        let pyramid = db.get_pyramiding_state().await?;

        let mut portfolio = self.portfolio.lock().await;
        let (closed_equity, equity_high) = state
            .map(|s| (s.closed_equity, s.equity_high))
            .unwrap_or((self.config.initial_capital, self.config.initial_capital));
        let count = positions.len();
        portfolio.restore(
            closed_equity,
            equity_high,
            positions,
            pyramid
                .into_iter()
                .map(|p| (p.instrument, p.last_pyramid_price, p.base_position_id))
                .collect(),
        );
        tracing::info!(positions = count, closed_equity, "engine state restored from database");
        Ok(())
    }

    fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&market_offset()).date_naive()
    }

    /// Current tradeable contract symbol for the instrument's single-leg
    /// path (also used as the quote symbol for stage-2 validation).
    fn current_contract_symbol(&self, instrument: Instrument) -> String {
        let cfg = instrument.config();
        let expiry = if instrument.is_synthetic() {
            symbols::monthly_option_expiry(self.today(), cfg.rollover_days)
        } else {
            symbols::futures_expiry(self.today(), cfg.rollover_days)
        };
        symbols::futures_symbol(cfg.symbol_root, &symbols::format_expiry(expiry), self.config.spaced_symbols())
    }

    /// Available margin from the broker's funds endpoint, consulted before
    /// every entry sizing. Sizing fails closed when the broker cannot be
    /// reached: no funds, no lots.
    async fn broker_available_margin(&self) -> f64 {
        match self.broker.funds().await {
            Ok(funds) => funds.availablecash,
            Err(e) => {
                tracing::error!(error = %e, "funds fetch failed, sizing with zero margin");
                0.0
            }
        }
    }

    /// Live broker mid with timeout and retries. Returns the fallback price
    /// and `bypassed = true` when the broker cannot be reached; validation
    /// is recorded as bypassed rather than failing the signal.
    async fn broker_price_with_timeout(&self, instrument: Instrument, fallback: f64) -> (f64, bool) {
        let symbol = self.current_contract_symbol(instrument);
        let exchange = instrument.config().exchange.as_str();
        let backoffs = [0.0f64, 0.5, 1.0];

        for (attempt, backoff) in backoffs.iter().enumerate() {
            if *backoff > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(*backoff)).await;
            }
            match tokio::time::timeout(Duration::from_secs(2), self.broker.quote(&symbol, exchange))
                .await
            {
                Ok(Ok(quote)) => {
                    if let Some(mid) = quote.mid() {
                        return (mid, false);
                    }
                    tracing::warn!(symbol = %symbol, attempt, "empty quote from broker");
                }
                Ok(Err(e)) => {
                    tracing::warn!(symbol = %symbol, attempt, error = %e, "quote fetch failed");
                }
                Err(_) => {
                    tracing::warn!(symbol = %symbol, attempt, "quote fetch timed out");
                }
            }
        }
        tracing::warn!(
            instrument = instrument.as_str(),
            fallback,
            "broker price unavailable, bypassing execution validation"
        );
        (fallback, true)
    }

    /// Escalate a recoverable failure to the operator. Without a
    /// confirmation manager the default action (reject) is taken.
    async fn escalate(
        &self,
        kind: ConfirmationType,
        context: BTreeMap<String, String>,
    ) -> ConfirmationAction {
        match &self.confirmations {
            Some(manager) => {
                let options = validation_options();
                manager
                    .request_confirmation(kind, &context, &options, None)
                    .await
                    .action
            }
            None => {
                tracing::warn!(kind = kind.as_str(), "no confirmation manager, auto-rejecting");
                ConfirmationAction::Reject
            }
        }
    }

    pub(crate) async fn log_audit(&self, signal: &Signal, record: AuditRecord) {
        if let Some(db) = &self.db {
            if let Err(e) = db.log_audit(&record).await {
                tracing::warn!(error = %e, "failed to write signal audit row");
            }
            if let Err(e) = db
                .log_signal(signal, &record.fingerprint, &self.instance_id, record.outcome.as_str())
                .await
            {
                tracing::warn!(error = %e, "failed to write signal log row");
            }
        }
    }

    pub(crate) fn audit_base(
        &self,
        signal: &Signal,
        outcome: SignalOutcome,
        reason: &str,
        started: DateTime<Utc>,
    ) -> AuditRecord {
        AuditRecord {
            fingerprint: signal.fingerprint(),
            instrument: signal.instrument,
            kind: signal.kind,
            position: signal.position.clone(),
            signal_timestamp: signal.timestamp,
            received_at: started,
            outcome,
            outcome_reason: reason.to_string(),
            validation: None,
            sizing: None,
            risk: None,
            order: None,
            processing_ms: (Utc::now() - started).num_milliseconds(),
        }
    }

    pub(crate) async fn persist_position(&self, position: &Position) {
        if let Some(db) = &self.db {
            if let Err(e) = db.save_position(position).await {
                tracing::error!(position_id = %position.position_id, error = %e, "failed to persist position");
            }
        }
    }

    pub(crate) async fn persist_portfolio(&self, portfolio: &Portfolio) {
        if let Some(db) = &self.db {
            let snapshot = portfolio.snapshot();
            let record = PortfolioStateRecord {
                closed_equity: snapshot.closed_equity,
                equity_high: snapshot.equity_high,
                total_risk_amount: snapshot.total_risk_amount,
                total_vol_amount: snapshot.total_vol_amount,
                margin_used: snapshot.margin_used,
                initial_capital: snapshot.initial_capital,
            };
            if let Err(e) = db.save_portfolio_state(&record).await {
                tracing::error!(error = %e, "failed to persist portfolio state");
            }
        }
    }

    pub(crate) async fn persist_pyramiding(&self, instrument: Instrument, last_price: f64, base_id: Option<&str>) {
        if let Some(db) = &self.db {
            if let Err(e) = db.save_pyramiding_state(instrument, last_price, base_id).await {
                tracing::error!(error = %e, "failed to persist pyramiding state");
            }
        }
    }

    // =====================================================================
    // Signal dispatch
    // =====================================================================

    pub async fn process_signal(&self, signal: &Signal) -> ProcessOutcome {
        let started = Utc::now();
        self.stats.record_signal(started);

        // A pre-close EOD execution marks the bar's fingerprint; the
        // bar-close signal that follows is a duplicate of work already done.
        if self.config.eod_enabled
            && self
                .eod_monitor
                .was_executed_at_eod(&signal.eod_fingerprint(), signal.kind)
        {
            tracing::info!(
                kind = signal.kind.as_str(),
                instrument = signal.instrument.as_str(),
                "skipping signal already executed at EOD"
            );
            self.log_audit(signal, self.audit_base(
                signal,
                SignalOutcome::RejectedDuplicate,
                "already_executed_at_eod",
                started,
            ))
            .await;
            return ProcessOutcome::skipped("already_executed_at_eod");
        }

        tracing::info!(
            kind = signal.kind.as_str(),
            instrument = signal.instrument.as_str(),
            position = %signal.position,
            price = signal.price,
            "processing signal"
        );

        // Stage 1: condition validation on the signal's own price.
        if self.config.signal_validation_enabled && !self.config.test_mode {
            let condition = self.validator.validate_conditions(signal, started);
            if !condition.is_valid {
                let reason = condition.reason.clone().unwrap_or_else(|| "invalid".to_string());
                tracing::warn!(
                    reason = %reason,
                    age_secs = condition.signal_age_seconds,
                    "condition validation failed, escalating"
                );

                let context = BTreeMap::from([
                    ("instrument".to_string(), signal.instrument.as_str().to_string()),
                    ("signal_type".to_string(), signal.kind.as_str().to_string()),
                    ("reason".to_string(), reason.clone()),
                    (
                        "signal_age".to_string(),
                        format!("{:.1}s", condition.signal_age_seconds),
                    ),
                ]);
                let action = self.escalate(ConfirmationType::ValidationFailed, context).await;
                if action != ConfirmationAction::ExecuteAnyway {
                    let mut record = self.audit_base(
                        signal,
                        SignalOutcome::RejectedValidation,
                        &format!("condition_validation_failed: {reason}"),
                        started,
                    );
                    record.validation = Some(ValidationAudit {
                        is_valid: false,
                        stage: "condition".to_string(),
                        severity: Some(condition.severity.as_str().to_string()),
                        signal_age_seconds: Some(condition.signal_age_seconds),
                        reason: Some(reason.clone()),
                        ..Default::default()
                    });
                    self.log_audit(signal, record).await;
                    return ProcessOutcome {
                        status: "rejected".to_string(),
                        reason: Some("validation_failed".to_string()),
                        detail: json!({
                            "validation_stage": "condition",
                            "validation_reason": reason,
                            "signal_age_seconds": condition.signal_age_seconds,
                        }),
                    };
                }
                tracing::info!("operator approved execution despite validation failure");
            }
        } else if self.config.test_mode {
            tracing::info!("test mode: bypassing signal validation");
        }

        match signal.kind {
            SignalKind::BaseEntry => self.handle_base_entry(signal, started).await,
            SignalKind::Pyramid => self.handle_pyramid(signal, started).await,
            SignalKind::Exit => self.handle_exit(signal, started).await,
            SignalKind::MarketData => self.handle_market_data(signal).await,
            SignalKind::EodMonitor => {
                // Scout-mode EOD update with no explicit intent attached.
                self.process_eod_monitor(signal.clone(), None, None).await
            }
        }
    }

    // =====================================================================
    // BASE_ENTRY
    // =====================================================================

    async fn handle_base_entry(&self, signal: &Signal, started: DateTime<Utc>) -> ProcessOutcome {
        let instrument = signal.instrument;
        let inst_config = instrument.config();
        let Some(stop) = signal.stop else {
            return ProcessOutcome::error("missing_stop");
        };

        // Margin comes from the broker's live funds; risk sizing uses the
        // equity high-water mark so sizes stay steady through drawdowns.
        let available_margin = self.broker_available_margin().await;

        let mut portfolio = self.portfolio.lock().await;
        let equity_high = portfolio.equity_high;
        let equity = portfolio.closed_equity;

        let constraints = self.sizer.base_entry(
            signal.price,
            stop,
            signal.atr,
            equity_high,
            equity,
            available_margin,
            inst_config.point_value,
        );

        let sizing_audit = SizingAudit {
            equity_high,
            stop_distance: Some(signal.price - stop),
            atr: signal.atr,
            er: signal.er,
            lots: constraints.final_lots,
            limiter: Some(constraints.limiter.as_str().to_string()),
        };

        if constraints.final_lots == 0 {
            EngineStats::bump(&self.stats.entries_blocked);
            let mut record = self.audit_base(
                signal,
                SignalOutcome::RejectedRisk,
                &format!("zero_lots_calculated: limited by {}", constraints.limiter.as_str()),
                started,
            );
            record.sizing = Some(sizing_audit);
            self.log_audit(signal, record).await;
            return ProcessOutcome::blocked(format!(
                "zero_lots_limited_by_{}",
                constraints.limiter.as_str()
            ));
        }

        // Portfolio-wide gate.
        let est_risk = (signal.price - stop) * constraints.final_lots as f64 * inst_config.point_value;
        let est_vol = signal.atr * constraints.final_lots as f64 * inst_config.point_value;
        let (allowed, gate_reason) = portfolio.check_portfolio_gate(est_risk, est_vol);
        if !allowed {
            EngineStats::bump(&self.stats.entries_blocked);
            let mut record = self.audit_base(
                signal,
                SignalOutcome::RejectedRisk,
                &format!("portfolio_gate_blocked: {gate_reason}"),
                started,
            );
            record.sizing = Some(sizing_audit);
            record.risk = Some(RiskAudit {
                margin_available: Some(available_margin),
                margin_required: Some(constraints.final_lots as f64 * self.config.margin_per_lot),
                pre_trade_risk_pct: (equity_high > 0.0).then(|| est_risk / equity_high * 100.0),
                reason: Some(gate_reason.clone()),
            });
            self.log_audit(signal, record).await;
            return ProcessOutcome::blocked(gate_reason);
        }

        // Stage 2: execution validation against the live broker price.
        let (execution_price, validation) = match self
            .run_execution_validation(signal, SignalKind::BaseEntry)
            .await
        {
            Ok(pair) => pair,
            Err(outcome) => {
                EngineStats::bump(&self.stats.entries_blocked);
                let mut record = self.audit_base(
                    signal,
                    SignalOutcome::RejectedValidation,
                    "execution_validation_failed",
                    started,
                );
                record.sizing = Some(sizing_audit);
                self.log_audit(signal, record).await;
                return *outcome;
            }
        };

        // Test mode executes one lot while logging the calculated size.
        let calculated_lots = constraints.final_lots;
        let lots = if self.config.test_mode {
            tracing::warn!(
                calculated_lots,
                "test mode: overriding base entry quantity to 1 lot"
            );
            1
        } else {
            constraints.final_lots
        };

        let execution = self
            .execute_entry(signal, instrument, lots, execution_price)
            .await;

        match execution {
            EntryExecution::Synthetic(outcome) if outcome.status == order_executor::ExecutionStatus::Executed => {
                let entry_price = outcome.synthetic_price().unwrap_or(execution_price);
                let position = self.build_position(
                    signal,
                    instrument,
                    lots,
                    entry_price,
                    &constraints,
                    true,
                    Some(&outcome),
                    None,
                );
                self.commit_entry(&mut portfolio, signal, position, started, sizing_audit, est_risk, available_margin, entry_price)
                    .await
            }
            EntryExecution::Futures(exec) if exec.is_filled() => {
                let filled_lots = exec.lots_filled.unwrap_or(lots);
                let entry_price = exec.execution_price.unwrap_or(execution_price);
                let mut constraints = constraints.clone();
                constraints.final_lots = filled_lots;
                let position = self.build_position(
                    signal,
                    instrument,
                    filled_lots,
                    entry_price,
                    &constraints,
                    true,
                    None,
                    Some(&exec),
                );
                self.commit_entry(&mut portfolio, signal, position, started, sizing_audit, est_risk, available_margin, entry_price)
                    .await
            }
            EntryExecution::Synthetic(outcome) => {
                EngineStats::bump(&self.stats.orders_failed);
                let reason = outcome
                    .rejection_reason
                    .clone()
                    .unwrap_or_else(|| "synthetic_execution_failed".to_string());
                self.handle_rollback_escalation(&outcome, signal).await;
                let mut record =
                    self.audit_base(signal, SignalOutcome::FailedOrder, &reason, started);
                record.sizing = Some(sizing_audit);
                record.validation = validation;
                record.order = Some(OrderAudit {
                    order_type: Some("BASE_ENTRY".to_string()),
                    status: Some("rejected".to_string()),
                    signal_price: signal.price,
                    ..Default::default()
                });
                self.log_audit(signal, record).await;
                ProcessOutcome::rejected(
                    "execution_failed",
                    json!({ "execution_reason": reason, "notes": outcome.notes }),
                )
            }
            EntryExecution::Futures(exec) => {
                EngineStats::bump(&self.stats.orders_failed);
                let reason = exec
                    .rejection_reason
                    .clone()
                    .unwrap_or_else(|| "execution_failed".to_string());
                let mut record =
                    self.audit_base(signal, SignalOutcome::FailedOrder, &reason, started);
                record.sizing = Some(sizing_audit);
                record.validation = validation;
                record.order = Some(OrderAudit {
                    order_id: exec.order_id.clone(),
                    order_type: Some("BASE_ENTRY".to_string()),
                    status: Some("rejected".to_string()),
                    signal_price: signal.price,
                    attempts: exec.attempts as i32,
                    ..Default::default()
                });
                self.log_audit(signal, record).await;
                ProcessOutcome::rejected("execution_failed", json!({ "execution_reason": reason }))
            }
        }
    }

    /// Stage-2 validation. On success returns (execution price, audit).
    /// On operator rejection returns the outbound outcome.
    async fn run_execution_validation(
        &self,
        signal: &Signal,
        kind: SignalKind,
    ) -> Result<(f64, Option<ValidationAudit>), Box<ProcessOutcome>> {
        if !self.config.signal_validation_enabled {
            return Ok((signal.price, None));
        }

        let (broker_price, bypassed) = self
            .broker_price_with_timeout(signal.instrument, signal.price)
            .await;
        tracing::info!(
            broker_price,
            signal_price = signal.price,
            bypassed,
            "stage-2 price check"
        );

        if bypassed || self.config.test_mode {
            return Ok((
                broker_price,
                Some(ValidationAudit {
                    is_valid: true,
                    stage: "execution".to_string(),
                    bypassed: true,
                    ..Default::default()
                }),
            ));
        }

        let result = self.validator.validate_execution_price(signal, broker_price, kind);
        let audit = ValidationAudit {
            is_valid: result.is_valid,
            stage: "execution".to_string(),
            divergence_pct: Some(result.divergence_pct),
            risk_increase_pct: result.risk_increase_pct,
            reason: result.reason.clone(),
            ..Default::default()
        };

        if result.is_valid {
            return Ok((broker_price, Some(audit)));
        }

        let reason = result.reason.clone().unwrap_or_else(|| "invalid".to_string());
        tracing::warn!(
            reason = %reason,
            divergence_pct = result.divergence_pct,
            "execution validation failed, escalating"
        );
        let context = BTreeMap::from([
            ("instrument".to_string(), signal.instrument.as_str().to_string()),
            ("signal_type".to_string(), signal.kind.as_str().to_string()),
            ("reason".to_string(), reason.clone()),
            (
                "divergence".to_string(),
                format!("{:.2}%", result.divergence_pct * 100.0),
            ),
        ]);
        let action = self.escalate(ConfirmationType::ValidationFailed, context).await;
        if action == ConfirmationAction::ExecuteAnyway {
            tracing::info!("operator approved execution despite divergence");
            return Ok((broker_price, Some(audit)));
        }

        Err(Box::new(ProcessOutcome {
            status: "rejected".to_string(),
            reason: Some("validation_failed".to_string()),
            detail: json!({
                "validation_stage": "execution",
                "validation_reason": reason,
                "divergence_pct": result.divergence_pct,
                "risk_increase_pct": result.risk_increase_pct,
            }),
        }))
    }

    async fn execute_entry(
        &self,
        signal: &Signal,
        instrument: Instrument,
        lots: i32,
        execution_price: f64,
    ) -> EntryExecution {
        if instrument.is_synthetic() {
            EntryExecution::Synthetic(
                self.synthetic
                    .execute_entry(execution_price, lots, self.today())
                    .await,
            )
        } else {
            let spec = OrderSpec {
                symbol: self.current_contract_symbol(instrument),
                exchange: instrument.config().exchange.as_str().to_string(),
                action: OrderAction::Buy,
                lots,
                lot_size: instrument.config().lot_size,
                signal_price: signal.price,
            };
            EntryExecution::Futures(self.executor.execute(&spec, execution_price).await)
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn build_position(
        &self,
        signal: &Signal,
        instrument: Instrument,
        lots: i32,
        entry_price: f64,
        constraints: &SizingConstraints,
        is_base: bool,
        synthetic: Option<&SyntheticOutcome>,
        futures: Option<&ExecOutcome>,
    ) -> Position {
        let inst_config = instrument.config();
        let initial_stop = self.stops.initial_stop(signal.price, signal.atr, instrument);
        let mut position = Position::new(
            instrument,
            &signal.position,
            signal.timestamp,
            entry_price,
            lots,
            initial_stop,
            signal.atr,
        );
        position.is_base_position = is_base;
        position.limiter = Some(constraints.limiter.as_str().to_string());
        position.risk_contribution =
            (signal.price - signal.stop.unwrap_or(initial_stop)) * lots as f64 * inst_config.point_value;
        position.vol_contribution = signal.atr * lots as f64 * inst_config.point_value;
        position.highest_close = signal.price;

        if let Some(outcome) = synthetic {
            position.strike = outcome.strike;
            position.expiry = outcome.expiry.clone();
            if let Some(put) = &outcome.put {
                position.put_symbol = Some(put.symbol.clone());
                position.put_order_id = put.order_id.clone();
                position.put_entry_price = Some(put.fill_price);
            }
            if let Some(call) = &outcome.call {
                position.call_symbol = Some(call.symbol.clone());
                position.call_order_id = call.order_id.clone();
                position.call_entry_price = Some(call.fill_price);
            }
        }
        if let Some(exec) = futures {
            position.futures_symbol = Some(self.current_contract_symbol(instrument));
            position.futures_order_id = exec.order_id.clone();
            position.contract_month = Some(symbols::format_expiry(symbols::futures_expiry(
                self.today(),
                inst_config.rollover_days,
            )));
        }
        position
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit_entry(
        &self,
        portfolio: &mut Portfolio,
        signal: &Signal,
        position: Position,
        started: DateTime<Utc>,
        sizing_audit: SizingAudit,
        est_risk: f64,
        available_margin: f64,
        entry_price: f64,
    ) -> ProcessOutcome {
        let position_id = position.position_id.clone();
        let lots = position.lots;
        let is_base = position.is_base_position;
        let order_id = position
            .put_order_id
            .clone()
            .or_else(|| position.futures_order_id.clone());

        portfolio.add_position(position.clone());
        portfolio.set_last_pyramid_price(signal.instrument, signal.price);

        self.persist_position(&position).await;
        self.persist_pyramiding(
            signal.instrument,
            signal.price,
            portfolio.base_position_id(signal.instrument).map(String::as_str),
        )
        .await;
        self.persist_portfolio(portfolio).await;

        if is_base {
            EngineStats::bump(&self.stats.entries_executed);
        } else {
            EngineStats::bump(&self.stats.pyramids_executed);
        }

        tracing::info!(
            position_id = %position_id,
            lots,
            entry_price,
            signal_price = signal.price,
            "entry executed"
        );

        let mut record = self.audit_base(
            signal,
            SignalOutcome::Processed,
            if is_base { "base_entry_executed" } else { "pyramid_executed" },
            started,
        );
        record.sizing = Some(sizing_audit);
        record.risk = Some(RiskAudit {
            margin_available: Some(available_margin),
            margin_required: Some(lots as f64 * self.config.margin_per_lot),
            pre_trade_risk_pct: (portfolio.equity_high > 0.0)
                .then(|| est_risk / portfolio.equity_high * 100.0),
            reason: None,
        });
        record.order = Some(OrderAudit {
            order_id,
            order_type: Some(signal.kind.as_str().to_string()),
            status: Some("executed".to_string()),
            signal_price: signal.price,
            execution_price: Some(entry_price),
            slippage_pct: order_executor::slippage(entry_price, signal.price),
            attempts: 1,
        });
        self.log_audit(signal, record).await;

        ProcessOutcome::executed(json!({
            "position_id": position_id,
            "lots": lots,
            "entry_price": entry_price,
        }))
    }

    async fn handle_rollback_escalation(&self, outcome: &SyntheticOutcome, signal: &Signal) {
        if outcome.rollback_performed && !outcome.rollback_success {
            tracing::error!(
                instrument = signal.instrument.as_str(),
                "ROLLBACK FAILED, operator intervention required"
            );
            let context = BTreeMap::from([
                ("instrument".to_string(), signal.instrument.as_str().to_string()),
                ("notes".to_string(), outcome.notes.clone().unwrap_or_default()),
                (
                    "put_symbol".to_string(),
                    outcome.put.as_ref().map(|p| p.symbol.clone()).unwrap_or_default(),
                ),
            ]);
            let _ = self.escalate(ConfirmationType::RollbackFailed, context).await;
        }
    }

    // =====================================================================
    // PYRAMID
    // =====================================================================

    async fn handle_pyramid(&self, signal: &Signal, started: DateTime<Utc>) -> ProcessOutcome {
        let instrument = signal.instrument;
        let inst_config = instrument.config();
        let Some(stop) = signal.stop else {
            return ProcessOutcome::error("missing_stop");
        };

        let mut portfolio = self.portfolio.lock().await;

        let Some(base) = portfolio.base_position(instrument).cloned() else {
            EngineStats::bump(&self.stats.pyramids_blocked);
            self.log_audit(signal, self.audit_base(
                signal,
                SignalOutcome::RejectedValidation,
                "no_base_position_found",
                started,
            ))
            .await;
            return ProcessOutcome::blocked("no_base_position");
        };

        // Pyramid gate: price must have advanced at least the configured
        // ATR multiple since the last add, and the level cap must hold.
        if !self.config.test_mode {
            let last_price = portfolio.last_pyramid_price(instrument).unwrap_or(base.entry_price);
            let required_advance = self.config.pyramid_min_atr_advance * signal.atr;
            if signal.price - last_price < required_advance {
                EngineStats::bump(&self.stats.pyramids_blocked);
                let reason = format!(
                    "insufficient_advance: {:.2} < {:.2}",
                    signal.price - last_price,
                    required_advance
                );
                self.log_audit(signal, self.audit_base(
                    signal,
                    SignalOutcome::RejectedRisk,
                    &format!("pyramid_gate_blocked: {reason}"),
                    started,
                ))
                .await;
                return ProcessOutcome::blocked(reason);
            }

            let level = signal.pyramid_level();
            if level >= self.config.max_pyramid_level {
                EngineStats::bump(&self.stats.pyramids_blocked);
                self.log_audit(signal, self.audit_base(
                    signal,
                    SignalOutcome::RejectedRisk,
                    "pyramid_gate_blocked: max_level_reached",
                    started,
                ))
                .await;
                return ProcessOutcome::blocked("max_pyramid_level_reached");
            }
        }

        // Only house money funds the add: profit in excess of the base
        // position's original risk.
        let unrealized =
            (signal.price - base.entry_price) * base.lots as f64 * inst_config.point_value;
        let base_risk =
            (base.entry_price - base.initial_stop) * base.lots as f64 * inst_config.point_value;
        let profit_after_base_risk = (unrealized - base_risk).max(0.0);

        let available_margin = self.broker_available_margin().await;
        let equity_high = portfolio.equity_high;
        let equity = portfolio.closed_equity;

        let constraints = self.sizer.pyramid(
            signal.price,
            stop,
            signal.atr,
            equity_high,
            equity,
            available_margin,
            inst_config.point_value,
            profit_after_base_risk,
            signal.pyramid_level(),
        );

        let sizing_audit = SizingAudit {
            equity_high,
            stop_distance: Some(signal.price - stop),
            atr: signal.atr,
            er: signal.er,
            lots: constraints.final_lots,
            limiter: Some(constraints.limiter.as_str().to_string()),
        };

        if constraints.final_lots == 0 {
            EngineStats::bump(&self.stats.pyramids_blocked);
            tracing::info!(
                base_lots = base.lots,
                unrealized,
                base_risk,
                excess_profit = profit_after_base_risk,
                limiter = constraints.limiter.as_str(),
                "pyramid blocked at zero lots"
            );
            let mut record = self.audit_base(
                signal,
                SignalOutcome::RejectedRisk,
                &format!("zero_lots_calculated: limited by {}", constraints.limiter.as_str()),
                started,
            );
            record.sizing = Some(sizing_audit);
            self.log_audit(signal, record).await;
            return ProcessOutcome::blocked(format!(
                "zero_lots_limited_by_{}",
                constraints.limiter.as_str()
            ));
        }

        let (execution_price, validation) =
            match self.run_execution_validation(signal, SignalKind::Pyramid).await {
                Ok(pair) => pair,
                Err(outcome) => {
                    EngineStats::bump(&self.stats.pyramids_blocked);
                    let mut record = self.audit_base(
                        signal,
                        SignalOutcome::RejectedValidation,
                        "execution_validation_failed",
                        started,
                    );
                    record.sizing = Some(sizing_audit);
                    self.log_audit(signal, record).await;
                    return *outcome;
                }
            };

        // Risk-preserving shrink when the live price moved against us.
        let mut lots = constraints.final_lots;
        let adjusted = self
            .validator
            .adjust_lots_for_execution(signal, execution_price, lots);
        if adjusted != lots {
            tracing::info!(from = lots, to = adjusted, "pyramid size adjusted for broker price");
            lots = adjusted;
            if lots == 0 {
                EngineStats::bump(&self.stats.pyramids_blocked);
                return ProcessOutcome::blocked("zero_lots_after_risk_adjustment");
            }
        }

        let calculated_lots = lots;
        if self.config.test_mode {
            tracing::warn!(calculated_lots, "test mode: overriding pyramid quantity to 1 lot");
            lots = 1;
        }

        let execution = self.execute_entry(signal, instrument, lots, execution_price).await;
        match execution {
            EntryExecution::Synthetic(outcome)
                if outcome.status == order_executor::ExecutionStatus::Executed =>
            {
                let entry_price = outcome.synthetic_price().unwrap_or(execution_price);
                let position = self.build_position(
                    signal,
                    instrument,
                    lots,
                    entry_price,
                    &constraints,
                    false,
                    Some(&outcome),
                    None,
                );
                let est_risk = position.risk_contribution;
                self.commit_entry(&mut portfolio, signal, position, started, sizing_audit, est_risk, available_margin, entry_price)
                    .await
            }
            EntryExecution::Futures(exec) if exec.is_filled() => {
                let filled_lots = exec.lots_filled.unwrap_or(lots);
                let entry_price = exec.execution_price.unwrap_or(execution_price);
                let position = self.build_position(
                    signal,
                    instrument,
                    filled_lots,
                    entry_price,
                    &constraints,
                    false,
                    None,
                    Some(&exec),
                );
                let est_risk = position.risk_contribution;
                self.commit_entry(&mut portfolio, signal, position, started, sizing_audit, est_risk, available_margin, entry_price)
                    .await
            }
            EntryExecution::Synthetic(outcome) => {
                EngineStats::bump(&self.stats.orders_failed);
                let reason = outcome
                    .rejection_reason
                    .clone()
                    .unwrap_or_else(|| "synthetic_execution_failed".to_string());
                self.handle_rollback_escalation(&outcome, signal).await;
                let mut record =
                    self.audit_base(signal, SignalOutcome::FailedOrder, &reason, started);
                record.sizing = Some(sizing_audit);
                record.validation = validation;
                self.log_audit(signal, record).await;
                ProcessOutcome::rejected(
                    "execution_failed",
                    json!({ "execution_reason": reason, "notes": outcome.notes }),
                )
            }
            EntryExecution::Futures(exec) => {
                EngineStats::bump(&self.stats.orders_failed);
                let reason = exec
                    .rejection_reason
                    .clone()
                    .unwrap_or_else(|| "execution_failed".to_string());
                let mut record =
                    self.audit_base(signal, SignalOutcome::FailedOrder, &reason, started);
                record.sizing = Some(sizing_audit);
                record.validation = validation;
                self.log_audit(signal, record).await;
                ProcessOutcome::rejected("execution_failed", json!({ "execution_reason": reason }))
            }
        }
    }

    // =====================================================================
    // EXIT
    // =====================================================================

    pub(crate) async fn handle_exit(&self, signal: &Signal, started: DateTime<Utc>) -> ProcessOutcome {
        let mut portfolio = self.portfolio.lock().await;

        let position_ids = if signal.position.eq_ignore_ascii_case("ALL") {
            portfolio.open_position_ids_for(signal.instrument)
        } else {
            vec![Position::id_for(signal.instrument, &signal.position)]
        };

        if position_ids.is_empty() {
            return ProcessOutcome::error("no_open_positions");
        }

        let mut total_pnl = 0.0;
        let mut closed = 0usize;
        let mut skipped = Vec::new();
        let mut failed = Vec::new();

        for position_id in position_ids {
            match self
                .close_one_position(
                    &mut portfolio,
                    &position_id,
                    signal.price,
                    signal.timestamp,
                    signal.reason.as_deref().unwrap_or("SIGNAL"),
                )
                .await
            {
                CloseResult::Closed(pnl) => {
                    total_pnl += pnl;
                    closed += 1;
                }
                CloseResult::Skipped(reason) => skipped.push(json!({
                    "position_id": position_id, "reason": reason,
                })),
                CloseResult::Failed(reason) => failed.push(json!({
                    "position_id": position_id, "reason": reason,
                })),
            }
        }

        self.stats.exits_executed.fetch_add(closed as u64, std::sync::atomic::Ordering::Relaxed);
        self.persist_portfolio(&portfolio).await;

        let outcome_reason = if failed.is_empty() { "exit_executed" } else { "exit_partial" };
        let outcome_kind = if closed > 0 {
            SignalOutcome::Processed
        } else if !failed.is_empty() {
            SignalOutcome::FailedOrder
        } else {
            SignalOutcome::RejectedValidation
        };
        self.log_audit(signal, self.audit_base(signal, outcome_kind, outcome_reason, started)).await;

        if closed == 0 && !failed.is_empty() {
            return ProcessOutcome::rejected("exit_failed", json!({ "failed": failed }));
        }
        if closed == 0 {
            return ProcessOutcome::skipped("nothing_to_close");
        }
        ProcessOutcome::executed(json!({
            "positions_closed": closed,
            "pnl": total_pnl,
            "skipped": skipped,
            "failed": failed,
        }))
    }

    /// Exit entry point shared with the EOD close path.
    pub(crate) async fn dispatch_exit(&self, signal: &Signal) -> ProcessOutcome {
        self.handle_exit(signal, Utc::now()).await
    }

    /// Close one position with the double-exit guard: the status is flipped
    /// to `closing` and persisted before any order goes out, and reverted if
    /// the close fails.
    async fn close_one_position(
        &self,
        portfolio: &mut Portfolio,
        position_id: &str,
        reference_price: f64,
        timestamp: DateTime<Utc>,
        reason: &str,
    ) -> CloseResult {
        let Some(position) = portfolio.position(position_id).cloned() else {
            tracing::warn!(position_id, "position not found for exit");
            return CloseResult::Failed("position_not_found".to_string());
        };
        if position.status != PositionStatus::Open {
            tracing::info!(position_id, status = position.status.as_str(), "already closing/closed, skipping");
            return CloseResult::Skipped(format!("already_{}", position.status.as_str()));
        }

        if let Some(p) = portfolio.position_mut(position_id) {
            p.status = PositionStatus::Closing;
        }
        if let Some(p) = portfolio.position(position_id).cloned() {
            self.persist_position(&p).await;
        }

        let exit = self.execute_close(&position, reference_price).await;

        match exit {
            Ok(exit_price) => {
                match portfolio.close_position(position_id, exit_price, timestamp) {
                    Ok(pnl) => {
                        if let Some(p) = portfolio.position_mut(position_id) {
                            p.exit_reason = Some(reason.to_string());
                        }
                        if let Some(p) = portfolio.position(position_id).cloned() {
                            self.persist_position(&p).await;
                        }
                        if position.is_base_position {
                            let last = portfolio
                                .last_pyramid_price(position.instrument)
                                .unwrap_or(0.0);
                            self.persist_pyramiding(position.instrument, last, None).await;
                        }
                        tracing::info!(position_id, exit_price, pnl, "exit executed");
                        CloseResult::Closed(pnl)
                    }
                    Err(e) => CloseResult::Failed(e.to_string()),
                }
            }
            Err(reason) => {
                // Revert the guard so a later exit can retry.
                if let Some(p) = portfolio.position_mut(position_id) {
                    p.status = PositionStatus::Open;
                }
                if let Some(p) = portfolio.position(position_id).cloned() {
                    self.persist_position(&p).await;
                }
                EngineStats::bump(&self.stats.orders_failed);
                tracing::error!(position_id, reason = %reason, "exit execution failed");
                CloseResult::Failed(reason)
            }
        }
    }

    /// Execute the closing order(s) and return the effective exit price.
    async fn execute_close(&self, position: &Position, reference_price: f64) -> Result<f64, String> {
        if position.instrument.is_synthetic() {
            let (Some(put_symbol), Some(call_symbol)) =
                (position.put_symbol.as_deref(), position.call_symbol.as_deref())
            else {
                // Without the stored legs we cannot close the right
                // contracts; closing blind would create naked exposure.
                tracing::error!(
                    position_id = %position.position_id,
                    "missing stored leg symbols, manual exit required"
                );
                return Err("missing_stored_symbols_critical".to_string());
            };

            let outcome = self
                .synthetic
                .execute_exit(put_symbol, call_symbol, position.strike, position.lots)
                .await;
            if outcome.status == order_executor::ExecutionStatus::Executed {
                Ok(outcome.synthetic_price().unwrap_or(reference_price))
            } else {
                let mut reason = outcome
                    .rejection_reason
                    .clone()
                    .unwrap_or_else(|| "exit_execution_failed".to_string());
                if let Some(notes) = &outcome.notes {
                    reason = format!("{reason} ({notes})");
                }
                Err(reason)
            }
        } else {
            let symbol = position
                .futures_symbol
                .clone()
                .unwrap_or_else(|| self.current_contract_symbol(position.instrument));
            let exchange = position.instrument.config().exchange.as_str();

            // Exit limit anchors to the live mid when available.
            let limit = match self.broker.quote(&symbol, exchange).await {
                Ok(quote) => quote.mid().unwrap_or(reference_price),
                Err(_) => reference_price,
            };

            let spec = OrderSpec {
                symbol,
                exchange: exchange.to_string(),
                action: OrderAction::Sell,
                lots: position.lots,
                lot_size: position.instrument.config().lot_size,
                signal_price: limit,
            };
            let exec = self.executor.execute(&spec, limit).await;
            if exec.is_filled() {
                Ok(exec.execution_price.unwrap_or(limit))
            } else {
                Err(exec
                    .rejection_reason
                    .unwrap_or_else(|| "exit_execution_failed".to_string()))
            }
        }
    }

    // =====================================================================
    // MARKET_DATA (PM-side stop monitoring)
    // =====================================================================

    async fn handle_market_data(&self, signal: &Signal) -> ProcessOutcome {
        let instrument = signal.instrument;
        let mut portfolio = self.portfolio.lock().await;

        let position_ids = portfolio.open_position_ids_for(instrument);
        if position_ids.is_empty() {
            return ProcessOutcome::skipped("no_positions");
        }

        let mut stops_updated = Vec::new();
        let mut exits_triggered = Vec::new();

        for position_id in position_ids {
            let Some(position) = portfolio.position_mut(&position_id) else { continue };
            if position.status != PositionStatus::Open {
                continue;
            }

            let old_stop = position.current_stop;
            let new_stop = self.stops.update_trailing_stop(position, signal.price, signal.atr);
            position.unrealized_pnl = (signal.price - position.entry_price)
                * position.lots as f64
                * instrument.config().point_value;
            let stop_hit = signal.price < position.current_stop;

            if new_stop > old_stop {
                stops_updated.push(json!({
                    "position_id": position_id,
                    "old_stop": old_stop,
                    "new_stop": new_stop,
                }));
                let snapshot = position.clone();
                self.persist_position(&snapshot).await;
            }

            if stop_hit {
                tracing::warn!(
                    position_id = %position_id,
                    price = signal.price,
                    stop = new_stop,
                    "stop hit, executing PM-initiated exit"
                );
                let result = self
                    .close_one_position(
                        &mut portfolio,
                        &position_id,
                        signal.price,
                        signal.timestamp,
                        "PM_STOP_HIT",
                    )
                    .await;
                if matches!(result, CloseResult::Closed(_)) {
                    EngineStats::bump(&self.stats.pm_stop_exits);
                }
                exits_triggered.push(json!({
                    "position_id": position_id,
                    "stop": new_stop,
                    "price": signal.price,
                    "result": match result {
                        CloseResult::Closed(pnl) => json!({ "status": "closed", "pnl": pnl }),
                        CloseResult::Skipped(r) => json!({ "status": "skipped", "reason": r }),
                        CloseResult::Failed(r) => json!({ "status": "failed", "reason": r }),
                    },
                }));
            }
        }

        if !exits_triggered.is_empty() {
            self.persist_portfolio(&portfolio).await;
        }

        ProcessOutcome {
            status: "processed".to_string(),
            reason: None,
            detail: json!({
                "stops_updated": stops_updated,
                "exits_triggered": exits_triggered,
            }),
        }
    }

    // =====================================================================
    // EOD_MONITOR
    // =====================================================================

    /// Update the per-instrument EOD slot consumed by the pre-close jobs.
    pub async fn process_eod_monitor(
        &self,
        signal: Signal,
        intended: Option<SignalKind>,
        claimed: Option<PositionStatusView>,
    ) -> ProcessOutcome {
        if !self.config.eod_enabled_for(signal.instrument) {
            return ProcessOutcome::skipped("eod_disabled");
        }
        let instrument = signal.instrument;
        let price = signal.price;
        self.eod_monitor.update_signal(signal, intended, claimed, Utc::now());
        tracing::info!(
            instrument = instrument.as_str(),
            price,
            intended = ?intended,
            "EOD monitor updated"
        );
        ProcessOutcome {
            status: "accepted".to_string(),
            reason: None,
            detail: json!({ "instrument": instrument.as_str() }),
        }
    }

    /// Authoritative position view for the EOD decision, straight from the
    /// portfolio the store backs.
    pub async fn authoritative_status(&self, instrument: Instrument) -> PositionStatusView {
        let portfolio = self.portfolio.lock().await;
        let open = portfolio.open_position_count(instrument);
        PositionStatusView {
            in_position: open > 0,
            pyramid_count: open.saturating_sub(1) as u32,
        }
    }

    // =====================================================================
    // Rollover
    // =====================================================================

    /// Scan and roll expiring positions. Runs only during the instrument's
    /// market hours and only when the broker reports live positions on at
    /// least one tape.
    pub async fn run_rollover_check(&self, dry_run: bool) -> BatchRolloverResult {
        let mut batch = BatchRolloverResult::default();
        if !self.config.enable_auto_rollover {
            return batch;
        }

        let mut portfolio = self.portfolio.lock().await;
        let positions: Vec<Position> = portfolio.positions().cloned().collect();
        batch.scanned = positions.len();

        let today = self.today();
        let candidates = self.rollover.scan_candidates(&positions, today);
        batch.candidates = candidates.len();
        if candidates.is_empty() {
            return batch;
        }

        let broker_book = self.broker.positions().await.unwrap_or_default();
        if broker_book.is_empty() {
            tracing::warn!("broker reports no live positions, skipping rollover");
            return batch;
        }

        let now_market = Utc::now().with_timezone(&market_offset());
        for candidate in candidates {
            let cfg = candidate.instrument.config();
            if !symbols::in_market_hours(
                now_market.date_naive(),
                now_market.time(),
                cfg.market_open(),
                cfg.market_close(),
            ) {
                tracing::info!(
                    instrument = candidate.instrument.as_str(),
                    "outside market hours, deferring rollover"
                );
                continue;
            }
            if dry_run {
                tracing::info!(position_id = %candidate.position_id, "dry run, would roll");
                continue;
            }

            let Some(position) = portfolio.position(&candidate.position_id).cloned() else {
                continue;
            };
            let mut rolled = position;
            let result = self
                .rollover
                .rollover_position(&mut rolled, &candidate, Utc::now())
                .await;

            if result.success {
                batch.rolled += 1;
                // Realized P&L from the closed contract moves closed equity.
                if result.close_pnl != 0.0 {
                    portfolio.closed_equity += result.close_pnl;
                    if portfolio.closed_equity > portfolio.equity_high {
                        portfolio.equity_high = portfolio.closed_equity;
                    }
                }
                if let Some(p) = portfolio.position_mut(&candidate.position_id) {
                    *p = rolled.clone();
                }
                self.persist_position(&rolled).await;
                self.persist_portfolio(&portfolio).await;
            } else {
                batch.failed += 1;
                if let Some(p) = portfolio.position_mut(&candidate.position_id) {
                    p.rollover_status = rolled.rollover_status;
                }
                self.persist_position(&rolled).await;
                if result.critical {
                    let context = BTreeMap::from([
                        ("position".to_string(), candidate.position_id.clone()),
                        ("error".to_string(), result.error.clone().unwrap_or_default()),
                    ]);
                    let _ = self.escalate(ConfirmationType::RollbackFailed, context).await;
                }
            }
            batch.results.push(result);
        }
        batch
    }
}

enum EntryExecution {
    Synthetic(SyntheticOutcome),
    Futures(ExecOutcome),
}

enum CloseResult {
    Closed(f64),
    Skipped(String),
    Failed(String),
}
