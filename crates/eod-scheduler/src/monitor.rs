use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::Serialize;

use signal_core::{Instrument, Signal, SignalKind};

/// Authoritative position state, read back from the relational store at
/// each EOD phase. The charting platform is a scout; the engine is the
/// source of truth about whether a position is open.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PositionStatusView {
    pub in_position: bool,
    pub pyramid_count: u32,
}

/// Latest EOD_MONITOR signal for one instrument, together with the action
/// the scout proposed and whatever position status it claimed.
#[derive(Debug, Clone)]
pub struct EodSlot {
    pub signal: Signal,
    pub intended: Option<SignalKind>,
    pub claimed_status: Option<PositionStatusView>,
    pub received_at: DateTime<Utc>,
}

/// Per-instrument execution state across the three EOD phases.
#[derive(Debug, Clone, Default)]
pub struct EodExecutionState {
    pub prepared_kind: Option<SignalKind>,
    pub lots: i32,
    pub order_id: Option<String>,
    pub order_placed_at: Option<DateTime<Utc>>,
    pub execution_completed: bool,
    pub execution_price: Option<f64>,
}

/// Holds the per-instrument "latest signal" slots the scheduler consumes,
/// plus the executed-at-EOD fingerprint marks used to skip the bar-close
/// signal that follows a pre-close execution.
#[derive(Debug, Default)]
pub struct EodMonitor {
    slots: DashMap<Instrument, EodSlot>,
    states: DashMap<Instrument, EodExecutionState>,
    executed: DashSet<String>,
}

impl EodMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_signal(
        &self,
        signal: Signal,
        intended: Option<SignalKind>,
        claimed_status: Option<PositionStatusView>,
        now: DateTime<Utc>,
    ) {
        let instrument = signal.instrument;
        self.slots.insert(
            instrument,
            EodSlot { signal, intended, claimed_status, received_at: now },
        );
        tracing::debug!(
            instrument = instrument.as_str(),
            intended = ?intended,
            "EOD monitor slot updated"
        );
    }

    pub fn latest(&self, instrument: Instrument) -> Option<EodSlot> {
        self.slots.get(&instrument).map(|s| s.clone())
    }

    /// Decide whether the proposed action is admissible given the
    /// authoritative position state. The scout's claimed status is ignored;
    /// the store's view wins.
    pub fn decide_action(
        &self,
        instrument: Instrument,
        authoritative: PositionStatusView,
    ) -> Option<SignalKind> {
        let slot = self.slots.get(&instrument)?;
        let intended = slot.intended?;

        if let Some(claimed) = slot.claimed_status {
            if claimed.in_position != authoritative.in_position
                || claimed.pyramid_count != authoritative.pyramid_count
            {
                tracing::warn!(
                    instrument = instrument.as_str(),
                    claimed_in_position = claimed.in_position,
                    db_in_position = authoritative.in_position,
                    claimed_pyramids = claimed.pyramid_count,
                    db_pyramids = authoritative.pyramid_count,
                    "scout position state disagrees with store, using store"
                );
            }
        }

        let admissible = match intended {
            SignalKind::BaseEntry => !authoritative.in_position,
            SignalKind::Pyramid | SignalKind::Exit => authoritative.in_position,
            _ => false,
        };
        admissible.then_some(intended)
    }

    pub fn execution_state(&self, instrument: Instrument) -> EodExecutionState {
        self.states.get(&instrument).map(|s| s.clone()).unwrap_or_default()
    }

    pub fn mark_prepared(&self, instrument: Instrument, kind: SignalKind, lots: i32) {
        let mut state = self.states.entry(instrument).or_default();
        state.prepared_kind = Some(kind);
        state.lots = lots;
        state.order_id = None;
        state.execution_completed = false;
        state.execution_price = None;
    }

    pub fn mark_order_placed(&self, instrument: Instrument, order_id: &str, now: DateTime<Utc>) {
        let mut state = self.states.entry(instrument).or_default();
        state.order_id = Some(order_id.to_string());
        state.order_placed_at = Some(now);
    }

    pub fn mark_filled(&self, instrument: Instrument, price: f64) {
        let mut state = self.states.entry(instrument).or_default();
        state.execution_completed = true;
        state.execution_price = Some(price);
    }

    pub fn clear_state(&self, instrument: Instrument) {
        self.states.remove(&instrument);
    }

    /// Mark a signal fingerprint as executed at EOD so the bar-close signal
    /// carrying the same timestamp gets skipped.
    pub fn mark_executed(&self, eod_fingerprint: &str, kind: SignalKind) {
        self.executed.insert(keyed(eod_fingerprint, kind));
    }

    pub fn was_executed_at_eod(&self, eod_fingerprint: &str, kind: SignalKind) -> bool {
        self.executed.contains(&keyed(eod_fingerprint, kind))
    }
}

fn keyed(fingerprint: &str, kind: SignalKind) -> String {
    format!("{}:{}", fingerprint, kind.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn eod_signal(instrument: Instrument) -> Signal {
        Signal {
            instrument,
            kind: SignalKind::EodMonitor,
            position: "Long_2".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 6, 2, 17, 54, 0).unwrap(),
            price: 52_100.0,
            stop: Some(51_900.0),
            suggested_lots: Some(10),
            atr: 120.0,
            er: 0.6,
            supertrend: 51_700.0,
            reason: None,
        }
    }

    #[test]
    fn db_truth_wins_over_scout_claim() {
        let monitor = EodMonitor::new();
        let now = Utc::now();
        monitor.update_signal(
            eod_signal(Instrument::BankNifty),
            Some(SignalKind::Pyramid),
            Some(PositionStatusView { in_position: true, pyramid_count: 1 }),
            now,
        );

        // Store says flat: a pyramid is not admissible, whatever the scout says.
        let flat = PositionStatusView { in_position: false, pyramid_count: 0 };
        assert_eq!(monitor.decide_action(Instrument::BankNifty, flat), None);

        // Store confirms the position at T-30: the action proceeds.
        let open = PositionStatusView { in_position: true, pyramid_count: 1 };
        assert_eq!(
            monitor.decide_action(Instrument::BankNifty, open),
            Some(SignalKind::Pyramid)
        );
    }

    #[test]
    fn base_entry_requires_flat_book() {
        let monitor = EodMonitor::new();
        monitor.update_signal(
            eod_signal(Instrument::GoldMini),
            Some(SignalKind::BaseEntry),
            None,
            Utc::now(),
        );

        let open = PositionStatusView { in_position: true, pyramid_count: 0 };
        assert_eq!(monitor.decide_action(Instrument::GoldMini, open), None);

        let flat = PositionStatusView::default();
        assert_eq!(
            monitor.decide_action(Instrument::GoldMini, flat),
            Some(SignalKind::BaseEntry)
        );
    }

    #[test]
    fn no_slot_or_no_intent_means_no_action() {
        let monitor = EodMonitor::new();
        assert_eq!(
            monitor.decide_action(Instrument::BankNifty, PositionStatusView::default()),
            None
        );

        monitor.update_signal(eod_signal(Instrument::BankNifty), None, None, Utc::now());
        assert_eq!(
            monitor.decide_action(Instrument::BankNifty, PositionStatusView::default()),
            None
        );
    }

    #[test]
    fn executed_fingerprints_are_kind_specific() {
        let monitor = EodMonitor::new();
        monitor.mark_executed("BANK_NIFTY:2025-06-02T17:55:00+00:00", SignalKind::Pyramid);

        assert!(monitor.was_executed_at_eod(
            "BANK_NIFTY:2025-06-02T17:55:00+00:00",
            SignalKind::Pyramid
        ));
        // A different kind on the same bar is not blocked.
        assert!(!monitor.was_executed_at_eod(
            "BANK_NIFTY:2025-06-02T17:55:00+00:00",
            SignalKind::Exit
        ));
    }

    #[test]
    fn execution_state_lifecycle() {
        let monitor = EodMonitor::new();
        let now = Utc::now();

        monitor.mark_prepared(Instrument::BankNifty, SignalKind::Pyramid, 10);
        monitor.mark_order_placed(Instrument::BankNifty, "ORD-9", now);
        let state = monitor.execution_state(Instrument::BankNifty);
        assert_eq!(state.prepared_kind, Some(SignalKind::Pyramid));
        assert_eq!(state.order_id.as_deref(), Some("ORD-9"));
        assert!(!state.execution_completed);

        monitor.mark_filled(Instrument::BankNifty, 52_120.0);
        assert!(monitor.execution_state(Instrument::BankNifty).execution_completed);

        monitor.clear_state(Instrument::BankNifty);
        assert!(monitor.execution_state(Instrument::BankNifty).prepared_kind.is_none());
    }
}
