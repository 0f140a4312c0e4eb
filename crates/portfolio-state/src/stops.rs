use signal_core::{Instrument, Position};

/// Protective-stop arithmetic. Stops only ever ratchet upward while a
/// position is open.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopManager;

impl StopManager {
    /// Initial stop for a new entry: `price − k·ATR` with the instrument's
    /// configured multiple.
    pub fn initial_stop(&self, price: f64, atr: f64, instrument: Instrument) -> f64 {
        price - instrument.config().stop_atr_multiple * atr
    }

    /// Trail the stop on fresh market data. Returns the new stop (unchanged
    /// when the candidate is not an improvement).
    pub fn update_trailing_stop(&self, position: &mut Position, price: f64, atr: f64) -> f64 {
        if price > position.highest_close {
            position.highest_close = price;
        }
        let candidate = price - position.instrument.config().stop_atr_multiple * atr;
        position.raise_stop(candidate);
        position.current_stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn initial_stop_uses_atr_multiple() {
        let stops = StopManager;
        // Bank Nifty multiple is 2.0
        assert_eq!(stops.initial_stop(50_000.0, 100.0, Instrument::BankNifty), 49_800.0);
    }

    #[test]
    fn trailing_stop_ratchets_up_only() {
        let stops = StopManager;
        let ts = Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap();
        let mut p = Position::new(Instrument::BankNifty, "Long_1", ts, 50_000.0, 1, 49_800.0, 100.0);

        let raised = stops.update_trailing_stop(&mut p, 50_500.0, 100.0);
        assert_eq!(raised, 50_300.0);
        assert_eq!(p.highest_close, 50_500.0);

        // Price falls back: stop holds.
        let held = stops.update_trailing_stop(&mut p, 50_100.0, 100.0);
        assert_eq!(held, 50_300.0);
        assert!(p.current_stop >= p.initial_stop);
    }
}
